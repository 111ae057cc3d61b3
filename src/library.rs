//! The write coordinator.
//!
//! # Overview
//!
//! A [`Library`] is the handle through which every read and write of one
//! library directory goes. It owns the [`FileStore`] (canonical files), the
//! [`IndexStore`] connection (behind a mutex), the [`CacheStore`], the
//! [`SimilarityEngine`] worker pool and the [`EventBus`].
//!
//! # Dual write
//!
//! A save writes the canonical record first. Only once that has succeeded is
//! the index updated. An index failure never fails the save: it is logged,
//! reported as [`LibraryEvent::IndexWriteFailed`], and the entity is marked
//! stale so reads of it bypass the index until a later write or rebuild
//! repairs it. After `index_failure_threshold` consecutive index failures the
//! state escalates to [`IndexState::RebuildAvailable`].
//!
//! # Rebuild
//!
//! [`Library::rebuild_index`] writes a fresh index next to `library.db`
//! without holding the index lock, so reads and writes continue against the
//! prior index meanwhile. Writes made during the rebuild are re-applied to
//! the fresh index right after it is swapped in.
//!
//! # Example
//!
//! ```no_run
//! use tagstore::config::StoreConfig;
//! use tagstore::model::MediaEntity;
//! use tagstore::Library;
//!
//! let library = Library::create("/photos/library", "Photos", StoreConfig::default()).unwrap();
//! let mut entity = MediaEntity::new("a1b2c3d4e5f60718");
//! entity.add_tag("class", "lake");
//! library.save_entity(&entity).unwrap();
//!
//! let lakes = library.query_by_tag_filter("class:lake").unwrap();
//! assert_eq!(lakes.len(), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{ArtifactKind, CacheStore};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, LibraryEvent};
use crate::index::{IndexStore, RebuildReport, Rebuilder, TagCount, TagFilter};
use crate::model::{compute_identity, Identity, MediaEntity, Tag, RELATION_SIMILAR};
use crate::progress::ProgressCallback;
use crate::similarity::{
    Clustering, Fingerprint, FingerprintEntry, PerceptualAlgorithm, PerceptualHasher,
    SimilarityEngine,
};
use crate::store::{FileStore, LibraryLayout, LibraryManifest};

/// Health of the index as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// The index is in step with the files.
    Ready,
    /// Some entities failed to index; reads of those use the files.
    Stale,
    /// Index failures reached the threshold; a rebuild is recommended.
    RebuildAvailable,
    /// No usable index; every read scans the files.
    Unavailable,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Stale => write!(f, "stale"),
            Self::RebuildAvailable => write!(f, "rebuild available"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Result of a successful save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Set when the canonical write succeeded but the index write did not.
    pub index_warning: Option<String>,
}

/// Result of a clustering pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterReport {
    pub clustering: Clustering,
    /// Candidates excluded because they could not be fingerprinted.
    pub failures: Vec<(Identity, String)>,
    /// Entities whose `similar` relations changed.
    pub updated: usize,
}

/// Snapshot of a library for display.
#[derive(Debug, Clone)]
pub struct LibraryStatus {
    pub root: PathBuf,
    pub library_name: String,
    pub records: usize,
    pub indexed: Option<u64>,
    pub index_state: IndexState,
    pub stale: usize,
    pub full_text_search: bool,
    pub cache_bytes: u64,
}

struct IndexSlot {
    store: Option<IndexStore>,
    state: IndexState,
    consecutive_failures: u32,
    stale: HashSet<Identity>,
    rebuilding: bool,
    /// Identities written while a rebuild was running.
    pending: Vec<Identity>,
}

impl IndexSlot {
    fn usable(&self) -> Option<&IndexStore> {
        self.store.as_ref()
    }
}

/// Handle on one open library.
pub struct Library {
    layout: LibraryLayout,
    files: FileStore,
    index: Mutex<IndexSlot>,
    cache: CacheStore,
    similarity: SimilarityEngine,
    events: EventBus,
    manifest: Mutex<LibraryManifest>,
    config: StoreConfig,
}

impl Library {
    /// Create a library at `root`, or open it if it already exists.
    pub fn create(
        root: impl Into<PathBuf>,
        library_name: &str,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let layout = LibraryLayout::new(root);
        let root = layout.root().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;

        let manifest_path = layout.manifest_path();
        if !manifest_path.is_file() {
            LibraryManifest::new(library_name).save(&manifest_path)?;
            log::info!("Created library {:?} at {}", library_name, root.display());
        }
        // Existing records are indexed by the rebuild in `open` instead.
        if !layout.index_path().exists() && !layout.images_dir().exists() {
            IndexStore::create(&layout.index_path())?.close()?;
        }
        Self::open(root, config)
    }

    /// Open an existing library.
    ///
    /// A missing, unreadable or outdated index does not fail the open: it is
    /// rebuilt when `auto_rebuild` is set and left unavailable otherwise.
    pub fn open(root: impl Into<PathBuf>, config: StoreConfig) -> StoreResult<Self> {
        let layout = LibraryLayout::new(root);
        if !layout.root().is_dir() {
            return Err(StoreError::io(
                layout.root(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "library directory not found"),
            ));
        }

        let files = FileStore::new(layout.clone());
        files.ensure_dirs()?;
        let cache = CacheStore::new(&layout, &config);
        cache.ensure_dirs()?;
        let manifest = LibraryManifest::load(&layout.manifest_path())?;

        let (store, state) = match IndexStore::open(&layout.index_path()) {
            Ok(store) => (Some(store), IndexState::Ready),
            Err(e) => {
                log::warn!("Index unavailable: {}", e);
                (None, IndexState::Unavailable)
            }
        };

        let library = Self {
            similarity: SimilarityEngine::new(config.worker_threads),
            index: Mutex::new(IndexSlot {
                store,
                state,
                consecutive_failures: 0,
                stale: HashSet::new(),
                rebuilding: false,
                pending: Vec::new(),
            }),
            layout,
            files,
            cache,
            events: EventBus::new(),
            manifest: Mutex::new(manifest),
            config,
        };

        if state == IndexState::Unavailable && library.config.auto_rebuild {
            log::info!("Rebuilding missing or unreadable index");
            if let Err(e) = library.rebuild_index(None, None) {
                log::warn!("Automatic index rebuild failed: {}", e);
            }
        }
        Ok(library)
    }

    fn slot(&self) -> MutexGuard<'_, IndexSlot> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn note_index_failure(&self, slot: &mut IndexSlot, identity: Option<&Identity>, reason: &str) {
        slot.consecutive_failures += 1;
        if let Some(identity) = identity {
            slot.stale.insert(identity.clone());
            log::warn!("Index write failed for {}: {}", identity, reason);
            self.events.emit(LibraryEvent::IndexWriteFailed {
                identity: identity.clone(),
                reason: reason.to_string(),
            });
        } else {
            log::warn!("Index read failed, using files: {}", reason);
        }

        if slot.consecutive_failures >= self.config.index_failure_threshold
            && slot.state != IndexState::Unavailable
        {
            if slot.state != IndexState::RebuildAvailable {
                log::warn!(
                    "{} consecutive index failures, a rebuild is recommended",
                    slot.consecutive_failures
                );
                self.events
                    .emit(LibraryEvent::IndexUnavailable(reason.to_string()));
            }
            slot.state = IndexState::RebuildAvailable;
        } else if slot.state == IndexState::Ready {
            slot.state = IndexState::Stale;
        }
    }

    fn note_index_success(slot: &mut IndexSlot, identity: Option<&Identity>) {
        slot.consecutive_failures = 0;
        if let Some(identity) = identity {
            slot.stale.remove(identity);
        }
        if slot.state == IndexState::Stale && slot.stale.is_empty() {
            slot.state = IndexState::Ready;
        }
    }

    /// Persist an entity.
    ///
    /// # Errors
    ///
    /// Only failures of the canonical write are returned. An index failure
    /// is reported through [`SaveOutcome::index_warning`].
    pub fn save_entity(&self, entity: &MediaEntity) -> StoreResult<SaveOutcome> {
        self.files.save(entity)?;

        let mut outcome = SaveOutcome::default();
        {
            let mut slot = self.slot();
            if slot.rebuilding {
                slot.pending.push(entity.identity.clone());
            }
            let result = slot.store.as_mut().map(|store| store.upsert(entity));
            match result {
                Some(Ok(())) => Self::note_index_success(&mut slot, Some(&entity.identity)),
                Some(Err(e)) => {
                    let reason = e.to_string();
                    self.note_index_failure(&mut slot, Some(&entity.identity), &reason);
                    outcome.index_warning = Some(reason);
                }
                None => {
                    outcome.index_warning = Some("index unavailable".to_string());
                }
            }
        }

        self.events
            .emit(LibraryEvent::EntitySaved(entity.identity.clone()));
        Ok(outcome)
    }

    /// Copy a media file into `images/` under its content identity and save
    /// an image record for it, keeping the existing record if there is one.
    ///
    /// Tags in `tags` are appended unless the record already carries them.
    pub fn import_media(&self, path: &Path, tags: &[Tag]) -> StoreResult<MediaEntity> {
        let identity = compute_identity(path).map_err(|e| StoreError::io(path, e))?;
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| StoreError::GenerationFailed {
                identity: identity.clone(),
                reason: format!("{} has no file extension", path.display()),
            })?;

        let target = self.layout.media_path(&identity, &extension);
        if !target.is_file() {
            fs::copy(path, &target).map_err(|e| StoreError::io(&target, e))?;
            log::debug!("Copied {} to {}", path.display(), target.display());
        }

        let mut entity = match self.files.load(&identity) {
            Ok(existing) => existing,
            Err(StoreError::NotFound(_)) => {
                let mut entity = MediaEntity::new(identity.clone());
                if let Some(stem) = path.file_stem() {
                    entity.name = stem.to_string_lossy().into_owned();
                }
                entity
            }
            Err(e) => return Err(e),
        };
        for tag in tags {
            if !entity.tags.contains(tag) {
                entity.tags.push(tag.clone());
            }
        }
        self.save_entity(&entity)?;
        log::info!("Imported {} as {}", path.display(), identity);
        Ok(entity)
    }

    /// Load an entity, from the index when it is trustworthy, else from its file.
    pub fn load_entity(&self, identity: &Identity) -> StoreResult<MediaEntity> {
        {
            let mut slot = self.slot();
            if !slot.stale.contains(identity) {
                let result = slot.usable().map(|store| store.load(identity));
                match result {
                    Some(Ok(Some(entity))) => return Ok(entity),
                    Some(Ok(None)) | None => {}
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        self.note_index_failure(&mut slot, None, &reason);
                    }
                }
            }
        }
        self.files.load(identity)
    }

    /// Move an entity's files to `deleted/` and drop it from the index.
    ///
    /// Returns the new locations of the moved files.
    pub fn soft_delete_entity(&self, identity: &Identity) -> StoreResult<Vec<PathBuf>> {
        let moved = self.files.soft_delete(identity)?;

        if let Err(e) = self.cache.invalidate(identity) {
            log::warn!("Failed to drop cached artifacts of {}: {}", identity, e);
        }

        {
            let mut slot = self.slot();
            if slot.rebuilding {
                slot.pending.push(identity.clone());
            }
            let result = slot.store.as_ref().map(|store| store.delete(identity));
            match result {
                Some(Ok(_)) => Self::note_index_success(&mut slot, Some(identity)),
                Some(Err(e)) => {
                    let reason = e.to_string();
                    self.note_index_failure(&mut slot, Some(identity), &reason);
                }
                None => {}
            }
        }

        self.events.emit(LibraryEvent::EntityDeleted(identity.clone()));
        Ok(moved)
    }

    /// Identities whose tags satisfy a filter expression, ascending.
    pub fn query_by_tag_filter(&self, expression: &str) -> StoreResult<Vec<Identity>> {
        let filter = TagFilter::parse(expression)?;

        let indexed = {
            let mut slot = self.slot();
            let result = slot.usable().map(|store| store.query(&filter));
            match result {
                Some(Ok(ids)) => Some((ids, slot.stale.clone())),
                Some(Err(e)) if !e.is_index_fault() => {
                    log::debug!("Answering from files: {}", e);
                    None
                }
                Some(Err(e)) => {
                    let reason = e.to_string();
                    self.note_index_failure(&mut slot, None, &reason);
                    None
                }
                None => None,
            }
        };

        match indexed {
            Some((ids, stale)) => {
                let mut found: BTreeSet<Identity> = ids.into_iter().collect();
                for identity in stale {
                    found.remove(&identity);
                    if let Ok(entity) = self.files.load(&identity) {
                        if filter.matches(&entity.tags) {
                            found.insert(identity);
                        }
                    }
                }
                Ok(found.into_iter().collect())
            }
            None => Ok(self.scan_matching(&filter)),
        }
    }

    /// Evaluate a filter against every canonical record.
    fn scan_matching(&self, filter: &TagFilter) -> Vec<Identity> {
        let mut found: Vec<Identity> = self
            .files
            .scan_all()
            .filter_map(|identity| match self.files.load(&identity) {
                Ok(entity) => filter.matches(&entity.tags).then_some(identity),
                Err(e) => {
                    log::warn!("Skipping {} during scan: {}", identity, e);
                    None
                }
            })
            .collect();
        found.sort();
        found
    }

    /// Every known identity, ascending.
    pub fn list_identities(&self) -> StoreResult<Vec<Identity>> {
        self.query_by_tag_filter("")
    }

    /// Tags matching free text, most used first.
    pub fn search_tags(&self, text: &str, limit: usize) -> StoreResult<Vec<TagCount>> {
        {
            let mut slot = self.slot();
            let result = slot.usable().map(|store| store.search_tags(text, limit));
            match result {
                Some(Ok(found)) => return Ok(found),
                Some(Err(e)) => {
                    let reason = e.to_string();
                    self.note_index_failure(&mut slot, None, &reason);
                }
                None => {}
            }
        }

        let needle = text.to_lowercase();
        let mut counts: BTreeMap<Tag, BTreeSet<Identity>> = BTreeMap::new();
        for identity in self.files.scan_all() {
            let Ok(entity) = self.files.load(&identity) else {
                continue;
            };
            for tag in entity.tags {
                if tag.full().to_lowercase().contains(&needle) {
                    counts.entry(tag).or_default().insert(identity.clone());
                }
            }
        }
        let mut found: Vec<TagCount> = counts
            .into_iter()
            .map(|(tag, ids)| TagCount {
                tag,
                count: ids.len() as u64,
            })
            .collect();
        found.sort_by(|a, b| b.count.cmp(&a.count));
        found.truncate(limit);
        Ok(found)
    }

    fn media_source(&self, identity: &Identity, source: Option<&Path>) -> StoreResult<PathBuf> {
        if !identity.is_valid_key() {
            return Err(StoreError::InvalidIdentity(identity.to_string()));
        }
        if let Some(source) = source {
            return Ok(source.to_path_buf());
        }
        if !self.files.exists(identity) {
            return Err(StoreError::NotFound(identity.clone()));
        }
        self.files
            .locate_media(identity)
            .ok_or_else(|| StoreError::GenerationFailed {
                identity: identity.clone(),
                reason: "no media file found".to_string(),
            })
    }

    /// Path of the entity's thumbnail, generated on first request.
    pub fn request_thumbnail(
        &self,
        identity: &Identity,
        source: Option<&Path>,
    ) -> StoreResult<PathBuf> {
        let source = self.media_source(identity, source)?;
        self.cache.get_or_generate(
            identity,
            ArtifactKind::Thumbnail,
            self.config.thumbnail_size,
            &source,
        )
    }

    /// Path of a preview whose longest side is at most `max_dim`.
    pub fn request_preview(
        &self,
        identity: &Identity,
        max_dim: Option<u32>,
        source: Option<&Path>,
    ) -> StoreResult<PathBuf> {
        let source = self.media_source(identity, source)?;
        let size = max_dim.unwrap_or(self.config.default_preview_dim);
        self.cache
            .get_or_generate(identity, ArtifactKind::Preview, size, &source)
    }

    /// Regenerate the index from the canonical files and swap it in.
    ///
    /// # Errors
    ///
    /// [`StoreError::Cancelled`] if `cancel` was set; the prior index stays
    /// in place and in use.
    pub fn rebuild_index(
        &self,
        progress: Option<Arc<dyn ProgressCallback>>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> StoreResult<RebuildReport> {
        {
            let mut slot = self.slot();
            if slot.rebuilding {
                return Err(StoreError::IndexUnavailable(
                    "a rebuild is already running".to_string(),
                ));
            }
            slot.rebuilding = true;
            slot.pending.clear();
        }

        let index_path = self.layout.index_path();
        let temp_path = self.layout.rebuild_path();
        let mut rebuilder = Rebuilder::new(&self.files, &temp_path).with_prior(&index_path);
        if let Some(cb) = progress {
            rebuilder = rebuilder.with_progress(cb);
        }
        if let Some(flag) = cancel {
            rebuilder = rebuilder.with_shutdown_flag(flag);
        }

        let (fresh, report) = match rebuilder.run() {
            Ok(built) => built,
            Err(e) => {
                let mut slot = self.slot();
                slot.rebuilding = false;
                slot.pending.clear();
                return Err(e);
            }
        };

        let mut slot = self.slot();
        let swapped = self.swap_in(&mut slot, fresh, &index_path, &temp_path);
        slot.rebuilding = false;
        let pending = std::mem::take(&mut slot.pending);
        swapped?;

        slot.stale.clear();
        slot.consecutive_failures = 0;
        slot.state = IndexState::Ready;
        let mut reapplied = HashSet::new();
        for identity in pending {
            if reapplied.insert(identity.clone()) {
                self.reapply(&mut slot, &identity);
            }
        }
        drop(slot);

        log::debug!("Swapped rebuilt index into {}", index_path.display());
        self.events.emit(LibraryEvent::IndexRebuilt {
            indexed: report.indexed,
            corrupt: report.corrupt.len(),
        });
        Ok(report)
    }

    fn swap_in(
        &self,
        slot: &mut IndexSlot,
        fresh: IndexStore,
        index_path: &Path,
        temp_path: &Path,
    ) -> StoreResult<()> {
        fresh.close()?;
        if let Some(old) = slot.store.take() {
            if let Err(e) = old.close() {
                log::warn!("Failed to close prior index cleanly: {}", e);
            }
        }

        if let Err(e) = fs::rename(temp_path, index_path) {
            slot.store = IndexStore::open(index_path).ok();
            if slot.store.is_none() {
                slot.state = IndexState::Unavailable;
            }
            return Err(StoreError::io(index_path, e));
        }

        match IndexStore::open(index_path) {
            Ok(store) => {
                slot.store = Some(store);
                Ok(())
            }
            Err(e) => {
                slot.state = IndexState::Unavailable;
                self.events.emit(LibraryEvent::IndexUnavailable(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Bring one identity in the fresh index in line with its file.
    fn reapply(&self, slot: &mut IndexSlot, identity: &Identity) {
        let Some(store) = slot.store.as_mut() else {
            return;
        };
        let result = match self.files.load(identity) {
            Ok(entity) => store.upsert(&entity).map_err(|e| e.to_string()),
            Err(StoreError::NotFound(_)) => store.delete(identity).map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(reason) = result {
            self.note_index_failure(slot, Some(identity), &reason);
        }
    }

    /// Fingerprint of an entity's media.
    ///
    /// The stored fingerprint is returned unless `refresh` is set or none
    /// exists; a newly computed one is stored in the index.
    pub fn compute_fingerprint(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
        refresh: bool,
    ) -> StoreResult<Fingerprint> {
        if !refresh {
            if let Some(stored) = self.stored_fingerprint(identity, algorithm) {
                return Ok(stored);
            }
        }

        let source = self.media_source(identity, None)?;
        let fingerprint = PerceptualHasher::new(algorithm)
            .compute(&source)
            .map_err(|e| StoreError::GenerationFailed {
                identity: identity.clone(),
                reason: e.to_string(),
            })?;
        self.store_fingerprint(identity, algorithm, &fingerprint);
        Ok(fingerprint)
    }

    fn stored_fingerprint(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
    ) -> Option<Fingerprint> {
        let slot = self.slot();
        let store = slot.usable()?;
        match store.get_fingerprint(identity, algorithm) {
            Ok(found) => found.map(|s| s.fingerprint),
            Err(e) => {
                log::warn!("Failed to read fingerprint of {}: {}", identity, e);
                None
            }
        }
    }

    fn store_fingerprint(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
        fingerprint: &Fingerprint,
    ) {
        let slot = self.slot();
        if let Some(store) = slot.usable() {
            if let Err(e) = store.put_fingerprint(identity, algorithm, fingerprint) {
                log::warn!("Failed to store fingerprint of {}: {}", identity, e);
            }
        }
    }

    /// Entities within `max_distance` of `identity`, nearest first.
    ///
    /// Only entities with a stored fingerprint are considered.
    pub fn find_similar(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
        max_distance: Option<u32>,
    ) -> StoreResult<Vec<(Identity, u32)>> {
        self.compute_fingerprint(identity, algorithm, false)?;
        let max_distance = max_distance.unwrap_or_else(|| self.config.threshold_for(algorithm));

        let slot = self.slot();
        let store = slot
            .usable()
            .ok_or_else(|| StoreError::IndexUnavailable("no index is open".to_string()))?;
        Ok(store
            .find_similar(identity, algorithm, max_distance)?
            .unwrap_or_default())
    }

    /// Cluster candidates by perceptual similarity and record `similar` edges.
    ///
    /// Missing fingerprints are computed on the worker pool. Edges are
    /// written symmetrically, with the distance as strength, only once the
    /// whole pass has completed uncancelled.
    pub fn cluster_similar(
        &self,
        candidates: &[Identity],
        algorithm: PerceptualAlgorithm,
        max_distance: Option<u32>,
        progress: Option<Arc<dyn ProgressCallback>>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> StoreResult<ClusterReport> {
        let max_distance = max_distance.unwrap_or_else(|| self.config.threshold_for(algorithm));
        let mut report = ClusterReport::default();
        let mut entries = Vec::with_capacity(candidates.len());
        let mut jobs = Vec::new();

        let unique: BTreeSet<&Identity> = candidates.iter().collect();
        for identity in unique {
            if !self.files.exists(identity) {
                let e = StoreError::NotFound(identity.clone());
                log::warn!("Excluding {} from clustering: {}", identity, e);
                report.failures.push((identity.clone(), e.to_string()));
                continue;
            }
            if let Some(fingerprint) = self.stored_fingerprint(identity, algorithm) {
                entries.push(FingerprintEntry {
                    identity: identity.clone(),
                    fingerprint,
                });
                continue;
            }
            match self.media_source(identity, None) {
                Ok(path) => jobs.push((identity.clone(), path)),
                Err(e) => {
                    log::warn!("Excluding {} from clustering: {}", identity, e);
                    report.failures.push((identity.clone(), e.to_string()));
                }
            }
        }

        let computed = self.similarity.fingerprint_many(
            jobs,
            algorithm,
            cancel.as_deref(),
            progress.as_ref(),
        )?;
        for (identity, result) in computed {
            match result {
                Ok(fingerprint) => {
                    self.store_fingerprint(&identity, algorithm, &fingerprint);
                    entries.push(FingerprintEntry {
                        identity,
                        fingerprint,
                    });
                }
                Err(e) => report.failures.push((identity, e.to_string())),
            }
        }

        report.clustering = self.similarity.cluster(
            &entries,
            max_distance,
            cancel.as_deref(),
            progress.as_ref(),
        )?;

        let mut neighbours: BTreeMap<&Identity, Vec<(&Identity, u32)>> = BTreeMap::new();
        for edge in &report.clustering.edges {
            neighbours.entry(&edge.from).or_default().push((&edge.to, edge.distance));
            neighbours.entry(&edge.to).or_default().push((&edge.from, edge.distance));
        }
        let mut updated = 0;
        for (identity, others) in neighbours {
            match self.link_similar(identity, &others) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to record similar edges of {}: {}", identity, e);
                    report.failures.push((identity.clone(), e.to_string()));
                }
            }
        }
        report.updated = updated;

        log::info!(
            "Clustered {} entities into {} clusters, {} updated",
            entries.len(),
            report.clustering.clusters.len(),
            updated
        );
        Ok(report)
    }

    /// Add `similar` edges to one entity. Returns whether it changed.
    fn link_similar(&self, identity: &Identity, others: &[(&Identity, u32)]) -> StoreResult<bool> {
        let mut entity = self.files.load(identity)?;
        let before = entity.clone();
        for (other, distance) in others {
            entity.add_related(RELATION_SIMILAR, (*other).clone());
            entity.set_relation_strength(RELATION_SIMILAR, (*other).clone(), f64::from(*distance));
        }
        if entity == before {
            return Ok(false);
        }
        self.save_entity(&entity)?;
        Ok(true)
    }

    /// Bytes used by cached artifacts.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.cache.size_on_disk()
    }

    /// Remove all cached artifacts.
    pub fn clear_cache(&self) -> StoreResult<()> {
        self.cache.clear_all()?;
        self.events.emit(LibraryEvent::CacheCleared);
        Ok(())
    }

    /// Remove the cached artifacts of one entity.
    pub fn invalidate_cache(&self, identity: &Identity) -> StoreResult<usize> {
        self.cache.invalidate(identity)
    }

    /// Store a named filter in the manifest after checking that it parses.
    pub fn save_filter(&self, name: &str, expression: &str) -> StoreResult<()> {
        TagFilter::parse(expression)?;
        let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        manifest.set_saved_filter(name, expression);
        manifest.save(&self.layout.manifest_path())
    }

    pub fn remove_filter(&self, name: &str) -> StoreResult<bool> {
        let mut manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        if !manifest.remove_saved_filter(name) {
            return Ok(false);
        }
        manifest.save(&self.layout.manifest_path())?;
        Ok(true)
    }

    /// Saved filters, by name.
    #[must_use]
    pub fn saved_filters(&self) -> Vec<(String, String)> {
        let manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
        manifest
            .filters
            .iter()
            .filter_map(|(name, expr)| Some((name.clone(), expr.as_str()?.to_string())))
            .collect()
    }

    /// Run a saved filter.
    pub fn query_saved_filter(&self, name: &str) -> StoreResult<Option<Vec<Identity>>> {
        let expression = {
            let manifest = self.manifest.lock().unwrap_or_else(|p| p.into_inner());
            manifest.saved_filter(name).map(str::to_string)
        };
        expression
            .map(|expr| self.query_by_tag_filter(&expr))
            .transpose()
    }

    #[must_use]
    pub fn manifest(&self) -> LibraryManifest {
        self.manifest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Receive [`LibraryEvent`]s emitted from now on.
    pub fn subscribe(&self) -> Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn index_state(&self) -> IndexState {
        self.slot().state
    }

    /// Relations of other entities pointing at `identity`, from the index.
    pub fn incoming_relations(
        &self,
        identity: &Identity,
    ) -> StoreResult<BTreeMap<String, Vec<Identity>>> {
        let slot = self.slot();
        let store = slot
            .usable()
            .ok_or_else(|| StoreError::IndexUnavailable("no index is open".to_string()))?;
        Ok(store.incoming(identity)?)
    }

    pub fn status(&self) -> LibraryStatus {
        let (indexed, index_state, stale, full_text_search) = {
            let slot = self.slot();
            (
                slot.usable().and_then(|s| s.count().ok()),
                slot.state,
                slot.stale.len(),
                slot.usable().is_some_and(IndexStore::has_fts),
            )
        };
        LibraryStatus {
            root: self.layout.root().to_path_buf(),
            library_name: self.manifest().library_name,
            records: self.files.count_estimate(),
            indexed,
            index_state,
            stale,
            full_text_search,
            cache_bytes: self.cache_size(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> &LibraryLayout {
        &self.layout
    }

    #[must_use]
    pub fn files(&self) -> &FileStore {
        &self.files
    }
}
