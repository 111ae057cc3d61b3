//! Canonical per-entity files.
//!
//! # Overview
//!
//! The [`FileStore`] owns the `images/` directory of a library. Every entity
//! is stored as `<identity>.json` with an optional `<identity>.txt` caption
//! sidecar next to the media file itself. These files are the source of
//! truth: the index and the cache can always be regenerated from them.
//!
//! A write through the file store is the only write whose failure is fatal
//! to a save.
//!
//! # Example
//!
//! ```no_run
//! use tagstore::model::MediaEntity;
//! use tagstore::store::{FileStore, LibraryLayout};
//!
//! let store = FileStore::new(LibraryLayout::new("/photos/library"));
//! let mut entity = MediaEntity::new("a1b2c3d4e5f60718");
//! entity.add_tag("class", "lake");
//! store.save(&entity).unwrap();
//!
//! for identity in store.scan_all() {
//!     println!("{}", identity);
//! }
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::atomic::write_atomic;
use super::layout::LibraryLayout;
use crate::error::{StoreError, StoreResult};
use crate::model::{entity_from_json, entity_to_json, Identity, MediaEntity};

/// Image extensions probed when locating a media file, in order.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif"];

/// Video extensions probed after the image extensions.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv", "wmv", "m4v"];

/// Reads and writes the canonical files of a library.
#[derive(Debug, Clone)]
pub struct FileStore {
    layout: LibraryLayout,
}

impl FileStore {
    #[must_use]
    pub fn new(layout: LibraryLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &LibraryLayout {
        &self.layout
    }

    /// Create `images/` and `deleted/` if missing.
    pub fn ensure_dirs(&self) -> StoreResult<()> {
        for dir in [self.layout.images_dir(), self.layout.deleted_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Persist an entity: the JSON record first, then the caption sidecar.
    ///
    /// An empty caption removes any stale sidecar.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal to the save and is returned unchanged.
    pub fn save(&self, entity: &MediaEntity) -> StoreResult<()> {
        check_identity(&entity.identity)?;

        let bytes = entity_to_json(entity).map_err(|e| StoreError::Corrupt {
            identity: entity.identity.clone(),
            reason: e.to_string(),
        })?;
        let record = self.layout.record_path(&entity.identity);
        write_atomic(&record, &bytes).map_err(|e| StoreError::io(&record, e))?;

        let sidecar = self.layout.caption_path(&entity.identity);
        if entity.caption.is_empty() {
            match fs::remove_file(&sidecar) {
                Ok(()) => log::debug!("Removed stale caption sidecar {}", sidecar.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&sidecar, e)),
            }
        } else {
            write_atomic(&sidecar, entity.caption.as_bytes())
                .map_err(|e| StoreError::io(&sidecar, e))?;
        }

        log::trace!("Saved record {}", record.display());
        Ok(())
    }

    /// Load an entity from its JSON record.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if there is no record
    /// - [`StoreError::Corrupt`] if the record does not decode
    pub fn load(&self, identity: &Identity) -> StoreResult<MediaEntity> {
        check_identity(identity)?;
        let record = self.layout.record_path(identity);
        let bytes = match fs::read(&record) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(identity.clone()))
            }
            Err(e) => return Err(StoreError::io(&record, e)),
        };
        entity_from_json(identity.clone(), &bytes).map_err(|e| StoreError::Corrupt {
            identity: identity.clone(),
            reason: e.to_string(),
        })
    }

    /// Whether a canonical record exists for the identity.
    #[must_use]
    pub fn exists(&self, identity: &Identity) -> bool {
        identity.is_valid_key() && self.layout.record_path(identity).is_file()
    }

    /// Move every `<identity>.*` file into `deleted/`.
    ///
    /// Name conflicts in the holding area get a `_<n>` suffix before the
    /// extension. Returns the destination paths.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the canonical record does not exist.
    pub fn soft_delete(&self, identity: &Identity) -> StoreResult<Vec<PathBuf>> {
        if !self.exists(identity) {
            check_identity(identity)?;
            return Err(StoreError::NotFound(identity.clone()));
        }

        let deleted_dir = self.layout.deleted_dir();
        fs::create_dir_all(&deleted_dir).map_err(|e| StoreError::io(&deleted_dir, e))?;

        let images = self.layout.images_dir();
        let prefix = format!("{}.", identity);
        let entries = fs::read_dir(&images).map_err(|e| StoreError::io(&images, e))?;

        let mut moved = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&images, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            let dest = free_destination(&deleted_dir, name);
            fs::rename(entry.path(), &dest).map_err(|e| StoreError::io(entry.path(), e))?;
            log::debug!("Moved {} to {}", name, dest.display());
            moved.push(dest);
        }
        Ok(moved)
    }

    /// Lazily stream the identities of all records in `images/`.
    ///
    /// Every call starts a fresh directory walk. Unreadable entries are
    /// logged and skipped.
    pub fn scan_all(&self) -> impl Iterator<Item = Identity> {
        WalkDir::new(self.layout.images_dir())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("Skipping unreadable entry during scan: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| record_identity(entry.path()))
    }

    /// Number of records currently in `images/`, used as a progress total.
    #[must_use]
    pub fn count_estimate(&self) -> usize {
        self.scan_all().count()
    }

    /// Find the media file of an entity by probing known extensions.
    ///
    /// Image extensions are probed before video extensions.
    #[must_use]
    pub fn locate_media(&self, identity: &Identity) -> Option<PathBuf> {
        if !identity.is_valid_key() {
            return None;
        }
        IMAGE_EXTENSIONS
            .iter()
            .chain(VIDEO_EXTENSIONS)
            .map(|ext| self.layout.media_path(identity, ext))
            .find(|path| path.is_file())
    }
}

fn check_identity(identity: &Identity) -> StoreResult<()> {
    if identity.is_valid_key() {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    }
}

/// `<stem>.json` with a valid stem yields the stem.
fn record_identity(path: &Path) -> Option<Identity> {
    if path.extension()? != "json" {
        return None;
    }
    let id = Identity::new(path.file_stem()?.to_str()?);
    id.is_valid_key().then_some(id)
}

/// First free name in `dir` for `name`, inserting `_<n>` before the extension.
fn free_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    };
    (1..)
        .map(|n| dir.join(format!("{}_{}{}", stem, n, ext)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
