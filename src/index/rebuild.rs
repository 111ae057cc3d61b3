//! Regeneration of the index from canonical files.
//!
//! # Overview
//!
//! The [`Rebuilder`] writes a complete index to a temporary file next to
//! `library.db`:
//!
//! 1. Remove any stale temporary file and create a fresh store
//! 2. Stream identities from the file store, loading and upserting each one;
//!    corrupt records are recorded and skipped
//! 3. Carry over fingerprints from the prior index for identities that still exist
//!
//! Swapping the fresh file into place is left to the caller, which owns the
//! live connection. On cancellation the temporary file is deleted and the
//! prior index is left untouched.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::store::IndexStore;
use crate::error::{StoreError, StoreResult};
use crate::model::Identity;
use crate::progress::{ProgressCallback, PHASE_REBUILD};
use crate::store::FileStore;

/// A record skipped because it could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptEntry {
    pub identity: Identity,
    pub reason: String,
}

/// Summary of a completed rebuild.
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    /// Records visited.
    pub processed: usize,
    /// Records written to the fresh index.
    pub indexed: usize,
    pub corrupt: Vec<CorruptEntry>,
    /// Fingerprint rows copied from the prior index.
    pub fingerprints_carried: usize,
    pub duration: Duration,
}

/// Builds a fresh index from the file store.
pub struct Rebuilder<'a> {
    files: &'a FileStore,
    target: PathBuf,
    prior: Option<PathBuf>,
    progress: Option<Arc<dyn ProgressCallback>>,
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl<'a> Rebuilder<'a> {
    /// Rebuild into `target`, which must not be the live index path.
    #[must_use]
    pub fn new(files: &'a FileStore, target: impl Into<PathBuf>) -> Self {
        Self {
            files,
            target: target.into(),
            prior: None,
            progress: None,
            shutdown_flag: None,
        }
    }

    /// Copy fingerprints from this index once the scan completes.
    #[must_use]
    pub fn with_prior(mut self, prior: impl Into<PathBuf>) -> Self {
        self.prior = Some(prior.into());
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Check `flag` before each entity and stop when it is set.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Run the rebuild, returning the fresh store and a report.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Cancelled`] if the shutdown flag was set
    /// - [`StoreError::IndexUnavailable`] if the fresh store cannot be written
    pub fn run(self) -> StoreResult<(IndexStore, RebuildReport)> {
        let start = Instant::now();
        remove_if_exists(&self.target)?;

        let result = self.build(start);
        if result.is_err() {
            if let Err(e) = remove_if_exists(&self.target) {
                log::warn!("Failed to remove partial index: {}", e);
            }
        }
        result
    }

    fn build(&self, start: Instant) -> StoreResult<(IndexStore, RebuildReport)> {
        let mut store = IndexStore::create(&self.target)?;
        let mut report = RebuildReport::default();

        let total = self.files.count_estimate();
        if let Some(ref cb) = self.progress {
            cb.on_phase_start(PHASE_REBUILD, total);
        }
        log::info!("Rebuilding index from {} records", total);

        store.begin_bulk()?;
        for identity in self.files.scan_all() {
            if self.is_shutdown_requested() {
                log::info!("Rebuild cancelled after {} records", report.processed);
                if let Some(ref cb) = self.progress {
                    cb.on_phase_end(PHASE_REBUILD);
                }
                drop(store);
                return Err(StoreError::Cancelled);
            }

            report.processed += 1;
            if let Some(ref cb) = self.progress {
                cb.on_progress(report.processed, identity.as_str());
            }
            match self.files.load(&identity) {
                Ok(entity) => {
                    store.upsert(&entity)?;
                    report.indexed += 1;
                }
                Err(StoreError::Corrupt { identity, reason }) => {
                    log::warn!("Skipping corrupt record {}: {}", identity, reason);
                    report.corrupt.push(CorruptEntry { identity, reason });
                }
                Err(e) => {
                    log::warn!("Skipping unreadable record {}: {}", identity, e);
                    report.corrupt.push(CorruptEntry {
                        identity,
                        reason: e.to_string(),
                    });
                }
            }
        }
        store.commit_bulk()?;

        if let Some(ref cb) = self.progress {
            cb.on_phase_end(PHASE_REBUILD);
        }

        if let Some(ref prior) = self.prior {
            if prior.is_file() {
                match store.copy_fingerprints_from(prior) {
                    Ok(n) => report.fingerprints_carried = n,
                    Err(e) => log::warn!("Could not carry fingerprints from prior index: {}", e),
                }
            }
        }

        report.duration = start.elapsed();
        log::info!(
            "Phase rebuild complete: {} indexed, {} corrupt in {:.2?}",
            report.indexed,
            report.corrupt.len(),
            report.duration
        );
        Ok((store, report))
    }
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    for candidate in [
        path.to_path_buf(),
        PathBuf::from(format!("{}-journal", path.display())),
        PathBuf::from(format!("{}-wal", path.display())),
        PathBuf::from(format!("{}-shm", path.display())),
    ] {
        match std::fs::remove_file(&candidate) {
            Ok(()) => log::debug!("Removed stale {}", candidate.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(candidate, e)),
        }
    }
    Ok(())
}
