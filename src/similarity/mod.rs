//! Perceptual similarity: fingerprints, lookups and clustering.
//!
//! # Overview
//!
//! * [`fingerprint`]: perceptual hashing of images and a BK-tree index.
//! * [`cluster`]: pairwise comparison and union-find clustering.
//!
//! The [`SimilarityEngine`] owns the bounded worker pool both run on.

pub mod cluster;
pub mod fingerprint;

use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub use cluster::{cluster_fingerprints, Clustering, SimilarityEdge, UnionFind};
pub use fingerprint::{
    Fingerprint, FingerprintEntry, FingerprintError, FingerprintIndex, FingerprintMetric,
    PerceptualAlgorithm, PerceptualHasher,
};

use crate::error::{StoreError, StoreResult};
use crate::model::Identity;
use crate::progress::{ProgressCallback, PHASE_FINGERPRINT};

/// Outcome of fingerprinting one entity.
pub type FingerprintResult = (Identity, Result<Fingerprint, FingerprintError>);

/// Runs fingerprinting and clustering on a bounded rayon pool.
pub struct SimilarityEngine {
    pool: Option<rayon::ThreadPool>,
    threads: usize,
}

impl SimilarityEngine {
    /// Create an engine with `worker_threads` workers.
    ///
    /// Falls back to the global rayon pool if a dedicated pool cannot be built.
    #[must_use]
    pub fn new(worker_threads: usize) -> Self {
        let threads = worker_threads.max(1);
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tagstore-similarity-{}", i))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                log::warn!(
                    "Failed to create similarity thread pool ({}), using global pool with {} threads",
                    e,
                    rayon::current_num_threads()
                );
                None
            }
        };
        Self { pool, threads }
    }

    /// Number of workers requested for this engine.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Fingerprint many files in parallel.
    ///
    /// Per-file failures are returned alongside the successes.
    ///
    /// # Errors
    ///
    /// [`StoreError::Cancelled`] if `shutdown` is set before every file was processed.
    pub fn fingerprint_many(
        &self,
        jobs: Vec<(Identity, PathBuf)>,
        algorithm: PerceptualAlgorithm,
        shutdown: Option<&AtomicBool>,
        progress: Option<&Arc<dyn ProgressCallback>>,
    ) -> StoreResult<Vec<FingerprintResult>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(cb) = progress {
            cb.on_phase_start(PHASE_FINGERPRINT, jobs.len());
        }
        log::info!(
            "Computing {} fingerprints for {} items on {} workers",
            algorithm,
            jobs.len(),
            self.threads
        );

        let is_cancelled = || shutdown.is_some_and(|flag| flag.load(Ordering::SeqCst));
        let done = AtomicUsize::new(0);
        let hasher = PerceptualHasher::new(algorithm);

        let results: Vec<Option<FingerprintResult>> = self.install(|| {
            jobs.into_par_iter()
                .map(|(identity, path)| {
                    if is_cancelled() {
                        return None;
                    }
                    let result = hasher.compute(&path);
                    if let Err(ref e) = result {
                        log::warn!("Failed to fingerprint {}: {}", identity, e);
                    }
                    if let Some(cb) = progress {
                        let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                        cb.on_progress(current, identity.as_str());
                    }
                    Some((identity, result))
                })
                .collect()
        });

        if let Some(cb) = progress {
            cb.on_phase_end(PHASE_FINGERPRINT);
        }
        if is_cancelled() || results.iter().any(Option::is_none) {
            return Err(StoreError::Cancelled);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Cluster fingerprints on this engine's pool.
    pub fn cluster(
        &self,
        entries: &[FingerprintEntry],
        max_distance: u32,
        shutdown: Option<&AtomicBool>,
        progress: Option<&Arc<dyn ProgressCallback>>,
    ) -> StoreResult<Clustering> {
        self.install(|| cluster_fingerprints(entries, max_distance, shutdown, progress))
    }
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(4)
    }
}
