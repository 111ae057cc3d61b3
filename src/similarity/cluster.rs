//! Threshold clustering of fingerprints.
//!
//! # Overview
//!
//! Every pair of fingerprints is compared once. Pairs whose Hamming distance
//! is within the threshold become [`SimilarityEdge`]s, and a union-find pass
//! over those edges yields the clusters. Membership is transitive: if A is
//! close to B and B is close to C, all three share a cluster even when A and
//! C are far apart.
//!
//! Rows of the comparison matrix are processed in parallel on the current
//! rayon pool; the shutdown flag is checked once per row.
//!
//! # Example
//!
//! ```
//! use tagstore::similarity::{cluster_fingerprints, Fingerprint, FingerprintEntry};
//!
//! let entries = vec![
//!     FingerprintEntry { identity: "a".into(), fingerprint: Fingerprint::from_bytes(vec![0b0000]) },
//!     FingerprintEntry { identity: "b".into(), fingerprint: Fingerprint::from_bytes(vec![0b0001]) },
//!     FingerprintEntry { identity: "c".into(), fingerprint: Fingerprint::from_bytes(vec![0b0011]) },
//!     FingerprintEntry { identity: "d".into(), fingerprint: Fingerprint::from_bytes(vec![0b1111_0000]) },
//! ];
//!
//! let result = cluster_fingerprints(&entries, 1, None, None).unwrap();
//! assert_eq!(result.clusters.len(), 2);
//! assert_eq!(result.clusters[0].len(), 3); // a-b-c chained
//! ```

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::fingerprint::FingerprintEntry;
use crate::error::{StoreError, StoreResult};
use crate::model::Identity;
use crate::progress::{ProgressCallback, PHASE_CLUSTER};

/// Disjoint-set forest with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    /// Representative of the set containing `x`.
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`. Returns `false` if already merged.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

/// A pair of entities within the clustering threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarityEdge {
    /// The smaller identity of the pair.
    pub from: Identity,
    pub to: Identity,
    pub distance: u32,
}

/// Result of one clustering pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clustering {
    /// Clusters with ascending members, ordered by first member. Singletons included.
    pub clusters: Vec<Vec<Identity>>,
    /// Edges sorted by `(from, to)`.
    pub edges: Vec<SimilarityEdge>,
    /// Number of pairwise comparisons made.
    pub comparisons: u64,
}

/// Cluster fingerprints by Hamming distance.
///
/// Entries are deduplicated by identity (first occurrence wins).
///
/// # Errors
///
/// [`StoreError::Cancelled`] if `shutdown` is set before all rows were compared.
pub fn cluster_fingerprints(
    entries: &[FingerprintEntry],
    max_distance: u32,
    shutdown: Option<&AtomicBool>,
    progress: Option<&Arc<dyn ProgressCallback>>,
) -> StoreResult<Clustering> {
    let mut by_id: BTreeMap<&Identity, &FingerprintEntry> = BTreeMap::new();
    for entry in entries {
        by_id.entry(&entry.identity).or_insert(entry);
    }
    let items: Vec<&FingerprintEntry> = by_id.into_values().collect();
    let n = items.len();

    let is_cancelled = || shutdown.is_some_and(|flag| flag.load(Ordering::SeqCst));

    if let Some(cb) = progress {
        cb.on_phase_start(PHASE_CLUSTER, n);
    }
    let done = AtomicUsize::new(0);

    let rows: Vec<Option<Vec<(usize, usize, u32)>>> = (0..n)
        .into_par_iter()
        .map(|i| {
            if is_cancelled() {
                return None;
            }
            let row = ((i + 1)..n)
                .filter_map(|j| {
                    let d = items[i].fingerprint.distance(&items[j].fingerprint);
                    (d <= max_distance).then_some((i, j, d))
                })
                .collect();
            if let Some(cb) = progress {
                let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                cb.on_progress(current, items[i].identity.as_str());
            }
            Some(row)
        })
        .collect();

    if let Some(cb) = progress {
        cb.on_phase_end(PHASE_CLUSTER);
    }

    if is_cancelled() || rows.iter().any(Option::is_none) {
        log::info!("Clustering cancelled before completion, discarding partial results");
        return Err(StoreError::Cancelled);
    }

    let mut uf = UnionFind::new(n);
    let mut edges = Vec::new();
    for (i, j, d) in rows.into_iter().flatten().flatten() {
        uf.union(i, j);
        edges.push(SimilarityEdge {
            from: items[i].identity.clone(),
            to: items[j].identity.clone(),
            distance: d,
        });
    }

    // Items are in ascending identity order, so members and clusters come out sorted.
    let mut groups: BTreeMap<usize, Vec<Identity>> = BTreeMap::new();
    let mut order: Vec<usize> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let root = uf.find(idx);
        let members = groups.entry(root).or_default();
        if members.is_empty() {
            order.push(root);
        }
        members.push(item.identity.clone());
    }
    let clusters = order
        .into_iter()
        .filter_map(|root| groups.remove(&root))
        .collect();

    let comparisons = (n as u64) * (n.saturating_sub(1) as u64) / 2;
    log::debug!(
        "Clustered {} fingerprints: {} edges within distance {}",
        n,
        edges.len(),
        max_distance
    );

    Ok(Clustering {
        clusters,
        edges,
        comparisons,
    })
}
