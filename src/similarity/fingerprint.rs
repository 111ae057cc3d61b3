//! Perceptual fingerprints.
//!
//! This module provides the [`PerceptualHasher`], which computes 64-bit
//! hashes that remain stable under resizing, recompression and small edits,
//! and the [`FingerprintIndex`], a BK-tree for Hamming-distance lookups.

use bk_tree::{BKTree, Metric};
use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::model::Identity;

/// Supported perceptual hashing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PerceptualAlgorithm {
    /// pHash: DCT then median, most resilient to transformations.
    #[default]
    Phash,
    /// dHash: gradient-based, very fast.
    Dhash,
    /// aHash: mean-based, fast but less resilient.
    Ahash,
}

impl PerceptualAlgorithm {
    pub const ALL: [Self; 3] = [Self::Phash, Self::Dhash, Self::Ahash];

    /// Default clustering threshold (Hamming distance) for this algorithm.
    #[must_use]
    pub fn default_threshold(self) -> u32 {
        match self {
            Self::Phash => 10,
            Self::Dhash => 2,
            Self::Ahash => 5,
        }
    }

    /// Name stored in the index `algorithm` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phash => "phash",
            Self::Dhash => "dhash",
            Self::Ahash => "ahash",
        }
    }
}

impl fmt::Display for PerceptualAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phash => write!(f, "pHash"),
            Self::Dhash => write!(f, "dHash"),
            Self::Ahash => write!(f, "aHash"),
        }
    }
}

impl FromStr for PerceptualAlgorithm {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phash" => Ok(Self::Phash),
            "dhash" => Ok(Self::Dhash),
            "ahash" | "average_hash" => Ok(Self::Ahash),
            _ => Err(FingerprintError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Errors that can occur while fingerprinting.
#[derive(Debug, Error)]
pub enum FingerprintError {
    /// Failed to open or decode the image.
    #[error("Failed to load image {0}: {1}")]
    LoadError(String, #[source] image::ImageError),

    /// The algorithm name is not recognised.
    #[error("Unknown perceptual algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// A perceptual hash value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hamming distance. Bytes present in only one value count as fully different.
    #[must_use]
    pub fn distance(&self, other: &Self) -> u32 {
        let common: u32 = self
            .0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        let extra = self.0.len().abs_diff(other.0.len()) as u32 * 8;
        common + extra
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Computes perceptual fingerprints for images.
pub struct PerceptualHasher {
    hasher: image_hasher::Hasher,
    algorithm: PerceptualAlgorithm,
}

impl PerceptualHasher {
    /// Create a hasher producing 8x8 (64-bit) fingerprints.
    #[must_use]
    pub fn new(algorithm: PerceptualAlgorithm) -> Self {
        let config = HasherConfig::new().hash_size(8, 8);
        let config = match algorithm {
            PerceptualAlgorithm::Phash => config.hash_alg(HashAlg::Median).preproc_dct(),
            PerceptualAlgorithm::Dhash => config.hash_alg(HashAlg::Gradient),
            PerceptualAlgorithm::Ahash => config.hash_alg(HashAlg::Mean),
        };

        Self {
            hasher: config.to_hasher(),
            algorithm,
        }
    }

    /// Compute the fingerprint of the image at `path`.
    pub fn compute<P: AsRef<Path>>(&self, path: P) -> Result<Fingerprint, FingerprintError> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| FingerprintError::LoadError(path.display().to_string(), e))?;

        Ok(Fingerprint::from_bytes(
            self.hasher.hash_image(&img).as_bytes(),
        ))
    }

    #[must_use]
    pub fn algorithm(&self) -> PerceptualAlgorithm {
        self.algorithm
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new(PerceptualAlgorithm::Phash)
    }
}

/// A fingerprint tagged with the entity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    pub identity: Identity,
    pub fingerprint: Fingerprint,
}

/// Hamming-distance metric over [`FingerprintEntry`] values.
#[derive(Default, Clone, Copy, Debug)]
pub struct FingerprintMetric;

impl Metric<FingerprintEntry> for FingerprintMetric {
    fn distance(&self, a: &FingerprintEntry, b: &FingerprintEntry) -> u32 {
        a.fingerprint.distance(&b.fingerprint)
    }

    fn threshold_distance(
        &self,
        a: &FingerprintEntry,
        b: &FingerprintEntry,
        threshold: u32,
    ) -> Option<u32> {
        let d = self.distance(a, b);
        (d <= threshold).then_some(d)
    }
}

/// BK-tree over fingerprints for nearest-neighbour lookups.
pub struct FingerprintIndex {
    tree: BKTree<FingerprintEntry, FingerprintMetric>,
    count: usize,
}

impl FingerprintIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: BKTree::new(FingerprintMetric),
            count: 0,
        }
    }

    pub fn insert(&mut self, entry: FingerprintEntry) {
        self.tree.add(entry);
        self.count += 1;
    }

    /// Entries within `max_distance` of `probe`, sorted by distance then identity.
    #[must_use]
    pub fn find(&self, probe: &Fingerprint, max_distance: u32) -> Vec<(u32, &FingerprintEntry)> {
        let key = FingerprintEntry {
            identity: Identity::new(""),
            fingerprint: probe.clone(),
        };
        let mut found: Vec<_> = self.tree.find(&key, max_distance).collect();
        found.sort_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.identity.cmp(&b.identity)));
        found
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for FingerprintIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<FingerprintEntry> for FingerprintIndex {
    fn from_iter<T: IntoIterator<Item = FingerprintEntry>>(iter: T) -> Self {
        let mut index = Self::new();
        for entry in iter {
            index.insert(entry);
        }
        index
    }
}
