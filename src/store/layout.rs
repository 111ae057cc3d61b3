//! On-disk layout of a library directory.

use std::path::{Path, PathBuf};

use crate::model::Identity;

/// Manifest file name.
pub const MANIFEST_FILE: &str = "library.json";
/// Index database file name.
pub const INDEX_FILE: &str = "library.db";
/// Directory holding canonical records and media.
pub const IMAGES_DIR: &str = "images";
/// Root of the derived-artifact cache.
pub const CACHE_DIR: &str = "cache";
/// Holding area for soft-deleted files.
pub const DELETED_DIR: &str = "deleted";

/// Resolved paths of one library.
#[derive(Debug, Clone)]
pub struct LibraryLayout {
    root: PathBuf,
}

impl LibraryLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Scratch path used while a rebuilt index is being populated.
    #[must_use]
    pub fn rebuild_path(&self) -> PathBuf {
        self.root.join(format!("{}.rebuild", INDEX_FILE))
    }

    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    #[must_use]
    pub fn deleted_dir(&self) -> PathBuf {
        self.root.join(DELETED_DIR)
    }

    /// `images/<identity>.json`
    #[must_use]
    pub fn record_path(&self, identity: &Identity) -> PathBuf {
        self.images_dir().join(format!("{}.json", identity))
    }

    /// `images/<identity>.txt`
    #[must_use]
    pub fn caption_path(&self, identity: &Identity) -> PathBuf {
        self.images_dir().join(format!("{}.txt", identity))
    }

    /// `images/<identity>.<ext>`
    #[must_use]
    pub fn media_path(&self, identity: &Identity, extension: &str) -> PathBuf {
        self.images_dir().join(format!("{}.{}", identity, extension))
    }
}
