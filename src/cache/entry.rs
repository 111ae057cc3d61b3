//! Cache artifact keys and their file names.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::model::Identity;

/// Sub-directory of thumbnails inside `cache/`.
pub const THUMBNAILS_DIR: &str = "thumbnails";
/// Sub-directory of previews inside `cache/`.
pub const LOWRES_DIR: &str = "lowres";

/// Kind of derived artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Fits a square bounding box of the configured thumbnail size.
    Thumbnail,
    /// Longest side capped at the requested dimension.
    Preview,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thumbnail => write!(f, "thumbnail"),
            Self::Preview => write!(f, "preview"),
        }
    }
}

/// Identifies one artifact: the same key always maps to the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub identity: Identity,
    pub kind: ArtifactKind,
    /// Bounding dimension in pixels.
    pub size: u32,
}

impl CacheKey {
    /// Path of the artifact below `cache_dir`.
    ///
    /// Thumbnails have a single configured size, so it is not part of their name.
    #[must_use]
    pub fn path_in(&self, cache_dir: &Path) -> PathBuf {
        match self.kind {
            ArtifactKind::Thumbnail => cache_dir
                .join(THUMBNAILS_DIR)
                .join(format!("{}.jpg", self.identity)),
            ArtifactKind::Preview => cache_dir
                .join(LOWRES_DIR)
                .join(format!("{}_{}.jpg", self.identity, self.size)),
        }
    }
}

/// Whether `file_name` is a preview of `identity` (`<identity>_<digits>.jpg`).
#[must_use]
pub fn is_preview_of(file_name: &str, identity: &Identity) -> bool {
    file_name
        .strip_prefix(identity.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".jpg"))
        .is_some_and(|size| !size.is_empty() && size.bytes().all(|b| b.is_ascii_digit()))
}
