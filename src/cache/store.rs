//! Generation and lookup of cached artifacts.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::entry::{is_preview_of, ArtifactKind, CacheKey, LOWRES_DIR, THUMBNAILS_DIR};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::Identity;
use crate::store::LibraryLayout;

/// Content-addressed store of thumbnails and previews.
///
/// Artifacts are pure functions of `(identity, kind, size)` and the source
/// media. They are never authoritative: any of them may be deleted at any
/// time and will be regenerated on the next request.
pub struct CacheStore {
    root: PathBuf,
    cache_dir: PathBuf,
    thumbnail_size: u32,
    thumbnail_quality: u8,
    preview_quality: u8,
}

impl CacheStore {
    #[must_use]
    pub fn new(layout: &LibraryLayout, config: &StoreConfig) -> Self {
        Self {
            root: layout.root().to_path_buf(),
            cache_dir: layout.cache_dir(),
            thumbnail_size: config.thumbnail_size,
            thumbnail_quality: config.thumbnail_quality,
            preview_quality: config.preview_quality,
        }
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create `thumbnails/` and `lowres/`.
    pub fn ensure_dirs(&self) -> StoreResult<()> {
        for dir in [
            self.cache_dir.join(THUMBNAILS_DIR),
            self.cache_dir.join(LOWRES_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Key of an artifact. Thumbnails always use the configured size.
    #[must_use]
    pub fn key(&self, identity: &Identity, kind: ArtifactKind, size: u32) -> CacheKey {
        let size = match kind {
            ArtifactKind::Thumbnail => self.thumbnail_size,
            ArtifactKind::Preview => size,
        };
        CacheKey {
            identity: identity.clone(),
            kind,
            size,
        }
    }

    /// Path of the artifact, generating it from `source` on a miss.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidIdentity`] if `identity` is not a plain file stem,
    /// [`StoreError::GenerationFailed`] if `source` cannot be decoded or the
    /// JPEG cannot be encoded, [`StoreError::Io`] on filesystem failures.
    pub fn get_or_generate(
        &self,
        identity: &Identity,
        kind: ArtifactKind,
        size: u32,
        source: &Path,
    ) -> StoreResult<PathBuf> {
        check_key(identity)?;
        let key = self.key(identity, kind, size);
        let path = key.path_in(&self.cache_dir);
        if path.is_file() {
            log::debug!("Cache hit: {} {}", kind, path.display());
            return Ok(path);
        }
        log::debug!("Cache miss: {} for {}, generating", kind, identity);

        let failed = |reason: String| StoreError::GenerationFailed {
            identity: identity.clone(),
            reason,
        };
        if key.size == 0 {
            return Err(failed(format!("{} size must be greater than zero", kind)));
        }

        let img = image::open(source)
            .map_err(|e| failed(format!("cannot decode {}: {}", source.display(), e)))?;
        let img = downscale(img, key.size);
        let quality = match kind {
            ArtifactKind::Thumbnail => self.thumbnail_quality,
            ArtifactKind::Preview => self.preview_quality,
        };

        let dir = path.parent().unwrap_or(self.cache_dir.as_path());
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut writer, quality)
                .encode_image(&rgb)
                .map_err(|e| failed(format!("cannot encode JPEG: {}", e)))?;
            writer.flush().map_err(|e| StoreError::io(tmp.path(), e))?;
        }
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;

        Ok(path)
    }

    /// Delete every artifact of one identity. Returns how many were removed.
    pub fn invalidate(&self, identity: &Identity) -> StoreResult<usize> {
        check_key(identity)?;
        let mut removed = 0;
        let thumb = self
            .key(identity, ArtifactKind::Thumbnail, 0)
            .path_in(&self.cache_dir);
        if remove_file_if_exists(&thumb)? {
            removed += 1;
        }

        let lowres = self.cache_dir.join(LOWRES_DIR);
        let entries = match fs::read_dir(&lowres) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(StoreError::io(&lowres, e)),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if is_preview_of(&name.to_string_lossy(), identity) && remove_file_if_exists(&entry.path())? {
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("Invalidated {} cached artifacts of {}", removed, identity);
        }
        Ok(removed)
    }

    /// Empty the cache without waiting for the old files to be deleted.
    ///
    /// The cache directory is renamed away, recreated empty, and the old
    /// tree is removed on a background thread.
    pub fn clear_all(&self) -> StoreResult<()> {
        if self.cache_dir.exists() {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            let tombstone = self.root.join(format!(".cache-trash-{}", stamp));
            fs::rename(&self.cache_dir, &tombstone)
                .map_err(|e| StoreError::io(&self.cache_dir, e))?;
            rayon::spawn(move || {
                if let Err(e) = fs::remove_dir_all(&tombstone) {
                    log::warn!("Failed to remove old cache {}: {}", tombstone.display(), e);
                }
            });
        }
        self.ensure_dirs()?;
        log::info!("Cache cleared");
        Ok(())
    }

    /// Total bytes of all artifacts.
    #[must_use]
    pub fn size_on_disk(&self) -> u64 {
        WalkDir::new(&self.cache_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Shrink `img` so its longer side is at most `max_dim`. Never upscales.
fn downscale(img: DynamicImage, max_dim: u32) -> DynamicImage {
    if img.width() <= max_dim && img.height() <= max_dim {
        return img;
    }
    img.resize(max_dim, max_dim, FilterType::Lanczos3)
}

fn check_key(identity: &Identity) -> StoreResult<()> {
    if identity.is_valid_key() {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    }
}

fn remove_file_if_exists(path: &Path) -> StoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
