//! Content-derived identities.
//!
//! An identity is the first [`IDENTITY_LEN`] hex characters of a BLAKE3
//! digest. For decodable images the digest covers the decoded RGBA8 pixels
//! prefixed by the dimensions, so re-encoding an image losslessly (PNG to
//! WebP, stripped metadata) keeps its identity. Anything that does not
//! decode as an image is identified by its raw bytes.

use std::fs::File;
use std::io;
use std::path::Path;

use super::Identity;

/// Number of hex characters kept from the digest.
pub const IDENTITY_LEN: usize = 16;

/// Compute the identity of the media file at `path`.
///
/// # Errors
///
/// Returns an I/O error only if the file cannot be read at all.
pub fn compute_identity(path: &Path) -> io::Result<Identity> {
    let mut hasher = blake3::Hasher::new();

    match image::open(path) {
        Ok(img) => {
            let rgba = img.to_rgba8();
            hasher.update(&rgba.width().to_le_bytes());
            hasher.update(&rgba.height().to_le_bytes());
            hasher.update(rgba.as_raw());
        }
        Err(e) => {
            log::debug!(
                "Not decodable as an image, hashing raw bytes of {}: {}",
                path.display(),
                e
            );
            let mut file = File::open(path)?;
            io::copy(&mut file, &mut hasher)?;
        }
    }

    Ok(digest_to_identity(&hasher.finalize()))
}

fn digest_to_identity(hash: &blake3::Hash) -> Identity {
    let hex = hash.to_hex();
    Identity::new(&hex.as_str()[..IDENTITY_LEN])
}
