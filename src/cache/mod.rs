//! Derived artifact cache.
//!
//! Thumbnails and previews live under `cache/` and are keyed purely by
//! `(identity, kind, size)`:
//!
//! ```text
//! cache/thumbnails/<identity>.jpg
//! cache/lowres/<identity>_<size>.jpg
//! ```
//!
//! * [`entry`]: artifact kinds, keys and file naming.
//! * [`store`]: the [`CacheStore`] generating and evicting artifacts.
//!
//! Because a key is a function of immutable content, an artifact never needs
//! a freshness check: if the file exists it is valid.

pub mod entry;
pub mod store;

pub use entry::{ArtifactKind, CacheKey};
pub use store::CacheStore;
