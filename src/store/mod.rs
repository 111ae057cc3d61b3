//! File-first storage: library layout, canonical records and the manifest.
//!
//! * [`layout`]: path conventions of a library directory.
//! * [`file`]: the [`FileStore`], source of truth for every entity.
//! * [`manifest`]: the `library.json` manifest.
//! * [`atomic`]: temp-file-then-rename writes shared by all of the above.

pub mod atomic;
pub mod file;
pub mod layout;
pub mod manifest;

pub use atomic::write_atomic;
pub use file::{FileStore, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
pub use layout::LibraryLayout;
pub use manifest::LibraryManifest;
