//! tagstore - file-first, rebuildable media library storage.
//!
//! Every entity is a JSON record under `images/`, next to its media file and
//! caption sidecar. A SQLite index mirrors the records for fast tag queries
//! and can be regenerated from them at any time, as can the thumbnail and
//! preview cache. [`Library`] coordinates all of it.

pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod library;
pub mod logging;
pub mod model;
pub mod progress;
pub mod signal;
pub mod similarity;
pub mod store;

pub use commands::run_app;
pub use error::{StoreError, StoreResult};
pub use library::{IndexState, Library};
