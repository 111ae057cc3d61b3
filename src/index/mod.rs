//! Rebuildable SQLite index.
//!
//! - [`filter`]: the tag filter language, evaluated in memory or as SQL
//! - [`schema`]: table definitions and the schema version
//! - [`store`]: the [`IndexStore`] connection wrapper
//! - [`rebuild`]: regeneration from canonical files

pub mod filter;
pub mod rebuild;
pub mod schema;
pub mod store;

pub use filter::{FilterError, TagFilter, TagPattern};
pub use rebuild::{CorruptEntry, RebuildReport, Rebuilder};
pub use schema::SCHEMA_VERSION;
pub use store::{IndexError, IndexResult, IndexStore, StoredFingerprint, TagCount};
