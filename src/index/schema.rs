//! SQLite schema of the index.

/// Version written to `schema_info`. An index with any other version is rebuilt.
pub const SCHEMA_VERSION: &str = "1";

/// Core tables. Applied once when an index file is created.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_info (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS media (
    id              TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    source_media_id TEXT,
    name            TEXT NOT NULL DEFAULT '',
    caption         TEXT NOT NULL DEFAULT '',
    created         TEXT NOT NULL,
    modified        TEXT NOT NULL,
    metadata_json   TEXT NOT NULL DEFAULT '{}',
    variant_json    TEXT NOT NULL DEFAULT '{}',
    extra_json      TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_media_kind ON media(kind);
CREATE INDEX IF NOT EXISTS idx_media_source ON media(source_media_id);

CREATE TABLE IF NOT EXISTS tags (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    category TEXT NOT NULL,
    value    TEXT NOT NULL,
    position INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tags_media ON tags(media_id, position);
CREATE INDEX IF NOT EXISTS idx_tags_full ON tags(lower(category || ':' || value));

CREATE TABLE IF NOT EXISTS relationships (
    from_id  TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    to_id    TEXT NOT NULL,
    type     TEXT NOT NULL,
    strength REAL,
    position INTEGER NOT NULL,
    UNIQUE(from_id, to_id, type)
);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_id, type);

CREATE TABLE IF NOT EXISTS perceptual_hashes (
    media_id    TEXT NOT NULL,
    algorithm   TEXT NOT NULL,
    value       BLOB NOT NULL,
    computed_at TEXT NOT NULL,
    UNIQUE(media_id, algorithm)
);
"#;

/// Full-text index over tags. Optional: SQLite builds without FTS5 skip it.
pub const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS tags_fts USING fts5(
    category,
    value,
    content='tags',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS tags_ai AFTER INSERT ON tags BEGIN
    INSERT INTO tags_fts(rowid, category, value) VALUES (new.id, new.category, new.value);
END;

CREATE TRIGGER IF NOT EXISTS tags_ad AFTER DELETE ON tags BEGIN
    INSERT INTO tags_fts(tags_fts, rowid, category, value)
    VALUES ('delete', old.id, old.category, old.value);
END;

CREATE TRIGGER IF NOT EXISTS tags_au AFTER UPDATE ON tags BEGIN
    INSERT INTO tags_fts(tags_fts, rowid, category, value)
    VALUES ('delete', old.id, old.category, old.value);
    INSERT INTO tags_fts(rowid, category, value) VALUES (new.id, new.category, new.value);
END;
"#;

/// Per-connection settings.
pub const PRAGMAS: &str = r#"
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;
