//! SQLite-backed index of entities, tags, relations and fingerprints.
//!
//! # Overview
//!
//! The index is a derived, disposable accelerator over the canonical JSON
//! records: everything in it can be regenerated from the [`FileStore`]
//! by the rebuilder. It answers tag-filter queries, tag search and
//! similarity lookups without scanning the library directory.
//!
//! Opening checks integrity: a missing file, an unreadable database or a
//! schema version mismatch is reported as an [`IndexError`] so the caller can
//! route to a rebuild.
//!
//! [`FileStore`]: crate::store::FileStore

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::filter::TagFilter;
use super::schema::{FTS_SCHEMA, PRAGMAS, SCHEMA, SCHEMA_VERSION};
use crate::error::StoreError;
use crate::model::record::{variant_fields, variant_from_fields};
use crate::model::{Identity, MediaEntity, MediaKind, Tag};
use crate::similarity::{Fingerprint, FingerprintEntry, FingerprintIndex, PerceptualAlgorithm};

/// Errors raised by the index store.
#[derive(Debug, Error)]
pub enum IndexError {
    /// No index file exists at the path.
    #[error("index file {0} does not exist")]
    Absent(PathBuf),

    /// The file exists but cannot be opened as an index.
    #[error("index file {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The index was written by another schema version.
    #[error("index schema version {found:?} does not match {expected}")]
    VersionMismatch {
        found: Option<String>,
        expected: &'static str,
    },

    /// A statement failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Entity fields could not be encoded for storage.
    #[error("failed to encode {identity}: {source}")]
    Encode {
        identity: Identity,
        #[source]
        source: serde_json::Error,
    },

    /// A stored row could not be turned back into an entity.
    #[error("invalid index row for {identity}: {reason}")]
    InvalidRow { identity: Identity, reason: String },

    /// A filter compiles to a statement beyond SQLite's limits.
    #[error("filter too complex for the index ({terms} terms, depth {depth})")]
    FilterTooComplex { terms: usize, depth: usize },
}

impl IndexError {
    /// Whether the error says something about the index itself, as opposed
    /// to the shape of one request.
    #[must_use]
    pub fn is_index_fault(&self) -> bool {
        !matches!(self, Self::FilterTooComplex { .. })
    }
}

/// SQLite's default `SQLITE_MAX_EXPR_DEPTH` is 1000.
const MAX_FILTER_SQL_DEPTH: usize = 900;
/// SQLite's default `SQLITE_MAX_VARIABLE_NUMBER` is 32766.
const MAX_FILTER_PARAMS: usize = 32_000;

impl From<IndexError> for StoreError {
    fn from(err: IndexError) -> Self {
        StoreError::IndexUnavailable(err.to_string())
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// A tag and the number of entities carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCount {
    pub tag: Tag,
    pub count: u64,
}

/// A fingerprint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub fingerprint: Fingerprint,
    /// RFC 3339 timestamp of computation.
    pub computed_at: String,
}

/// Connection to one index database file.
pub struct IndexStore {
    conn: Connection,
    path: PathBuf,
    fts: bool,
}

impl IndexStore {
    /// Create a new, empty index at `path`.
    ///
    /// Fails if the schema cannot be applied. Missing FTS5 support only
    /// disables full-text tag search.
    pub fn create(path: &Path) -> IndexResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )?;

        let fts = match conn.execute_batch(&format!("BEGIN;{}COMMIT;", FTS_SCHEMA)) {
            Ok(()) => true,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK;");
                log::warn!("Full-text tag search unavailable, falling back to LIKE: {}", e);
                false
            }
        };

        log::debug!("Created index at {}", path.display());
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            fts,
        })
    }

    /// Open an existing index, checking that it is readable and current.
    pub fn open(path: &Path) -> IndexResult<Self> {
        if !path.is_file() {
            return Err(IndexError::Absent(path.to_path_buf()));
        }
        let unreadable = |source| IndexError::Unreadable {
            path: path.to_path_buf(),
            source,
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(unreadable)?;
        conn.execute_batch(PRAGMAS).map_err(unreadable)?;

        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_info WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(unreadable)?;
        if found.as_deref() != Some(SCHEMA_VERSION) {
            return Err(IndexError::VersionMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }

        let fts: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'tags_fts')",
                [],
                |row| row.get(0),
            )
            .map_err(unreadable)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            fts,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether full-text tag search is available.
    #[must_use]
    pub fn has_fts(&self) -> bool {
        self.fts
    }

    /// Insert or replace an entity, its tags and its outgoing relations.
    pub fn upsert(&mut self, entity: &MediaEntity) -> IndexResult<()> {
        let encode = |source| IndexError::Encode {
            identity: entity.identity.clone(),
            source,
        };
        let metadata = serde_json::to_string(&entity.metadata).map_err(encode)?;
        let variant = serde_json::to_string(&variant_fields(&entity.variant)).map_err(encode)?;
        let extra = serde_json::to_string(&entity.extra).map_err(encode)?;
        let now = Utc::now().to_rfc3339();
        let id = entity.identity.as_str();

        let sp = self.conn.savepoint()?;
        sp.execute(
            "INSERT INTO media (id, kind, source_media_id, name, caption, created, modified,
                                metadata_json, variant_json, extra_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                source_media_id = excluded.source_media_id,
                name = excluded.name,
                caption = excluded.caption,
                modified = excluded.modified,
                metadata_json = excluded.metadata_json,
                variant_json = excluded.variant_json,
                extra_json = excluded.extra_json",
            params![
                id,
                entity.kind().as_str(),
                entity.variant.source().map(Identity::as_str),
                entity.name,
                entity.caption,
                now,
                metadata,
                variant,
                extra,
            ],
        )?;

        sp.execute("DELETE FROM tags WHERE media_id = ?1", params![id])?;
        {
            let mut stmt = sp.prepare(
                "INSERT INTO tags (media_id, category, value, position) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, tag) in entity.tags.iter().enumerate() {
                stmt.execute(params![id, tag.category, tag.value, position as i64])?;
            }
        }

        sp.execute("DELETE FROM relationships WHERE from_id = ?1", params![id])?;
        {
            let mut stmt = sp.prepare(
                "INSERT OR IGNORE INTO relationships (from_id, to_id, type, strength, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (kind, targets) in &entity.related {
                for (position, target) in targets.iter().enumerate() {
                    let strength = entity.relation_strength(kind, target);
                    stmt.execute(params![id, target.as_str(), kind, strength, position as i64])?;
                }
            }
        }

        sp.commit()?;
        Ok(())
    }

    /// Reconstruct an entity from its rows, or `None` if it is not indexed.
    pub fn load(&self, identity: &Identity) -> IndexResult<Option<MediaEntity>> {
        let row = self
            .conn
            .query_row(
                "SELECT kind, name, caption, metadata_json, variant_json, extra_json
                 FROM media WHERE id = ?1",
                params![identity.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((kind, name, caption, metadata, variant, extra)) = row else {
            return Ok(None);
        };

        let invalid = |reason: String| IndexError::InvalidRow {
            identity: identity.clone(),
            reason,
        };
        let kind = MediaKind::parse(&kind).ok_or_else(|| invalid(format!("unknown kind {kind}")))?;
        let metadata = parse_object(&metadata).map_err(&invalid)?;
        let extra = parse_object(&extra).map_err(&invalid)?;
        let mut fields = parse_object(&variant).map_err(&invalid)?;
        let variant = variant_from_fields(kind, &mut fields).map_err(|e| invalid(e.to_string()))?;

        let mut entity = MediaEntity::with_variant(identity.clone(), variant);
        entity.name = name;
        entity.caption = caption;
        entity.metadata = metadata;
        entity.extra = extra;

        let mut stmt = self.conn.prepare_cached(
            "SELECT category, value FROM tags WHERE media_id = ?1 ORDER BY position, id",
        )?;
        entity.tags = stmt
            .query_map(params![identity.as_str()], |row| {
                Ok(Tag::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT type, to_id, strength FROM relationships
             WHERE from_id = ?1 ORDER BY type, position",
        )?;
        let edges = stmt.query_map(params![identity.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?;
        for edge in edges {
            let (kind, target, strength) = edge?;
            let target = Identity::new(target);
            entity.add_related(&kind, target.clone());
            if let Some(strength) = strength {
                entity.set_relation_strength(&kind, target, strength);
            }
        }

        Ok(Some(entity))
    }

    /// Remove an entity. Its tags and outgoing relations cascade;
    /// fingerprints stay since they describe immutable content.
    pub fn delete(&self, identity: &Identity) -> IndexResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM media WHERE id = ?1", params![identity.as_str()])?;
        Ok(n > 0)
    }

    pub fn count(&self) -> IndexResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Identities whose tags satisfy `filter`, ascending.
    pub fn query(&self, filter: &TagFilter) -> IndexResult<Vec<Identity>> {
        let (terms, depth) = (filter.term_count(), filter.sql_depth());
        if terms > MAX_FILTER_PARAMS || depth > MAX_FILTER_SQL_DEPTH {
            return Err(IndexError::FilterTooComplex { terms, depth });
        }
        let mut args = Vec::new();
        let condition = filter.to_sql(&mut args);
        let sql = format!("SELECT m.id FROM media m WHERE {} ORDER BY m.id", condition);
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0).map(Identity::new)
            })?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    /// Tags matching free text, most used first.
    ///
    /// Every word of `text` must prefix-match the category or value. Empty
    /// text lists the most used tags.
    pub fn search_tags(&self, text: &str, limit: usize) -> IndexResult<Vec<TagCount>> {
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let limit = limit as i64;

        if words.is_empty() {
            let mut stmt = self.conn.prepare(
                "SELECT category, value, COUNT(DISTINCT media_id) AS n FROM tags
                 GROUP BY category, value ORDER BY n DESC, category, value LIMIT ?1",
            )?;
            return collect_tag_counts(&mut stmt, params![limit]);
        }

        if self.fts {
            let expression = words
                .iter()
                .map(|w| format!("\"{}\"*", w.replace('"', "\"\"")))
                .collect::<Vec<_>>()
                .join(" ");
            let result = self
                .conn
                .prepare(
                    "SELECT t.category, t.value, COUNT(DISTINCT t.media_id) AS n
                     FROM tags_fts JOIN tags t ON t.id = tags_fts.rowid
                     WHERE tags_fts MATCH ?1
                     GROUP BY t.category, t.value
                     ORDER BY n DESC, t.category, t.value LIMIT ?2",
                )
                .and_then(|mut stmt| {
                    let found = stmt
                        .query_map(params![expression, limit], tag_count_row)?
                        .collect::<Result<Vec<_>, _>>();
                    found
                });
            match result {
                Ok(found) => return Ok(found),
                Err(e) => log::warn!("Full-text tag search failed, using LIKE: {}", e),
            }
        }

        let like = format!("%{}%", escape_like(&text.to_lowercase()));
        let mut stmt = self.conn.prepare(
            "SELECT category, value, COUNT(DISTINCT media_id) AS n FROM tags
             WHERE lower(category || ':' || value) LIKE ?1 ESCAPE '\\'
             GROUP BY category, value ORDER BY n DESC, category, value LIMIT ?2",
        )?;
        collect_tag_counts(&mut stmt, params![like, limit])
    }

    /// Store or replace the fingerprint of an entity.
    pub fn put_fingerprint(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
        fingerprint: &Fingerprint,
    ) -> IndexResult<()> {
        self.conn.execute(
            "INSERT INTO perceptual_hashes (media_id, algorithm, value, computed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(media_id, algorithm) DO UPDATE SET
                value = excluded.value,
                computed_at = excluded.computed_at",
            params![
                identity.as_str(),
                algorithm.as_str(),
                fingerprint.as_bytes(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_fingerprint(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
    ) -> IndexResult<Option<StoredFingerprint>> {
        let row = self
            .conn
            .query_row(
                "SELECT value, computed_at FROM perceptual_hashes
                 WHERE media_id = ?1 AND algorithm = ?2",
                params![identity.as_str(), algorithm.as_str()],
                |row| {
                    Ok(StoredFingerprint {
                        fingerprint: Fingerprint::from_bytes(row.get::<_, Vec<u8>>(0)?),
                        computed_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Fingerprints of every indexed entity for one algorithm.
    pub fn fingerprints(&self, algorithm: PerceptualAlgorithm) -> IndexResult<Vec<FingerprintEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT h.media_id, h.value FROM perceptual_hashes h
             JOIN media m ON m.id = h.media_id
             WHERE h.algorithm = ?1 ORDER BY h.media_id",
        )?;
        let entries = stmt
            .query_map(params![algorithm.as_str()], |row| {
                Ok(FingerprintEntry {
                    identity: Identity::new(row.get::<_, String>(0)?),
                    fingerprint: Fingerprint::from_bytes(row.get::<_, Vec<u8>>(1)?),
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(entries)
    }

    /// Entities within `max_distance` of `identity`'s fingerprint.
    ///
    /// Returns `None` when `identity` has no stored fingerprint. The probe is
    /// excluded; results are sorted by distance, then identity.
    pub fn find_similar(
        &self,
        identity: &Identity,
        algorithm: PerceptualAlgorithm,
        max_distance: u32,
    ) -> IndexResult<Option<Vec<(Identity, u32)>>> {
        let Some(probe) = self.get_fingerprint(identity, algorithm)? else {
            return Ok(None);
        };
        let index: FingerprintIndex = self.fingerprints(algorithm)?.into_iter().collect();
        let found = index
            .find(&probe.fingerprint, max_distance)
            .into_iter()
            .filter(|(_, entry)| &entry.identity != identity)
            .map(|(d, entry)| (entry.identity.clone(), d))
            .collect();
        Ok(Some(found))
    }

    /// Copy fingerprints of entities present here from another index file.
    ///
    /// Must not be called inside a bulk transaction.
    pub fn copy_fingerprints_from(&self, prior: &Path) -> IndexResult<usize> {
        self.conn.execute(
            "ATTACH DATABASE ?1 AS prior",
            params![prior.to_string_lossy()],
        )?;
        let copied = self.conn.execute(
            "INSERT OR IGNORE INTO perceptual_hashes (media_id, algorithm, value, computed_at)
             SELECT media_id, algorithm, value, computed_at FROM prior.perceptual_hashes
             WHERE media_id IN (SELECT id FROM media)",
            [],
        );
        let detached = self.conn.execute("DETACH DATABASE prior", []);
        let copied = copied?;
        detached?;
        Ok(copied)
    }

    /// Relations pointing at `target`, grouped by kind.
    pub fn incoming(&self, target: &Identity) -> IndexResult<BTreeMap<String, Vec<Identity>>> {
        let mut stmt = self.conn.prepare(
            "SELECT type, from_id FROM relationships WHERE to_id = ?1 ORDER BY type, from_id",
        )?;
        let rows = stmt.query_map(params![target.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out: BTreeMap<String, Vec<Identity>> = BTreeMap::new();
        for row in rows {
            let (kind, from) = row?;
            out.entry(kind).or_default().push(Identity::new(from));
        }
        Ok(out)
    }

    /// Open a transaction spanning many upserts.
    pub fn begin_bulk(&self) -> IndexResult<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn commit_bulk(&self) -> IndexResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Close the connection, reporting any error.
    pub fn close(self) -> IndexResult<()> {
        self.conn.close().map_err(|(_, e)| IndexError::Sqlite(e))
    }
}

fn parse_object(json: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn tag_count_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagCount> {
    Ok(TagCount {
        tag: Tag::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        count: row.get::<_, i64>(2)? as u64,
    })
}

fn collect_tag_counts(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> IndexResult<Vec<TagCount>> {
    let rows = stmt
        .query_map(params, tag_count_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
