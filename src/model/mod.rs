//! Media entity model.
//!
//! Every media item in a library is a [`MediaEntity`]: a set of shared fields
//! (name, caption, ordered tags, relations, open metadata) plus a
//! [`MediaVariant`] payload carrying the fields specific to images, masks,
//! video frames and crops.
//!
//! The on-disk JSON shape lives in [`record`]; content-derived identities are
//! computed in [`identity`].

pub mod identity;
pub mod record;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub use identity::{compute_identity, IDENTITY_LEN};
pub use record::{entity_from_json, entity_to_json, RecordError};

/// Relation kind written by the similarity engine.
pub const RELATION_SIMILAR: &str = "similar";

/// Stable, content-derived key of an entity.
///
/// Used as the filename stem of every canonical file and as the index
/// primary key. Relation targets are also identities, but they are never
/// validated: dangling or legacy references are preserved as-is.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a raw identity string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identity can safely be used as a filename stem.
    ///
    /// Only ASCII alphanumerics, `-` and `_` are accepted so an identity can
    /// never escape the library directory.
    #[must_use]
    pub fn is_valid_key(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single `category:value` tag.
///
/// Tags carry no position of their own: the index of a tag in
/// [`MediaEntity::tags`] is its position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub category: String,
    pub value: String,
}

impl Tag {
    #[must_use]
    pub fn new(category: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            value: value.into(),
        }
    }

    /// The `category:value` form used by tag filters.
    #[must_use]
    pub fn full(&self) -> String {
        format!("{}:{}", self.category, self.value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.value)
    }
}

/// Discriminator of the entity variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Mask,
    VideoFrame,
    Crop,
}

impl MediaKind {
    /// Name used in the `type` JSON field and the index `kind` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Mask => "mask",
            Self::VideoFrame => "video_frame",
            Self::Crop => "crop",
        }
    }

    /// Parse a kind name. Unknown names yield `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(Self::Image),
            "mask" => Some(Self::Mask),
            "video_frame" => Some(Self::VideoFrame),
            "crop" => Some(Self::Crop),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crop rectangle in parent-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// Variant-specific payload of an entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MediaVariant {
    #[default]
    Image,
    Mask {
        source_image: Identity,
        mask_category: String,
    },
    VideoFrame {
        source_video: Identity,
        frame_index: u64,
        timestamp_seconds: f64,
    },
    Crop {
        parent_image: Identity,
        crop_rect: CropRect,
        aspect_ratio: String,
        created_at: String,
    },
}

impl MediaVariant {
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Image => MediaKind::Image,
            Self::Mask { .. } => MediaKind::Mask,
            Self::VideoFrame { .. } => MediaKind::VideoFrame,
            Self::Crop { .. } => MediaKind::Crop,
        }
    }

    /// The entity this variant was derived from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&Identity> {
        match self {
            Self::Image => None,
            Self::Mask { source_image, .. } => Some(source_image),
            Self::VideoFrame { source_video, .. } => Some(source_video),
            Self::Crop { parent_image, .. } => Some(parent_image),
        }
    }
}

/// A media item with its tags, relations and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEntity {
    /// Content-derived key; never reassigned.
    pub identity: Identity,
    /// Free-text display name.
    pub name: String,
    /// Free-text caption, mirrored to the `.txt` sidecar.
    pub caption: String,
    /// Ordered tags; order is significant and duplicates are allowed.
    pub tags: Vec<Tag>,
    /// Relation kind to ordered, duplicate-free target identities.
    pub related: BTreeMap<String, Vec<Identity>>,
    /// Optional per-edge strength (e.g. Hamming distance for `similar`).
    pub related_strength: BTreeMap<String, BTreeMap<Identity, f64>>,
    /// Open metadata map, preserved verbatim.
    pub metadata: Map<String, Value>,
    /// Unknown top-level record fields, preserved verbatim.
    pub extra: Map<String, Value>,
    pub variant: MediaVariant,
}

impl MediaEntity {
    /// Create an empty image entity.
    #[must_use]
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self::with_variant(identity, MediaVariant::Image)
    }

    /// Create an empty entity of the given variant.
    #[must_use]
    pub fn with_variant(identity: impl Into<Identity>, variant: MediaVariant) -> Self {
        Self {
            identity: identity.into(),
            name: String::new(),
            caption: String::new(),
            tags: Vec::new(),
            related: BTreeMap::new(),
            related_strength: BTreeMap::new(),
            metadata: Map::new(),
            extra: Map::new(),
            variant,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.variant.kind()
    }

    /// Append a tag. Duplicates are kept.
    pub fn add_tag(&mut self, category: impl Into<String>, value: impl Into<String>) {
        self.tags.push(Tag::new(category, value));
    }

    /// Remove the first tag equal to `tag`. Returns whether one was removed.
    pub fn remove_tag(&mut self, tag: &Tag) -> bool {
        match self.tags.iter().position(|t| t == tag) {
            Some(idx) => {
                self.tags.remove(idx);
                true
            }
            None => false,
        }
    }

    /// All tags of one category, in order.
    #[must_use]
    pub fn tags_by_category(&self, category: &str) -> Vec<&Tag> {
        self.tags.iter().filter(|t| t.category == category).collect()
    }

    /// Add a relation target. Returns `false` if it was already present.
    pub fn add_related(&mut self, kind: &str, target: Identity) -> bool {
        let targets = self.related.entry(kind.to_string()).or_default();
        if targets.contains(&target) {
            return false;
        }
        targets.push(target);
        true
    }

    /// Remove a relation target, dropping the kind once it is empty.
    pub fn remove_related(&mut self, kind: &str, target: &Identity) -> bool {
        let Some(targets) = self.related.get_mut(kind) else {
            return false;
        };
        let before = targets.len();
        targets.retain(|t| t != target);
        let removed = targets.len() != before;
        if targets.is_empty() {
            self.related.remove(kind);
        }
        if let Some(strengths) = self.related_strength.get_mut(kind) {
            strengths.remove(target);
            if strengths.is_empty() {
                self.related_strength.remove(kind);
            }
        }
        removed
    }

    /// Targets of one relation kind (empty if none).
    #[must_use]
    pub fn related_to(&self, kind: &str) -> &[Identity] {
        self.related.get(kind).map_or(&[], Vec::as_slice)
    }

    /// Strength recorded for one edge, if any.
    #[must_use]
    pub fn relation_strength(&self, kind: &str, target: &Identity) -> Option<f64> {
        self.related_strength.get(kind)?.get(target).copied()
    }

    /// Set the strength of an existing or new edge.
    pub fn set_relation_strength(&mut self, kind: &str, target: Identity, strength: f64) {
        self.related_strength
            .entry(kind.to_string())
            .or_default()
            .insert(target, strength);
    }

    /// Display name: the first `name:` tag, then the name field, then "Unnamed".
    #[must_use]
    pub fn display_name(&self) -> &str {
        if let Some(tag) = self.tags.iter().find(|t| t.category == "name") {
            return &tag.value;
        }
        if self.name.is_empty() {
            "Unnamed"
        } else {
            &self.name
        }
    }
}
