//! JSON record format of an entity (`<identity>.json`).
//!
//! Reading is done field by field from a generic JSON object so that
//! records written by older versions load transparently:
//!
//! - a missing `type` means `image`
//! - a missing `metadata` means an empty map
//! - a legacy top-level `similar_images` list (plain ids or `[id, distance]`
//!   pairs) becomes `related["similar"]`
//! - unknown keys are kept in [`MediaEntity::extra`] and written back
//!
//! Writing emits `type` only for non-image variants, matching what older
//! readers expect.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use super::{CropRect, Identity, MediaEntity, MediaKind, MediaVariant, RELATION_SIMILAR};

/// Keys handled explicitly; anything else round-trips through `extra`.
const KNOWN_KEYS: &[&str] = &[
    "type",
    "name",
    "caption",
    "tags",
    "related",
    "related_strength",
    "metadata",
];

/// Errors raised while decoding an entity record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The bytes are not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The top-level JSON value is not an object.
    #[error("record is not a JSON object")]
    NotAnObject,

    /// A known field holds a value of the wrong shape.
    #[error("field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}

fn wrong_type(field: &str, expected: &'static str) -> RecordError {
    RecordError::WrongType {
        field: field.to_string(),
        expected,
    }
}

/// Decode an entity from the bytes of its JSON record.
pub fn entity_from_json(identity: Identity, bytes: &[u8]) -> Result<MediaEntity, RecordError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut obj) = value else {
        return Err(RecordError::NotAnObject);
    };

    let type_name = take_string(&mut obj, "type")?;
    let kind = match type_name.as_deref() {
        None => MediaKind::Image,
        Some(name) => match MediaKind::parse(name) {
            Some(kind) => kind,
            None => {
                // Unknown media types load as images; keep the original tag.
                log::debug!("Unknown media type {:?} for {}, loading as image", name, identity);
                obj.insert("type".to_string(), Value::String(name.to_string()));
                MediaKind::Image
            }
        },
    };

    let name = take_string(&mut obj, "name")?.unwrap_or_default();
    let caption = take_string(&mut obj, "caption")?.unwrap_or_default();
    let tags = match obj.remove("tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => parse_tags(value)?,
    };
    let mut related = match obj.remove("related") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(value) => parse_related(value)?,
    };
    let mut related_strength = match obj.remove("related_strength") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(value) => parse_strengths(value)?,
    };
    let metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(wrong_type("metadata", "an object")),
    };

    if let Some(legacy) = obj.remove("similar_images") {
        let has_similar = related
            .get(RELATION_SIMILAR)
            .is_some_and(|targets: &Vec<Identity>| !targets.is_empty());
        if !has_similar {
            let (targets, strengths) = parse_legacy_similar(legacy)?;
            if !targets.is_empty() {
                related.insert(RELATION_SIMILAR.to_string(), targets);
            }
            if !strengths.is_empty() {
                related_strength.insert(RELATION_SIMILAR.to_string(), strengths);
            }
        }
    }

    // A strength without its edge is meaningless.
    related_strength.retain(|kind, edges| {
        let targets = related.get(kind).map_or(&[][..], Vec::as_slice);
        edges.retain(|target, _| targets.contains(target));
        !edges.is_empty()
    });

    let variant = variant_from_fields(kind, &mut obj)?;

    Ok(MediaEntity {
        identity,
        name,
        caption,
        tags,
        related,
        related_strength,
        metadata,
        extra: obj,
        variant,
    })
}

#[derive(Serialize)]
struct TagOut<'a> {
    category: &'a str,
    value: &'a str,
    position: usize,
}

#[derive(Serialize)]
struct RecordOut<'a> {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(flatten)]
    variant: Map<String, Value>,
    name: &'a str,
    caption: &'a str,
    tags: Vec<TagOut<'a>>,
    related: BTreeMap<&'a str, &'a Vec<Identity>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    related_strength: BTreeMap<&'a str, BTreeMap<&'a Identity, f64>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Encode an entity as a pretty-printed JSON record.
pub fn entity_to_json(entity: &MediaEntity) -> Result<Vec<u8>, RecordError> {
    let variant = variant_fields(&entity.variant);
    let extra = entity
        .extra
        .iter()
        .filter(|(k, _)| !variant.contains_key(*k) && !is_known_key(k, entity.kind()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let record = RecordOut {
        kind: match entity.kind() {
            MediaKind::Image => None,
            other => Some(other.as_str()),
        },
        variant,
        name: &entity.name,
        caption: &entity.caption,
        tags: entity
            .tags
            .iter()
            .enumerate()
            .map(|(position, t)| TagOut {
                category: &t.category,
                value: &t.value,
                position,
            })
            .collect(),
        related: entity
            .related
            .iter()
            .filter(|(_, targets)| !targets.is_empty())
            .map(|(k, targets)| (k.as_str(), targets))
            .collect(),
        related_strength: entity
            .related_strength
            .iter()
            .filter_map(|(k, edges)| {
                let targets = entity.related_to(k);
                let kept: BTreeMap<&Identity, f64> = edges
                    .iter()
                    .filter(|(t, _)| targets.contains(t))
                    .map(|(t, s)| (t, *s))
                    .collect();
                (!kept.is_empty()).then_some((k.as_str(), kept))
            })
            .collect(),
        metadata: entity.metadata.clone(),
        extra,
    };

    let mut out = serde_json::to_vec_pretty(&record)?;
    out.push(b'\n');
    Ok(out)
}

fn is_known_key(key: &str, kind: MediaKind) -> bool {
    // An image keeps an unknown `type` in `extra` so it survives a rewrite.
    if key == "type" {
        return kind != MediaKind::Image;
    }
    KNOWN_KEYS.contains(&key)
}

/// Variant-specific fields as they appear in the record.
pub(crate) fn variant_fields(variant: &MediaVariant) -> Map<String, Value> {
    let mut map = Map::new();
    match variant {
        MediaVariant::Image => {}
        MediaVariant::Mask {
            source_image,
            mask_category,
        } => {
            map.insert("source_image".into(), source_image.as_str().into());
            map.insert("mask_category".into(), mask_category.as_str().into());
        }
        MediaVariant::VideoFrame {
            source_video,
            frame_index,
            timestamp_seconds,
        } => {
            map.insert("source_video".into(), source_video.as_str().into());
            map.insert("frame_index".into(), (*frame_index).into());
            map.insert("timestamp".into(), (*timestamp_seconds).into());
        }
        MediaVariant::Crop {
            parent_image,
            crop_rect,
            aspect_ratio,
            created_at,
        } => {
            map.insert("parent_image".into(), parent_image.as_str().into());
            map.insert(
                "crop_rect".into(),
                Value::Array(vec![
                    crop_rect.x.into(),
                    crop_rect.y.into(),
                    crop_rect.width.into(),
                    crop_rect.height.into(),
                ]),
            );
            map.insert("aspect_ratio".into(), aspect_ratio.as_str().into());
            map.insert("created_at".into(), created_at.as_str().into());
        }
    }
    map
}

/// Build the variant payload for `kind`, consuming its fields from `fields`.
pub(crate) fn variant_from_fields(
    kind: MediaKind,
    fields: &mut Map<String, Value>,
) -> Result<MediaVariant, RecordError> {
    Ok(match kind {
        MediaKind::Image => MediaVariant::Image,
        MediaKind::Mask => MediaVariant::Mask {
            source_image: take_string(fields, "source_image")?
                .unwrap_or_default()
                .into(),
            mask_category: take_string(fields, "mask_category")?.unwrap_or_default(),
        },
        MediaKind::VideoFrame => MediaVariant::VideoFrame {
            source_video: take_string(fields, "source_video")?
                .unwrap_or_default()
                .into(),
            frame_index: match fields.remove("frame_index") {
                None | Some(Value::Null) => 0,
                Some(v) => as_index(&v).ok_or_else(|| wrong_type("frame_index", "a non-negative integer"))?,
            },
            timestamp_seconds: match fields.remove("timestamp") {
                None | Some(Value::Null) => 0.0,
                Some(v) => v.as_f64().ok_or_else(|| wrong_type("timestamp", "a number"))?,
            },
        },
        MediaKind::Crop => MediaVariant::Crop {
            parent_image: take_string(fields, "parent_image")?
                .unwrap_or_default()
                .into(),
            crop_rect: match fields.remove("crop_rect") {
                None | Some(Value::Null) => CropRect::default(),
                Some(v) => parse_crop_rect(&v)?,
            },
            aspect_ratio: take_string(fields, "aspect_ratio")?
                .unwrap_or_else(|| "auto".to_string()),
            created_at: take_string(fields, "created_at")?.unwrap_or_default(),
        },
    })
}

fn as_index(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

fn parse_crop_rect(value: &Value) -> Result<CropRect, RecordError> {
    let err = || wrong_type("crop_rect", "an array of four integers");
    let items = value.as_array().ok_or_else(err)?;
    if items.len() != 4 {
        return Err(err());
    }
    let mut nums = [0i64; 4];
    for (slot, item) in nums.iter_mut().zip(items) {
        *slot = item.as_i64().ok_or_else(err)?;
    }
    Ok(CropRect {
        x: nums[0],
        y: nums[1],
        width: nums[2],
        height: nums[3],
    })
}

/// Remove `key` and return it as a string; scalars are stringified.
fn take_string(obj: &mut Map<String, Value>, key: &str) -> Result<Option<String>, RecordError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(value)
            .map(Some)
            .ok_or_else(|| wrong_type(key, "a string")),
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_tags(value: Value) -> Result<Vec<super::Tag>, RecordError> {
    let Value::Array(items) = value else {
        return Err(wrong_type("tags", "an array"));
    };
    items
        .into_iter()
        .map(|item| {
            let Value::Object(mut tag) = item else {
                return Err(wrong_type("tags", "an array of objects"));
            };
            Ok(super::Tag {
                category: take_string(&mut tag, "category")?.unwrap_or_default(),
                value: take_string(&mut tag, "value")?.unwrap_or_default(),
            })
        })
        .collect()
}

fn parse_related(value: Value) -> Result<BTreeMap<String, Vec<Identity>>, RecordError> {
    let Value::Object(kinds) = value else {
        return Err(wrong_type("related", "an object"));
    };
    let mut related = BTreeMap::new();
    for (kind, targets) in kinds {
        let Value::Array(items) = targets else {
            return Err(wrong_type("related", "an object of arrays"));
        };
        let mut ids: Vec<Identity> = Vec::with_capacity(items.len());
        for item in items {
            let id = scalar_to_string(item)
                .map(Identity::new)
                .ok_or_else(|| wrong_type("related", "an object of string arrays"))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if !ids.is_empty() {
            related.insert(kind, ids);
        }
    }
    Ok(related)
}

fn parse_strengths(
    value: Value,
) -> Result<BTreeMap<String, BTreeMap<Identity, f64>>, RecordError> {
    let Value::Object(kinds) = value else {
        return Err(wrong_type("related_strength", "an object"));
    };
    let mut out = BTreeMap::new();
    for (kind, edges) in kinds {
        let Value::Object(edges) = edges else {
            return Err(wrong_type("related_strength", "an object of objects"));
        };
        let mut map = BTreeMap::new();
        for (target, strength) in edges {
            let strength = strength
                .as_f64()
                .ok_or_else(|| wrong_type("related_strength", "numeric strengths"))?;
            map.insert(Identity::new(target), strength);
        }
        out.insert(kind, map);
    }
    Ok(out)
}

/// Old records stored `similar_images` as `["id", ...]` or `[["id", dist], ...]`.
fn parse_legacy_similar(
    value: Value,
) -> Result<(Vec<Identity>, BTreeMap<Identity, f64>), RecordError> {
    let mut targets = Vec::new();
    let mut strengths = BTreeMap::new();
    let items = match value {
        Value::Null => return Ok((targets, strengths)),
        Value::Array(items) => items,
        _ => return Err(wrong_type("similar_images", "an array")),
    };
    for item in items {
        let (id, distance) = match item {
            Value::String(id) => (id, None),
            Value::Array(pair) => {
                let mut pair = pair.into_iter();
                let id = pair
                    .next()
                    .and_then(scalar_to_string)
                    .ok_or_else(|| wrong_type("similar_images", "[id, distance] pairs"))?;
                (id, pair.next().and_then(|d| d.as_f64()))
            }
            _ => return Err(wrong_type("similar_images", "strings or [id, distance] pairs")),
        };
        let id = Identity::new(id);
        if let Some(distance) = distance {
            strengths.insert(id.clone(), distance);
        }
        if !targets.contains(&id) {
            targets.push(id);
        }
    }
    Ok((targets, strengths))
}
