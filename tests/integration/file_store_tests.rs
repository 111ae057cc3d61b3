use std::fs;
use tagstore::model::{
    CropRect, Identity, MediaEntity, MediaKind, MediaVariant, Tag, RELATION_SIMILAR,
};
use tagstore::store::{FileStore, LibraryLayout};
use tagstore::StoreError;
use tempfile::tempdir;

fn store_in(dir: &std::path::Path) -> FileStore {
    let store = FileStore::new(LibraryLayout::new(dir));
    store.ensure_dirs().unwrap();
    store
}

#[test]
fn test_round_trip_every_variant() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());

    let mut image = MediaEntity::new("img0000000000001");
    image.name = "lake at dawn".to_string();
    image.caption = "A lake.\nSecond line.".to_string();
    image.add_tag("class", "lake");
    image.add_tag("class", "lake");
    image.add_tag("name", "Dawn");
    image.add_related("masks", Identity::from("msk0000000000001"));
    image
        .metadata
        .insert("camera".to_string(), serde_json::json!({"iso": 200}));

    let mask = MediaEntity::with_variant(
        "msk0000000000001",
        MediaVariant::Mask {
            source_image: "img0000000000001".into(),
            mask_category: "water".to_string(),
        },
    );
    let frame = MediaEntity::with_variant(
        "frm0000000000001",
        MediaVariant::VideoFrame {
            source_video: "vid0000000000001".into(),
            frame_index: 42,
            timestamp_seconds: 1.75,
        },
    );
    let crop = MediaEntity::with_variant(
        "crp0000000000001",
        MediaVariant::Crop {
            parent_image: "img0000000000001".into(),
            crop_rect: CropRect {
                x: 10,
                y: 20,
                width: 300,
                height: 200,
            },
            aspect_ratio: "3:2".to_string(),
            created_at: "2024-05-01T12:00:00".to_string(),
        },
    );

    for entity in [&image, &mask, &frame, &crop] {
        store.save(entity).unwrap();
        let loaded = store.load(&entity.identity).unwrap();
        assert_eq!(&loaded, entity);
    }

    assert_eq!(
        fs::read_to_string(dir.path().join("images/img0000000000001.txt")).unwrap(),
        "A lake.\nSecond line."
    );
    assert!(!dir.path().join("images/msk0000000000001.txt").exists());
    assert_eq!(store.load(&"crp0000000000001".into()).unwrap().kind(), MediaKind::Crop);
}

#[test]
fn test_image_records_omit_type() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    store.save(&MediaEntity::new("a")).unwrap();
    let json: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("images/a.json")).unwrap()).unwrap();
    assert!(json.get("type").is_none());
    assert_eq!(json["tags"], serde_json::json!([]));
}

#[test]
fn test_clearing_caption_removes_sidecar() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    let mut entity = MediaEntity::new("a");
    entity.caption = "words".to_string();
    store.save(&entity).unwrap();
    assert!(dir.path().join("images/a.txt").is_file());

    entity.caption.clear();
    store.save(&entity).unwrap();
    assert!(!dir.path().join("images/a.txt").exists());
}

#[test]
fn test_legacy_record_migrates_similar_images() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    fs::write(
        dir.path().join("images/old.json"),
        r#"{
            "name": "old",
            "tags": [{"category": "class", "value": "lake", "position": 7}],
            "similar_images": [["p2", 4], "p3"],
            "rating": 5
        }"#,
    )
    .unwrap();

    let entity = store.load(&"old".into()).unwrap();
    assert_eq!(entity.kind(), MediaKind::Image);
    assert!(entity.metadata.is_empty());
    assert_eq!(entity.tags, vec![Tag::new("class", "lake")]);
    assert_eq!(
        entity.related_to(RELATION_SIMILAR),
        &[Identity::from("p2"), Identity::from("p3")]
    );
    assert_eq!(
        entity.relation_strength(RELATION_SIMILAR, &"p2".into()),
        Some(4.0)
    );
    assert_eq!(entity.extra.get("rating"), Some(&serde_json::json!(5)));

    // Saving writes the modern shape and keeps unknown keys.
    store.save(&entity).unwrap();
    let json: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("images/old.json")).unwrap()).unwrap();
    assert!(json.get("similar_images").is_none());
    assert_eq!(json["related"]["similar"], serde_json::json!(["p2", "p3"]));
    assert_eq!(json["rating"], serde_json::json!(5));
    assert_eq!(json["tags"][0]["position"], serde_json::json!(0));
}

#[test]
fn test_soft_delete_moves_all_files() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    let mut entity = MediaEntity::new("gone");
    entity.caption = "bye".to_string();
    store.save(&entity).unwrap();
    fs::write(dir.path().join("images/gone.png"), b"png bytes").unwrap();
    fs::write(dir.path().join("images/gonefishing.json"), b"{}").unwrap();

    let moved = store.soft_delete(&"gone".into()).unwrap();
    assert_eq!(moved.len(), 3);
    for name in ["gone.json", "gone.txt", "gone.png"] {
        assert!(!dir.path().join("images").join(name).exists());
        assert!(dir.path().join("deleted").join(name).exists());
    }
    // A different identity sharing the prefix is untouched.
    assert!(dir.path().join("images/gonefishing.json").exists());
    assert!(matches!(
        store.load(&"gone".into()),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_soft_delete_conflict_gets_suffix() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    store.save(&MediaEntity::new("dup")).unwrap();
    store.soft_delete(&"dup".into()).unwrap();
    store.save(&MediaEntity::new("dup")).unwrap();
    let moved = store.soft_delete(&"dup".into()).unwrap();

    assert_eq!(moved, vec![dir.path().join("deleted/dup_1.json")]);
    assert!(dir.path().join("deleted/dup.json").exists());
}

#[test]
fn test_soft_delete_missing_is_not_found() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    assert!(matches!(
        store.soft_delete(&"nothing".into()),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_scan_all_lists_only_records() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    for id in ["b", "a", "c"] {
        store.save(&MediaEntity::new(id)).unwrap();
    }
    fs::write(dir.path().join("images/a.png"), b"x").unwrap();
    fs::write(dir.path().join("images/notes.txt"), b"x").unwrap();

    let mut ids: Vec<String> = store.scan_all().map(|id| id.to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(store.count_estimate(), 3);
}

#[test]
fn test_corrupt_record_reported() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    fs::write(dir.path().join("images/bad.json"), b"{ not json").unwrap();
    assert!(matches!(
        store.load(&"bad".into()),
        Err(StoreError::Corrupt { .. })
    ));
}

#[test]
fn test_path_like_identity_rejected() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    let entity = MediaEntity::new("../escape");
    assert!(matches!(
        store.save(&entity),
        Err(StoreError::InvalidIdentity(_))
    ));
    assert!(!dir.path().join("escape.json").exists());
}

#[test]
fn test_locate_media_prefers_images() {
    let dir = tempdir().unwrap();
    let store = store_in(dir.path());
    assert!(store.locate_media(&"m".into()).is_none());
    fs::write(dir.path().join("images/m.mp4"), b"x").unwrap();
    assert_eq!(
        store.locate_media(&"m".into()),
        Some(dir.path().join("images/m.mp4"))
    );
    fs::write(dir.path().join("images/m.webp"), b"x").unwrap();
    assert_eq!(
        store.locate_media(&"m".into()),
        Some(dir.path().join("images/m.webp"))
    );
}
