use std::fs;
use std::path::{Path, PathBuf};
use tagstore::config::StoreConfig;
use tagstore::events::LibraryEvent;
use tagstore::model::Identity;
use tagstore::{Library, StoreError};
use tempfile::tempdir;

fn write_png(path: &Path, width: u32, height: u32) -> PathBuf {
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
    .save(path)
    .unwrap();
    path.to_path_buf()
}

fn library_with_image(width: u32, height: u32) -> (tempfile::TempDir, Library, Identity) {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "cache", StoreConfig::default()).unwrap();
    let source = write_png(&dir.path().join("photo.png"), width, height);
    let entity = library.import_media(&source, &[]).unwrap();
    (dir, library, entity.identity)
}

#[test]
fn test_thumbnail_generated_from_library_media() {
    let (_dir, library, id) = library_with_image(600, 300);
    let path = library.request_thumbnail(&id, None).unwrap();

    assert_eq!(
        path,
        library
            .layout()
            .cache_dir()
            .join("thumbnails")
            .join(format!("{}.jpg", id))
    );
    assert_eq!(image::image_dimensions(&path).unwrap(), (150, 75));
}

#[test]
fn test_repeated_requests_reuse_artifact() {
    let (_dir, library, id) = library_with_image(300, 300);
    let first = library.request_preview(&id, Some(100), None).unwrap();
    let modified = fs::metadata(&first).unwrap().modified().unwrap();
    let bytes = fs::read(&first).unwrap();

    let second = library.request_preview(&id, Some(100), None).unwrap();
    assert_eq!(first, second);
    assert!(first.ends_with(format!("lowres/{}_100.jpg", id)));
    assert_eq!(fs::metadata(&second).unwrap().modified().unwrap(), modified);
    assert_eq!(fs::read(&second).unwrap(), bytes);
}

#[test]
fn test_preview_default_size_from_config() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        default_preview_dim: 64,
        ..StoreConfig::default()
    };
    let library = Library::create(dir.path().join("lib"), "cache", config).unwrap();
    let source = write_png(&dir.path().join("p.png"), 256, 128);
    let id = library.import_media(&source, &[]).unwrap().identity;

    let path = library.request_preview(&id, None, None).unwrap();
    assert!(path.ends_with(format!("lowres/{}_64.jpg", id)));
    assert_eq!(image::image_dimensions(&path).unwrap(), (64, 32));
}

#[test]
fn test_explicit_source_used_for_entity_without_media() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "cache", StoreConfig::default()).unwrap();
    library
        .save_entity(&tagstore::model::MediaEntity::new("nomedia"))
        .unwrap();

    let err = library.request_thumbnail(&"nomedia".into(), None).unwrap_err();
    assert!(matches!(err, StoreError::GenerationFailed { .. }));

    let source = write_png(&dir.path().join("elsewhere.png"), 40, 20);
    let path = library
        .request_thumbnail(&"nomedia".into(), Some(&source))
        .unwrap();
    assert_eq!(image::image_dimensions(&path).unwrap(), (40, 20));
}

#[test]
fn test_unknown_entity_is_not_found() {
    let (_dir, library, _) = library_with_image(10, 10);
    assert!(matches!(
        library.request_thumbnail(&"missing".into(), None),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_explicit_source_cannot_escape_cache() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "cache", StoreConfig::default()).unwrap();
    let source = write_png(&dir.path().join("src.png"), 32, 32);

    let escaped = Identity::from("../../../escaped");
    assert!(matches!(
        library.request_thumbnail(&escaped, Some(&source)),
        Err(StoreError::InvalidIdentity(_))
    ));
    assert!(matches!(
        library.request_preview(&escaped, Some(64), Some(&source)),
        Err(StoreError::InvalidIdentity(_))
    ));
    assert!(!dir.path().join("escaped.jpg").exists());
    assert!(!dir.path().join("escaped_64.jpg").exists());
}

#[test]
fn test_soft_delete_invalidates_artifacts() {
    let (_dir, library, id) = library_with_image(200, 100);
    let thumb = library.request_thumbnail(&id, None).unwrap();
    let preview = library.request_preview(&id, Some(50), None).unwrap();

    library.soft_delete_entity(&id).unwrap();
    assert!(!thumb.exists());
    assert!(!preview.exists());
}

#[test]
fn test_deleted_artifact_is_regenerated() {
    let (_dir, library, id) = library_with_image(200, 100);
    let thumb = library.request_thumbnail(&id, None).unwrap();
    fs::remove_file(&thumb).unwrap();
    assert_eq!(library.request_thumbnail(&id, None).unwrap(), thumb);
    assert!(thumb.is_file());
}

#[test]
fn test_clear_cache_empties_and_notifies() {
    let (_dir, library, id) = library_with_image(200, 100);
    library.request_thumbnail(&id, None).unwrap();
    library.request_preview(&id, Some(80), None).unwrap();
    assert!(library.cache_size() > 0);

    let events = library.subscribe();
    library.clear_cache().unwrap();
    assert_eq!(library.cache_size(), 0);
    assert_eq!(events.try_recv().unwrap(), LibraryEvent::CacheCleared);

    // The cache still works after clearing.
    let again = library.request_thumbnail(&id, None).unwrap();
    assert!(again.is_file());
}
