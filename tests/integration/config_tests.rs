use std::fs;
use tagstore::config::StoreConfig;
use tagstore::similarity::PerceptualAlgorithm;
use tempfile::tempdir;

#[test]
fn test_load_explicit_file_overrides_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
thumbnail_size = 200
worker_threads = 2
default_algorithm = "dhash"
default_threshold = 4
auto_rebuild = false
"#,
    )
    .unwrap();

    let config = StoreConfig::load(Some(&path)).unwrap();
    assert_eq!(config.thumbnail_size, 200);
    assert_eq!(config.worker_threads, 2);
    assert!(!config.auto_rebuild);
    assert_eq!(config.default_algorithm, PerceptualAlgorithm::Dhash);
    assert_eq!(config.threshold_for(PerceptualAlgorithm::Phash), 4);
    // Unset keys keep their defaults.
    assert_eq!(config.thumbnail_quality, 85);
    assert_eq!(config.index_failure_threshold, 3);
}

#[test]
fn test_save_then_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested/config.toml");
    let config = StoreConfig {
        default_preview_dim: 512,
        accessible_progress: true,
        ..StoreConfig::default()
    };
    config.save(&path).unwrap();

    let loaded = StoreConfig::load(Some(&path)).unwrap();
    assert_eq!(loaded.default_preview_dim, 512);
    assert!(loaded.accessible_progress);
}

#[test]
fn test_invalid_values_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "thumbnail_size = \"big\"\n").unwrap();
    assert!(StoreConfig::load(Some(&path)).is_err());

    fs::write(&path, "default_algorithm = \"whash\"\n").unwrap();
    assert!(StoreConfig::load(Some(&path)).is_err());

    fs::write(&path, "thumbnail_size = 0\n").unwrap();
    assert!(StoreConfig::load(Some(&path)).is_err());
}

#[test]
fn test_out_of_range_quality_clamped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "thumbnail_quality = 150\n").unwrap();
    assert_eq!(StoreConfig::load(Some(&path)).unwrap().thumbnail_quality, 100);
}

#[test]
fn test_environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "preview_quality = 70\n").unwrap();

    std::env::set_var("TAGSTORE_PREVIEW_QUALITY", "55");
    let config = StoreConfig::load(Some(&path));
    std::env::remove_var("TAGSTORE_PREVIEW_QUALITY");

    assert_eq!(config.unwrap().preview_quality, 55);
}
