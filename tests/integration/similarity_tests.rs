use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tagstore::config::StoreConfig;
use tagstore::model::{Identity, RELATION_SIMILAR};
use tagstore::similarity::{
    cluster_fingerprints, Fingerprint, FingerprintEntry, PerceptualAlgorithm, SimilarityEngine,
};
use tagstore::{Library, StoreError};
use tempfile::tempdir;

fn entry(id: &str, bytes: &[u8]) -> FingerprintEntry {
    FingerprintEntry {
        identity: id.into(),
        fingerprint: Fingerprint::from_bytes(bytes.to_vec()),
    }
}

/// 128x128 grey image of 8x8 blocks with pseudo-random levels.
fn write_texture(path: &Path, seed: u32, bump_first_block: u8) {
    let mut levels = [0u8; 256];
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    for level in levels.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *level = (state % 256) as u8;
    }
    image::GrayImage::from_fn(128, 128, |x, y| {
        let block = ((y / 8) * 16 + x / 8) as usize;
        let mut v = levels[block];
        if block == 0 {
            v = v.saturating_add(bump_first_block);
        }
        image::Luma([v])
    })
    .save(path)
    .unwrap();
}

#[test]
fn test_clustering_is_transitive() {
    // a-b and b-c are within 2 bits, a-c is 4 bits apart.
    let entries = vec![
        entry("a", &[0b0000_0000]),
        entry("b", &[0b0000_0011]),
        entry("c", &[0b0000_1111]),
        entry("z", &[0b1111_0000]),
    ];
    let clustering = cluster_fingerprints(&entries, 2, None, None).unwrap();

    assert_eq!(
        clustering.clusters,
        vec![
            vec![Identity::from("a"), Identity::from("b"), Identity::from("c")],
            vec![Identity::from("z")],
        ]
    );
    let pairs: Vec<(&str, &str, u32)> = clustering
        .edges
        .iter()
        .map(|e| (e.from.as_str(), e.to.as_str(), e.distance))
        .collect();
    assert_eq!(pairs, vec![("a", "b", 2), ("b", "c", 2)]);
    assert_eq!(clustering.comparisons, 6);
}

#[test]
fn test_clustering_is_order_independent() {
    let forward = vec![
        entry("a", &[0x00]),
        entry("b", &[0x01]),
        entry("c", &[0xf0]),
    ];
    let mut backward = forward.clone();
    backward.reverse();
    let engine = SimilarityEngine::new(2);
    assert_eq!(
        engine.cluster(&forward, 1, None, None).unwrap(),
        engine.cluster(&backward, 1, None, None).unwrap()
    );
}

#[test]
fn test_cancelled_clustering_returns_nothing() {
    let entries = vec![entry("a", &[0x00]), entry("b", &[0x01])];
    let cancel = AtomicBool::new(true);
    assert!(matches!(
        cluster_fingerprints(&entries, 4, Some(&cancel), None),
        Err(StoreError::Cancelled)
    ));
}

#[test]
fn test_library_cluster_records_symmetric_edges() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "sim", StoreConfig::default()).unwrap();
    let (a, b, c) = (
        dir.path().join("a.png"),
        dir.path().join("b.png"),
        dir.path().join("c.png"),
    );
    write_texture(&a, 1, 0);
    write_texture(&b, 1, 6);
    write_texture(&c, 99, 0);
    let ia = library.import_media(&a, &[]).unwrap().identity;
    let ib = library.import_media(&b, &[]).unwrap().identity;
    let ic = library.import_media(&c, &[]).unwrap().identity;
    assert_ne!(ia, ib);

    let candidates = library.list_identities().unwrap();
    let report = library
        .cluster_similar(&candidates, PerceptualAlgorithm::Phash, Some(8), None, None)
        .unwrap();
    assert!(report.failures.is_empty());

    let group = report
        .clustering
        .clusters
        .iter()
        .find(|c| c.contains(&ia))
        .unwrap();
    assert!(group.contains(&ib));
    assert!(!group.contains(&ic));

    let ea = library.load_entity(&ia).unwrap();
    let eb = library.load_entity(&ib).unwrap();
    assert_eq!(ea.related_to(RELATION_SIMILAR), &[ib.clone()]);
    assert_eq!(eb.related_to(RELATION_SIMILAR), &[ia.clone()]);
    let strength = ea.relation_strength(RELATION_SIMILAR, &ib).unwrap();
    assert_eq!(eb.relation_strength(RELATION_SIMILAR, &ia), Some(strength));
    assert!(strength <= 8.0);
    assert!(library
        .load_entity(&ic)
        .unwrap()
        .related_to(RELATION_SIMILAR)
        .is_empty());

    // Fingerprints were stored, so find_similar needs no recomputation.
    let near = library
        .find_similar(&ia, PerceptualAlgorithm::Phash, Some(8))
        .unwrap();
    assert_eq!(near.len(), 1);
    assert_eq!(near[0].0, ib);

    // Running again changes nothing.
    let again = library
        .cluster_similar(&candidates, PerceptualAlgorithm::Phash, Some(8), None, None)
        .unwrap();
    assert_eq!(again.updated, 0);
}

#[test]
fn test_cluster_excludes_entities_without_media() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "sim", StoreConfig::default()).unwrap();
    let img = dir.path().join("img.png");
    write_texture(&img, 5, 0);
    let id = library.import_media(&img, &[]).unwrap().identity;
    library
        .save_entity(&tagstore::model::MediaEntity::new("nomedia"))
        .unwrap();

    let report = library
        .cluster_similar(
            &[id, "nomedia".into()],
            PerceptualAlgorithm::Dhash,
            None,
            None,
            None,
        )
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, Identity::from("nomedia"));
    assert_eq!(report.clustering.clusters.len(), 1);
}

#[test]
fn test_cluster_skips_deleted_entity_with_stored_fingerprint() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "sim", StoreConfig::default()).unwrap();
    let a = dir.path().join("a.png");
    let b = dir.path().join("b.png");
    write_texture(&a, 7, 0);
    write_texture(&b, 7, 4);
    let ia = library.import_media(&a, &[]).unwrap().identity;
    let ib = library.import_media(&b, &[]).unwrap().identity;
    library.compute_fingerprint(&ia, PerceptualAlgorithm::Phash, false).unwrap();
    library.compute_fingerprint(&ib, PerceptualAlgorithm::Phash, false).unwrap();
    library.soft_delete_entity(&ib).unwrap();

    let report = library
        .cluster_similar(
            &[ia.clone(), ib.clone()],
            PerceptualAlgorithm::Phash,
            Some(64),
            None,
            None,
        )
        .unwrap();

    assert_eq!(report.clustering.clusters, vec![vec![ia.clone()]]);
    assert!(report.clustering.edges.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, ib);
    assert_eq!(report.updated, 0);
    assert!(library
        .load_entity(&ia)
        .unwrap()
        .related_to(RELATION_SIMILAR)
        .is_empty());
}

#[test]
fn test_cancelled_library_cluster_writes_nothing() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "sim", StoreConfig::default()).unwrap();
    let a = dir.path().join("a.png");
    let b = dir.path().join("b.png");
    write_texture(&a, 3, 0);
    write_texture(&b, 3, 2);
    library.import_media(&a, &[]).unwrap();
    library.import_media(&b, &[]).unwrap();

    let candidates = library.list_identities().unwrap();
    let cancel = Arc::new(AtomicBool::new(true));
    let result = library.cluster_similar(
        &candidates,
        PerceptualAlgorithm::Phash,
        Some(64),
        None,
        Some(cancel),
    );
    assert!(matches!(result, Err(StoreError::Cancelled)));
    for id in candidates {
        assert!(library
            .load_entity(&id)
            .unwrap()
            .related_to(RELATION_SIMILAR)
            .is_empty());
    }
}
