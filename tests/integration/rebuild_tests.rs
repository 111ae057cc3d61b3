use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tagstore::config::StoreConfig;
use tagstore::events::LibraryEvent;
use tagstore::index::{IndexStore, Rebuilder};
use tagstore::model::{Identity, MediaEntity, MediaVariant};
use tagstore::progress::ProgressCallback;
use tagstore::similarity::{Fingerprint, PerceptualAlgorithm};
use tagstore::store::{FileStore, LibraryLayout};
use tagstore::{IndexState, Library, StoreError};
use tempfile::tempdir;

fn sample_entities() -> Vec<MediaEntity> {
    let mut a = MediaEntity::new("aaaa");
    a.name = "first".to_string();
    a.caption = "caption of a".to_string();
    a.add_tag("class", "lake");
    a.add_tag("name", "First");
    a.add_related("similar", "bbbb".into());
    a.set_relation_strength("similar", "bbbb".into(), 2.0);
    a.add_related("masks", "mmmm".into());
    a.metadata.insert("source".into(), serde_json::json!("camera"));
    a.extra.insert("rating".into(), serde_json::json!(4));

    let mut b = MediaEntity::new("bbbb");
    b.add_tag("class", "river");
    b.add_related("similar", "aaaa".into());
    b.add_related("similar", "dangling".into());

    let m = MediaEntity::with_variant(
        "mmmm",
        MediaVariant::Mask {
            source_image: "aaaa".into(),
            mask_category: "water".into(),
        },
    );
    vec![a, b, m]
}

#[derive(Default)]
struct Recorder {
    phases: Mutex<Vec<String>>,
    items: Mutex<usize>,
}

impl ProgressCallback for Recorder {
    fn on_phase_start(&self, phase: &str, _total: usize) {
        self.phases.lock().unwrap().push(phase.to_string());
    }
    fn on_progress(&self, _current: usize, _item: &str) {
        *self.items.lock().unwrap() += 1;
    }
    fn on_phase_end(&self, _phase: &str) {}
}

#[test]
fn test_rebuild_matches_files() {
    let dir = tempdir().unwrap();
    let files = FileStore::new(LibraryLayout::new(dir.path()));
    files.ensure_dirs().unwrap();
    let entities = sample_entities();
    for e in &entities {
        files.save(e).unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let (store, report) = Rebuilder::new(&files, dir.path().join("fresh.db"))
        .with_progress(recorder.clone())
        .run()
        .unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.indexed, 3);
    assert!(report.corrupt.is_empty());
    assert_eq!(*recorder.items.lock().unwrap(), 3);
    assert_eq!(recorder.phases.lock().unwrap().as_slice(), ["rebuild"]);

    for e in &entities {
        assert_eq!(store.load(&e.identity).unwrap().as_ref(), Some(e));
    }
    let incoming = store.incoming(&"aaaa".into()).unwrap();
    assert_eq!(incoming["similar"], vec![Identity::from("bbbb")]);
}

#[test]
fn test_rebuild_carries_fingerprints_of_surviving_entities() {
    let dir = tempdir().unwrap();
    let files = FileStore::new(LibraryLayout::new(dir.path()));
    files.ensure_dirs().unwrap();
    for e in sample_entities() {
        files.save(&e).unwrap();
    }

    let prior_path = dir.path().join("prior.db");
    let mut prior = IndexStore::create(&prior_path).unwrap();
    for e in sample_entities() {
        prior.upsert(&e).unwrap();
    }
    prior.upsert(&MediaEntity::new("gone")).unwrap();
    let fp = Fingerprint::from_bytes(vec![1, 2, 3, 4, 5, 6, 7, 8]);
    prior.put_fingerprint(&"aaaa".into(), PerceptualAlgorithm::Phash, &fp).unwrap();
    prior.put_fingerprint(&"gone".into(), PerceptualAlgorithm::Phash, &fp).unwrap();
    prior.close().unwrap();

    let (store, report) = Rebuilder::new(&files, dir.path().join("fresh.db"))
        .with_prior(&prior_path)
        .run()
        .unwrap();
    assert_eq!(report.fingerprints_carried, 1);
    assert_eq!(
        store
            .get_fingerprint(&"aaaa".into(), PerceptualAlgorithm::Phash)
            .unwrap()
            .map(|s| s.fingerprint),
        Some(fp)
    );
    assert!(store
        .get_fingerprint(&"gone".into(), PerceptualAlgorithm::Phash)
        .unwrap()
        .is_none());
}

#[test]
fn test_corrupt_record_skipped_during_library_rebuild() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "test", StoreConfig::default()).unwrap();
    for id in ["e1", "e2", "e3"] {
        let mut e = MediaEntity::new(id);
        e.add_tag("class", "lake");
        library.save_entity(&e).unwrap();
    }
    fs::write(dir.path().join("images/e4.json"), b"{\"tags\": [").unwrap();
    let events = library.subscribe();

    let report = library.rebuild_index(None, None).unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.corrupt.len(), 1);
    assert_eq!(report.corrupt[0].identity, Identity::from("e4"));
    assert_eq!(library.index_state(), IndexState::Ready);

    let lakes = library.query_by_tag_filter("class:lake").unwrap();
    assert_eq!(lakes.len(), 3);
    assert!(events
        .try_iter()
        .any(|e| e == LibraryEvent::IndexRebuilt { indexed: 3, corrupt: 1 }));
}

#[test]
fn test_cancelled_rebuild_keeps_prior_index() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "test", StoreConfig::default()).unwrap();
    let mut e = MediaEntity::new("kept");
    e.add_tag("class", "lake");
    library.save_entity(&e).unwrap();

    let cancel = Arc::new(AtomicBool::new(true));
    let result = library.rebuild_index(None, Some(cancel));
    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert!(!dir.path().join("library.db.rebuild").exists());
    assert_eq!(library.index_state(), IndexState::Ready);
    assert_eq!(
        library.query_by_tag_filter("class:lake").unwrap(),
        vec![Identity::from("kept")]
    );

    // A later rebuild still works.
    let report = library.rebuild_index(None, None).unwrap();
    assert_eq!(report.indexed, 1);
}

#[test]
fn test_rebuild_repairs_deleted_index() {
    let dir = tempdir().unwrap();
    {
        let library = Library::create(dir.path(), "test", StoreConfig::default()).unwrap();
        let mut e = MediaEntity::new("x1");
        e.add_tag("class", "lake");
        library.save_entity(&e).unwrap();
    }
    fs::remove_file(dir.path().join("library.db")).unwrap();

    let library = Library::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(library.index_state(), IndexState::Ready);
    assert!(dir.path().join("library.db").is_file());
    assert_eq!(
        library.query_by_tag_filter("class:lake").unwrap(),
        vec![Identity::from("x1")]
    );
}

/// Saves and deletes through the library while a rebuild is scanning.
struct WritesDuringScan {
    library: Arc<Library>,
    first: Mutex<Option<Identity>>,
}

impl ProgressCallback for WritesDuringScan {
    fn on_phase_start(&self, _phase: &str, _total: usize) {}

    fn on_progress(&self, current: usize, item: &str) {
        let mut first = self.first.lock().unwrap();
        match current {
            1 => *first = Some(Identity::from(item)),
            // The first record has been indexed by now.
            2 => {
                let indexed = first.clone().unwrap();
                self.library.soft_delete_entity(&indexed).unwrap();
                let mut late = MediaEntity::new("late");
                late.add_tag("class", "late");
                self.library.save_entity(&late).unwrap();
            }
            _ => {}
        }
    }

    fn on_phase_end(&self, _phase: &str) {}
}

#[test]
fn test_writes_during_rebuild_reach_new_index() {
    let dir = tempdir().unwrap();
    let library = Arc::new(Library::create(dir.path(), "test", StoreConfig::default()).unwrap());
    for id in ["r1", "r2", "r3"] {
        let mut e = MediaEntity::new(id);
        e.add_tag("class", "lake");
        library.save_entity(&e).unwrap();
    }

    let writer = Arc::new(WritesDuringScan {
        library: Arc::clone(&library),
        first: Mutex::new(None),
    });
    let report = library
        .rebuild_index(Some(writer.clone() as Arc<dyn ProgressCallback>), None)
        .unwrap();
    assert!(report.corrupt.is_empty());
    let deleted = writer.first.lock().unwrap().clone().unwrap();

    assert_eq!(library.index_state(), IndexState::Ready);
    assert_eq!(library.status().stale, 0);

    // Inspect the swapped-in index directly, bypassing the file fallback.
    let index = IndexStore::open(&dir.path().join("library.db")).unwrap();
    assert!(index.load(&deleted).unwrap().is_none());
    assert!(index.load(&"late".into()).unwrap().is_some());
    assert_eq!(index.count().unwrap(), 3);

    let lakes = library.query_by_tag_filter("class:lake").unwrap();
    assert_eq!(lakes.len(), 2);
    assert!(!lakes.contains(&deleted));
    assert_eq!(
        library.query_by_tag_filter("class:late").unwrap(),
        vec![Identity::from("late")]
    );
}
