use rusqlite::Connection;
use std::fs;
use std::path::Path;
use tagstore::config::StoreConfig;
use tagstore::events::LibraryEvent;
use tagstore::model::{Identity, MediaEntity, Tag};
use tagstore::{IndexState, Library, StoreError};
use tempfile::tempdir;

fn tagged(id: &str, tags: &[(&str, &str)]) -> MediaEntity {
    let mut e = MediaEntity::new(id);
    for (category, value) in tags {
        e.add_tag(*category, *value);
    }
    e
}

fn break_tags_table(root: &Path) {
    let conn = Connection::open(root.join("library.db")).unwrap();
    conn.execute_batch("DROP TABLE tags;").unwrap();
}

#[test]
fn test_index_failure_does_not_fail_save() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "dual", StoreConfig::default()).unwrap();
    library.save_entity(&tagged("e1", &[("class", "v1")])).unwrap();

    break_tags_table(dir.path());
    let events = library.subscribe();
    let v2 = tagged("e1", &[("class", "v2")]);
    let outcome = library.save_entity(&v2).unwrap();

    assert!(outcome.index_warning.is_some());
    assert_eq!(library.index_state(), IndexState::Stale);
    assert_eq!(library.status().stale, 1);
    assert_eq!(library.load_entity(&"e1".into()).unwrap(), v2);
    assert!(matches!(
        events.try_recv().unwrap(),
        LibraryEvent::IndexWriteFailed { identity, .. } if identity == Identity::from("e1")
    ));
    assert_eq!(
        events.try_recv().unwrap(),
        LibraryEvent::EntitySaved("e1".into())
    );

    // The canonical file holds the new version.
    let on_disk = fs::read_to_string(dir.path().join("images/e1.json")).unwrap();
    assert!(on_disk.contains("\"v2\""));
}

fn or_chain(terms: usize) -> String {
    (0..terms)
        .map(|i| format!("class:t{}", i))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[test]
fn test_long_disjunction_keeps_index_ready() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        index_failure_threshold: 1,
        ..StoreConfig::default()
    };
    let library = Library::create(dir.path(), "wide", config).unwrap();
    library.save_entity(&tagged("hit", &[("class", "t1199")])).unwrap();
    library.save_entity(&tagged("miss", &[("class", "other")])).unwrap();
    let events = library.subscribe();

    let expression = or_chain(1200);
    for _ in 0..3 {
        assert_eq!(
            library.query_by_tag_filter(&expression).unwrap(),
            vec![Identity::from("hit")]
        );
    }
    assert_eq!(library.index_state(), IndexState::Ready);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_oversized_filter_answered_from_files() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        index_failure_threshold: 1,
        ..StoreConfig::default()
    };
    let library = Library::create(dir.path(), "huge", config).unwrap();
    library.save_entity(&tagged("hit", &[("class", "t39999")])).unwrap();

    let found = library.query_by_tag_filter(&or_chain(40_000)).unwrap();
    assert_eq!(found, vec![Identity::from("hit")]);
    assert_eq!(library.index_state(), IndexState::Ready);
    assert_eq!(library.status().stale, 0);
}

#[test]
fn test_repeated_index_failures_offer_rebuild() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        index_failure_threshold: 2,
        ..StoreConfig::default()
    };
    let library = Library::create(dir.path(), "dual", config).unwrap();
    library.save_entity(&tagged("seed", &[])).unwrap();
    break_tags_table(dir.path());
    let events = library.subscribe();

    library.save_entity(&tagged("a", &[("class", "lake")])).unwrap();
    assert_eq!(library.index_state(), IndexState::Stale);
    library.save_entity(&tagged("b", &[("class", "lake")])).unwrap();
    assert_eq!(library.index_state(), IndexState::RebuildAvailable);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, LibraryEvent::IndexUnavailable(_))));

    let report = library.rebuild_index(None, None).unwrap();
    assert_eq!(report.indexed, 3);
    assert_eq!(library.index_state(), IndexState::Ready);
    assert_eq!(library.status().stale, 0);
    assert_eq!(
        library.query_by_tag_filter("class:lake").unwrap(),
        vec![Identity::from("a"), Identity::from("b")]
    );
}

#[test]
fn test_query_sees_stale_entities_through_files() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "dual", StoreConfig::default()).unwrap();
    library.save_entity(&tagged("old", &[("class", "lake")])).unwrap();
    break_tags_table(dir.path());
    library.save_entity(&tagged("new", &[("class", "lake")])).unwrap();

    let found = library.query_by_tag_filter("class:lake").unwrap();
    assert!(found.contains(&Identity::from("new")));
}

#[test]
fn test_soft_delete_scenario() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "del", StoreConfig::default()).unwrap();
    let mut e = tagged("victim", &[("class", "lake")]);
    e.caption = "to be removed".to_string();
    library.save_entity(&e).unwrap();
    fs::write(dir.path().join("images/victim.png"), b"media").unwrap();

    let events = library.subscribe();
    let moved = library.soft_delete_entity(&"victim".into()).unwrap();
    assert_eq!(moved.len(), 3);
    assert!(dir.path().join("deleted/victim.json").is_file());
    assert!(dir.path().join("deleted/victim.txt").is_file());
    assert!(dir.path().join("deleted/victim.png").is_file());

    assert!(matches!(
        library.load_entity(&"victim".into()),
        Err(StoreError::NotFound(_))
    ));
    assert!(library.query_by_tag_filter("class:lake").unwrap().is_empty());
    assert_eq!(
        events.try_recv().unwrap(),
        LibraryEvent::EntityDeleted("victim".into())
    );

    // A rebuild does not resurrect it.
    library.rebuild_index(None, None).unwrap();
    assert!(library.list_identities().unwrap().is_empty());
}

#[test]
fn test_import_media_is_content_addressed() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path().join("lib"), "imp", StoreConfig::default()).unwrap();
    let src = dir.path().join("Sunset.png");
    image::RgbImage::from_fn(8, 8, |x, y| image::Rgb([x as u8 * 30, y as u8 * 30, 0]))
        .save(&src)
        .unwrap();

    let first = library
        .import_media(&src, &[Tag::new("class", "sky")])
        .unwrap();
    assert_eq!(first.identity.as_str().len(), 16);
    assert_eq!(first.name, "Sunset");
    assert!(library
        .layout()
        .media_path(&first.identity, "png")
        .is_file());

    // Same pixels, same entity; tags accumulate without duplicates.
    let copy = dir.path().join("copy.png");
    fs::copy(&src, &copy).unwrap();
    let second = library
        .import_media(&copy, &[Tag::new("class", "sky"), Tag::new("time", "dusk")])
        .unwrap();
    assert_eq!(second.identity, first.identity);
    assert_eq!(second.name, "Sunset");
    assert_eq!(
        second.tags,
        vec![Tag::new("class", "sky"), Tag::new("time", "dusk")]
    );
    assert_eq!(library.list_identities().unwrap().len(), 1);
}

#[test]
fn test_incoming_relations() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "rel", StoreConfig::default()).unwrap();
    let image = tagged("img", &[]);
    let mut mask = tagged("msk", &[]);
    mask.add_related("mask_of", "img".into());
    library.save_entity(&image).unwrap();
    library.save_entity(&mask).unwrap();

    let incoming = library.incoming_relations(&"img".into()).unwrap();
    assert_eq!(incoming["mask_of"], vec![Identity::from("msk")]);
}

#[test]
fn test_concurrent_saves() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "conc", StoreConfig::default()).unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let library = &library;
            s.spawn(move || {
                let value = t.to_string();
                for i in 0..10 {
                    let e = tagged(&format!("t{}_{}", t, i), &[("thread", value.as_str())]);
                    library.save_entity(&e).unwrap();
                }
            });
        }
    });

    assert_eq!(library.list_identities().unwrap().len(), 40);
    assert_eq!(library.query_by_tag_filter("thread:2").unwrap().len(), 10);
    assert_eq!(library.index_state(), IndexState::Ready);
}

#[test]
fn test_search_falls_back_to_files_without_index() {
    let dir = tempdir().unwrap();
    {
        let library = Library::create(dir.path(), "s", StoreConfig::default()).unwrap();
        library.save_entity(&tagged("a", &[("class", "lake")])).unwrap();
        library.save_entity(&tagged("b", &[("class", "lake"), ("class", "river")])).unwrap();
    }
    fs::remove_file(dir.path().join("library.db")).unwrap();
    let config = StoreConfig {
        auto_rebuild: false,
        ..StoreConfig::default()
    };
    let library = Library::open(dir.path(), config).unwrap();
    assert_eq!(library.index_state(), IndexState::Unavailable);

    let found = library.search_tags("lake", 5).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].tag, Tag::new("class", "lake"));
    assert_eq!(found[0].count, 2);
    assert_eq!(
        library.query_by_tag_filter("class:river").unwrap(),
        vec![Identity::from("b")]
    );
}

#[test]
fn test_status_reports_counts() {
    let dir = tempdir().unwrap();
    let library = Library::create(dir.path(), "Holiday", StoreConfig::default()).unwrap();
    library.save_entity(&tagged("a", &[])).unwrap();
    let status = library.status();
    assert_eq!(status.library_name, "Holiday");
    assert_eq!(status.records, 1);
    assert_eq!(status.indexed, Some(1));
    assert_eq!(status.index_state, IndexState::Ready);
}
