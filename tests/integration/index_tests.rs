use rusqlite::Connection;
use tagstore::index::{IndexError, IndexStore, TagFilter, SCHEMA_VERSION};
use tagstore::model::{Identity, MediaEntity, Tag};
use tagstore::similarity::{Fingerprint, PerceptualAlgorithm};
use tempfile::tempdir;

fn entity(id: &str, tags: &[(&str, &str)]) -> MediaEntity {
    let mut e = MediaEntity::new(id);
    for (category, value) in tags {
        e.add_tag(*category, *value);
    }
    e
}

fn scenario_entities() -> Vec<MediaEntity> {
    vec![
        entity("e1", &[("class", "lake"), ("name", "Blue Lake")]),
        entity("e2", &[("class", "river")]),
        entity("e3", &[("class", "lake"), ("meta", "deleted")]),
        entity("e4", &[("name", "Lakeside")]),
        entity("e5", &[]),
    ]
}

fn ids(list: &[&str]) -> Vec<Identity> {
    list.iter().map(|s| Identity::from(*s)).collect()
}

#[test]
fn test_tag_filter_scenario() {
    let dir = tempdir().unwrap();
    let mut store = IndexStore::create(&dir.path().join("library.db")).unwrap();
    for e in scenario_entities() {
        store.upsert(&e).unwrap();
    }

    let cases: &[(&str, &[&str])] = &[
        ("class:lake", &["e1", "e3"]),
        ("CLASS:LAKE", &["e1", "e3"]),
        ("class:lake AND NOT meta:deleted", &["e1"]),
        ("class:lake OR class:river", &["e1", "e2", "e3"]),
        ("class:river OR class:lake AND meta:deleted", &["e2", "e3"]),
        ("(class:river OR class:lake) AND NOT meta:deleted", &["e1", "e2"]),
        ("name:*lake*", &["e1", "e4"]),
        ("\"name:blue lake\"", &["e1"]),
        ("NOT class:*", &["e4", "e5"]),
        ("", &["e1", "e2", "e3", "e4", "e5"]),
        ("class:ocean", &[]),
    ];
    for (expression, expected) in cases {
        let filter = TagFilter::parse(expression).unwrap();
        assert_eq!(
            store.query(&filter).unwrap(),
            ids(expected),
            "expression {:?}",
            expression
        );
    }
}

#[test]
fn test_index_query_agrees_with_reference_evaluator() {
    let dir = tempdir().unwrap();
    let mut store = IndexStore::create(&dir.path().join("library.db")).unwrap();
    let entities = scenario_entities();
    for e in &entities {
        store.upsert(e).unwrap();
    }

    for expression in [
        "class:l*",
        "*:*e*",
        "NOT (name:* OR meta:*)",
        "class:lake AND class:lake",
        "meta:deleted OR NOT class:lake",
    ] {
        let filter = TagFilter::parse(expression).unwrap();
        let expected: Vec<Identity> = entities
            .iter()
            .filter(|e| filter.matches(&e.tags))
            .map(|e| e.identity.clone())
            .collect();
        assert_eq!(store.query(&filter).unwrap(), expected, "{}", expression);
    }
}

#[test]
fn test_upsert_replaces_tags_and_relations() {
    let dir = tempdir().unwrap();
    let mut store = IndexStore::create(&dir.path().join("library.db")).unwrap();
    let mut e = entity("a", &[("class", "lake")]);
    e.add_related("similar", "b".into());
    e.set_relation_strength("similar", "b".into(), 3.0);
    store.upsert(&e).unwrap();

    e.tags = vec![Tag::new("class", "river")];
    e.remove_related("similar", &"b".into());
    e.add_related("masks", "m".into());
    store.upsert(&e).unwrap();

    let loaded = store.load(&"a".into()).unwrap().unwrap();
    assert_eq!(loaded, e);
    let lake = TagFilter::parse("class:lake").unwrap();
    assert!(store.query(&lake).unwrap().is_empty());
    assert!(store.incoming(&"b".into()).unwrap().is_empty());
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn test_search_tags_counts_usage() {
    let dir = tempdir().unwrap();
    let mut store = IndexStore::create(&dir.path().join("library.db")).unwrap();
    for e in scenario_entities() {
        store.upsert(&e).unwrap();
    }

    let found = store.search_tags("lake", 10).unwrap();
    assert_eq!(found[0].tag, Tag::new("class", "lake"));
    assert_eq!(found[0].count, 2);
    assert!(found.iter().all(|hit| hit.tag.full().to_lowercase().contains("lake")));

    let top = store.search_tags("", 1).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].tag, Tag::new("class", "lake"));
}

#[test]
fn test_outdated_schema_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("library.db");
    IndexStore::create(&path).unwrap().close().unwrap();

    let conn = Connection::open(&path).unwrap();
    conn.execute(
        "UPDATE schema_info SET value = '0' WHERE key = 'schema_version'",
        [],
    )
    .unwrap();
    drop(conn);

    match IndexStore::open(&path) {
        Err(IndexError::VersionMismatch { found, expected }) => {
            assert_eq!(found.as_deref(), Some("0"));
            assert_eq!(expected, SCHEMA_VERSION);
        }
        other => panic!("expected version mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_fingerprints_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("library.db");
    let mut store = IndexStore::create(&path).unwrap();
    store.upsert(&entity("a", &[])).unwrap();
    store.upsert(&entity("b", &[])).unwrap();
    let fa = Fingerprint::from_bytes(vec![0b0000_0000, 0xff]);
    let fb = Fingerprint::from_bytes(vec![0b0000_0011, 0xff]);
    store.put_fingerprint(&"a".into(), PerceptualAlgorithm::Phash, &fa).unwrap();
    store.put_fingerprint(&"b".into(), PerceptualAlgorithm::Phash, &fb).unwrap();
    store.close().unwrap();

    let store = IndexStore::open(&path).unwrap();
    let stored = store
        .get_fingerprint(&"a".into(), PerceptualAlgorithm::Phash)
        .unwrap()
        .unwrap();
    assert_eq!(stored.fingerprint, fa);
    assert!(store
        .get_fingerprint(&"a".into(), PerceptualAlgorithm::Dhash)
        .unwrap()
        .is_none());
    assert_eq!(
        store
            .find_similar(&"a".into(), PerceptualAlgorithm::Phash, 2)
            .unwrap(),
        Some(vec![(Identity::from("b"), 2)])
    );
    assert_eq!(
        store
            .find_similar(&"a".into(), PerceptualAlgorithm::Phash, 1)
            .unwrap(),
        Some(vec![])
    );
}
