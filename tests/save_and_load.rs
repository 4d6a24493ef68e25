use std::collections::BTreeMap;
use std::sync::Arc;

use ossature::bones::{Configure, FileBone, NumericBone, StringBone};
use ossature::datatype::{Key, Value};
use ossature::engine::{Database, DELAYED_UPDATE_TAG, TAGS_PROPERTY};
use ossature::locks::BlobLock;
use ossature::persist::{FilterOp, PersistenceMode, Query, SortOrder, Store};
use ossature::registry::SkeletonRegistry;
use ossature::skeleton::{SkeletonBuilder, SkeletonDefinition};
use ossature::OssatureError;

fn database() -> Database {
    Database::new(PersistenceMode::InMemory)
        .unwrap()
        .with_registry(Arc::new(SkeletonRegistry::new()))
}

fn book() -> Arc<SkeletonDefinition> {
    SkeletonBuilder::new("book")
        .bone("title", StringBone::new("Title").required().searchable())
        .bone("pages", NumericBone::new("Pages"))
        .bone("blurb", StringBone::new("Blurb").languages(&["de", "en"]))
        .build()
        .unwrap()
}

fn save_book(db: &Database, title: &str, pages: i64) -> Key {
    let mut skel = book().instance();
    skel.set_value("title", title).unwrap();
    skel.set_value("pages", Value::Int(pages)).unwrap();
    db.save(&mut skel, false).unwrap()
}

#[test]
fn saved_values_load_back() {
    let db = database();
    let definition = book();
    let mut skel = definition.instance();
    skel.set_value("title", "Dune").unwrap();
    skel.set_value("pages", Value::Int(412)).unwrap();
    let key = db.save(&mut skel, false).unwrap();
    assert_eq!(skel.key(), Some(&key));
    assert_eq!(skel.value("id"), Some(&Value::Text(key.encode())));

    let mut loaded = definition.instance();
    assert!(db.load(&mut loaded, &key).unwrap());
    assert_eq!(loaded.value("title"), Some(&Value::from("Dune")));
    assert_eq!(loaded.value("pages").and_then(Value::as_int), Some(412));
    assert_eq!(loaded.key(), Some(&key));
}

#[test]
fn load_refuses_foreign_and_missing_keys() {
    let db = database();
    let key = save_book(&db, "Emma", 300);
    let mut skel = book().instance();
    assert!(!db.load(&mut skel, &Key::with_id("magazine", 1)).unwrap());
    assert!(!db.load(&mut skel, &Key::with_id("book", 999_999)).unwrap());
    assert_eq!(skel.value("title"), Some(&Value::from("")));
    assert!(skel.key().is_none());
    assert!(db.load(&mut skel, &key).unwrap());
}

#[test]
fn load_accepts_encoded_keys_and_bare_ids() {
    let db = database();
    let key = save_book(&db, "Ulysses", 730);
    let mut by_encoded = book().instance();
    assert!(db.load_encoded(&mut by_encoded, &key.encode()).unwrap());
    let id = match key.id() {
        ossature::datatype::KeyId::Id(id) => *id,
        other => panic!("expected a numeric id, got {:?}", other),
    };
    let mut by_id = book().instance();
    assert!(db.load_encoded(&mut by_id, &id.to_string()).unwrap());
    assert_eq!(by_id.value("title"), Some(&Value::from("Ulysses")));
    assert!(!db.load_encoded(&mut book().instance(), "").unwrap());
    assert!(!db.load_encoded(&mut book().instance(), "no-such-name").unwrap());
}

#[test]
fn saving_again_updates_in_place() {
    let db = database();
    let definition = book();
    let key = save_book(&db, "Draft", 10);
    let mut skel = definition.instance();
    db.load(&mut skel, &key).unwrap();
    skel.set_value("title", "Final").unwrap();
    let again = db.save(&mut skel, false).unwrap();
    assert_eq!(again, key);
    let batch = db.store().run_query(&Query::new("book"), 10, None).unwrap();
    assert_eq!(batch.entities.len(), 1);
    assert_eq!(batch.entities[0].get("title"), Some(&Value::from("Final")));
}

#[test]
fn subset_save_keeps_other_stored_values() {
    let db = database();
    let definition = SkeletonBuilder::new("book")
        .bone("title", StringBone::new("Title"))
        .bone("pages", NumericBone::new("Pages"))
        .sub_skel("titles", &["title"])
        .build()
        .unwrap();
    let mut full = definition.instance();
    full.set_value("title", "Old").unwrap();
    full.set_value("pages", Value::Int(99)).unwrap();
    let key = db.save(&mut full, false).unwrap();

    let mut partial = definition.sub_skel(&["titles"]).unwrap();
    db.load(&mut partial, &key).unwrap();
    partial.set_value("title", "New").unwrap();
    db.save(&mut partial, false).unwrap();

    let entity = db.store().get(&key).unwrap().unwrap();
    assert_eq!(entity.get("title"), Some(&Value::from("New")));
    assert_eq!(entity.get("pages").and_then(Value::as_int), Some(99));
}

#[test]
fn dirty_tag_marks_changes_unless_suppressed() {
    let db = database();
    let mut skel = book().instance();
    skel.set_value("title", "Tagged").unwrap();
    let key = db.save(&mut skel, false).unwrap();
    let tag = db
        .store()
        .get(&key)
        .unwrap()
        .unwrap()
        .get(DELAYED_UPDATE_TAG)
        .and_then(Value::as_int)
        .unwrap();
    assert!(tag > 0);

    db.save(&mut skel, true).unwrap();
    let entity = db.store().get(&key).unwrap().unwrap();
    assert_eq!(entity.get(DELAYED_UPDATE_TAG), Some(&Value::Int(0)));
}

#[test]
fn searchable_bones_produce_tags() {
    let db = database();
    let key = save_book(&db, "The Hobbit", 310);
    let entity = db.store().get(&key).unwrap().unwrap();
    let tags = entity.get(TAGS_PROPERTY).and_then(Value::as_list).unwrap();
    assert!(tags.contains(&Value::from("hobbit")));
    assert!(tags.contains(&Value::from("the")));
    // pages is not searchable
    assert!(!tags.contains(&Value::from("310")));
}

#[test]
fn magic_dates_are_stamped() {
    let db = database();
    let definition = book();
    let key = save_book(&db, "Dated", 1);
    let mut skel = definition.instance();
    db.load(&mut skel, &key).unwrap();
    let created = skel.value("creationdate").and_then(Value::as_datetime).copied().unwrap();
    let changed = skel.value("changedate").and_then(Value::as_datetime).copied().unwrap();
    assert!(changed >= created);

    db.save(&mut skel, false).unwrap();
    let mut again = definition.instance();
    db.load(&mut again, &key).unwrap();
    assert_eq!(again.value("creationdate").and_then(Value::as_datetime), Some(&created));
    assert!(*again.value("changedate").and_then(Value::as_datetime).unwrap() >= changed);
}

#[test]
fn suppressed_resave_is_idempotent() {
    let db = database();
    let definition = SkeletonBuilder::new("scan")
        .bone("title", StringBone::new("Title"))
        .bone("pages", FileBone::new("Pages").multiple())
        .build()
        .unwrap();
    let mut skel = definition.instance();
    skel.set_value("title", "Letter").unwrap();
    skel.set_value("pages", Value::List(vec!["blob/1".into(), "blob/2".into()]))
        .unwrap();
    let key = db.save(&mut skel, true).unwrap();
    let first = db.store().get(&key).unwrap().unwrap();
    let first_lock = BlobLock::load(db.store(), &key).unwrap().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    db.save(&mut skel, true).unwrap();
    let second = db.store().get(&key).unwrap().unwrap();
    let second_lock = BlobLock::load(db.store(), &key).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first_lock.old, second_lock.old);
    assert!(second_lock.old.is_empty());

    // an unsuppressed save still records the change
    std::thread::sleep(std::time::Duration::from_millis(5));
    db.save(&mut skel, false).unwrap();
    let third = db.store().get(&key).unwrap().unwrap();
    assert_ne!(first.get("changedate"), third.get("changedate"));
}

#[test]
fn language_values_are_stored_per_language() {
    let db = database();
    let mut skel = book().instance();
    skel.set_value("title", "Faust").unwrap();
    let mut blurb = BTreeMap::new();
    blurb.insert("de".to_string(), Value::from("Eine Tragödie"));
    blurb.insert("en".to_string(), Value::from("A tragedy"));
    skel.set_value("blurb", Value::Map(blurb.clone())).unwrap();
    let key = db.save(&mut skel, false).unwrap();

    let entity = db.store().get(&key).unwrap().unwrap();
    assert_eq!(entity.get("blurb.de"), Some(&Value::from("Eine Tragödie")));
    assert_eq!(entity.get("blurb.en"), Some(&Value::from("A tragedy")));

    let mut loaded = book().instance();
    db.load(&mut loaded, &key).unwrap();
    assert_eq!(loaded.value("blurb"), Some(&Value::Map(blurb)));
}

#[test]
fn list_pages_with_cursor() {
    let db = database();
    for (i, title) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        save_book(&db, title, i as i64);
    }
    let definition = book();
    let query = Query::new("book").order("pages", SortOrder::Ascending);
    let first = db.list(&definition, &query, 2, None).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].value("title"), Some(&Value::from("a")));
    let cursor = first.cursor().cloned().unwrap();

    let second = db.list(&definition, &query, 2, Some(&cursor)).unwrap();
    let titles: Vec<&Value> = second.iter().filter_map(|s| s.value("title")).collect();
    assert_eq!(titles, vec![&Value::from("c"), &Value::from("d")]);

    let last = db
        .list(&definition, &query, 2, second.cursor())
        .unwrap();
    assert_eq!(last.len(), 1);
    assert!(last.cursor().is_none());
}

#[test]
fn list_filters_and_checks_kind() {
    let db = database();
    save_book(&db, "short", 50);
    save_book(&db, "long", 900);
    let definition = book();
    let query = Query::new("book").filter("pages", FilterOp::Gt, Value::Int(100));
    let list = db.list(&definition, &query, 10, None).unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].value("title"), Some(&Value::from("long")));
    assert!(list[0].key().is_some());

    assert!(matches!(
        db.list(&definition, &Query::new("magazine"), 10, None),
        Err(OssatureError::KindMismatch { .. })
    ));
}
