use std::collections::BTreeSet;
use std::sync::Arc;

use ossature::bones::{Configure, FileBone, StringBone};
use ossature::datatype::{Key, Value};
use ossature::engine::Database;
use ossature::locks::{BlobLock, BLOB_LOCKS_KIND};
use ossature::persist::{FilterOp, PersistenceMode, Query, Store};
use ossature::registry::SkeletonRegistry;
use ossature::skeleton::{SkeletonBuilder, SkeletonDefinition};

fn database() -> Database {
    Database::new(PersistenceMode::InMemory)
        .unwrap()
        .with_registry(Arc::new(SkeletonRegistry::new()))
}

fn gallery() -> Arc<SkeletonDefinition> {
    SkeletonBuilder::new("gallery")
        .bone("title", StringBone::new("Title"))
        .bone("images", FileBone::new("Images").multiple())
        .bone("cover", FileBone::new("Cover"))
        .build()
        .unwrap()
}

fn blobs(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn images(items: &[&str]) -> Value {
    Value::List(items.iter().map(|s| Value::from(*s)).collect())
}

fn lock_of(db: &Database, key: &Key) -> BlobLock {
    BlobLock::load(db.store(), key).unwrap().expect("blob lock")
}

#[test]
fn save_records_referenced_blobs() {
    let db = database();
    let mut skel = gallery().instance();
    skel.set_value("images", images(&["img/1", "img/2"])).unwrap();
    skel.set_value("cover", "img/cover").unwrap();
    let key = db.save(&mut skel, false).unwrap();

    let lock = lock_of(&db, &key);
    assert_eq!(lock.active, blobs(&["img/1", "img/2", "img/cover"]));
    assert!(lock.old.is_empty());
    assert!(!lock.is_stale);
}

#[test]
fn dropped_blobs_become_old() {
    let db = database();
    let definition = gallery();
    let mut skel = definition.instance();
    skel.set_value("images", images(&["img/1", "img/2"])).unwrap();
    let key = db.save(&mut skel, false).unwrap();

    skel.set_value("images", images(&["img/2", "img/3"])).unwrap();
    db.save(&mut skel, false).unwrap();
    let lock = lock_of(&db, &key);
    assert_eq!(lock.active, blobs(&["img/2", "img/3"]));
    assert_eq!(lock.old, blobs(&["img/1"]));

    // referencing an old blob again takes it off the old list
    skel.set_value("images", images(&["img/1", "img/2", "img/3"])).unwrap();
    db.save(&mut skel, false).unwrap();
    assert!(lock_of(&db, &key).old.is_empty());
}

#[test]
fn locks_with_old_references_can_be_queried() {
    let db = database();
    let mut skel = gallery().instance();
    skel.set_value("cover", "img/a").unwrap();
    let key = db.save(&mut skel, false).unwrap();
    skel.set_value("cover", "img/b").unwrap();
    db.save(&mut skel, false).unwrap();

    let query = Query::new(BLOB_LOCKS_KIND).filter("has_old_blob_references", FilterOp::Eq, true);
    let batch = db.store().run_query(&query, 10, None).unwrap();
    assert_eq!(batch.entities.len(), 1);
    assert_eq!(batch.entities[0].key(), Some(&BlobLock::key_for(&key)));
}

#[test]
fn hook_may_adjust_blob_set() {
    let db = database();
    let definition = SkeletonBuilder::new("gallery")
        .bone("images", FileBone::new("Images").multiple())
        .pre_process_blob_locks(|_skel, mut blobs| {
            blobs.retain(|b| !b.starts_with("tmp/"));
            blobs.insert("img/watermark".to_string());
            blobs
        })
        .build()
        .unwrap();
    let mut skel = definition.instance();
    skel.set_value("images", images(&["img/1", "tmp/upload"])).unwrap();
    let key = db.save(&mut skel, false).unwrap();
    assert_eq!(lock_of(&db, &key).active, blobs(&["img/1", "img/watermark"]));
}

#[test]
fn delete_marks_lock_stale() {
    let db = database();
    let mut skel = gallery().instance();
    skel.set_value("cover", "img/keep").unwrap();
    let key = db.save(&mut skel, false).unwrap();
    db.delete(&mut skel).unwrap();

    let lock = lock_of(&db, &key);
    assert!(lock.is_stale);
    assert!(lock.active.is_empty());
    assert_eq!(lock.old, blobs(&["img/keep"]));
    let stale = Query::new(BLOB_LOCKS_KIND).filter("is_stale", FilterOp::Eq, true);
    assert_eq!(db.store().run_query(&stale, 10, None).unwrap().entities.len(), 1);
}

#[test]
fn delete_without_blobs_removes_lock() {
    let db = database();
    let mut skel = gallery().instance();
    skel.set_value("title", "empty").unwrap();
    let key = db.save(&mut skel, false).unwrap();
    assert!(BlobLock::load(db.store(), &key).unwrap().is_some());
    db.delete(&mut skel).unwrap();
    assert!(BlobLock::load(db.store(), &key).unwrap().is_none());
}
