//! # Index Lookup Integration Tests
//!
//! Point operations against a live database: put/get/remove round trips,
//! tombstone precedence over older physical entries, the two remove paths
//! and unique-key enforcement.

use stratadb::error::is_duplicate_key;
use stratadb::{Database, KeyType, Rid, Value};
use tempfile::TempDir;

fn create_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

fn rids(db: &Database, index: &stratadb::Index, keys: &[Value]) -> Vec<Rid> {
    db.get(index, keys, 0).unwrap().into_iter().collect()
}

#[test]
fn unique_index_scenario() {
    let (_dir, db) = create_db();
    let index = db.create_index("users_name", &[KeyType::Text], true, 0).unwrap();

    db.put(&index, &[Value::from("alice")], Rid::new(3, 10)).unwrap();

    let err = db
        .put(&index, &[Value::from("alice")], Rid::new(3, 99))
        .unwrap_err();
    assert!(is_duplicate_key(&err), "expected DuplicateKey, got {err:?}");

    assert_eq!(
        rids(&db, &index, &[Value::from("alice")]),
        vec![Rid::new(3, 10)]
    );

    db.remove(&index, &[Value::from("alice")], Some(Rid::new(3, 10)))
        .unwrap();
    assert!(rids(&db, &index, &[Value::from("alice")]).is_empty());

    // The key is free again after the remove.
    db.put(&index, &[Value::from("alice")], Rid::new(3, 99)).unwrap();
    assert_eq!(
        rids(&db, &index, &[Value::from("alice")]),
        vec![Rid::new(3, 99)]
    );
}

#[test]
fn reinserting_the_same_rid_into_a_unique_index_is_idempotent() {
    let (_dir, db) = create_db();
    let index = db.create_index("u", &[KeyType::Int], true, 0).unwrap();

    db.put(&index, &[Value::Int(1)], Rid::new(0, 5)).unwrap();
    db.put(&index, &[Value::Int(1)], Rid::new(0, 5)).unwrap();
    assert_eq!(rids(&db, &index, &[Value::Int(1)]), vec![Rid::new(0, 5)]);
}

#[test]
fn non_unique_index_accumulates_values() {
    let (_dir, db) = create_db();
    let index = db.create_index("tags", &[KeyType::Text], false, 0).unwrap();

    for position in 0..5 {
        db.put(&index, &[Value::from("red")], Rid::new(1, position)).unwrap();
    }

    let got = rids(&db, &index, &[Value::from("red")]);
    assert_eq!(got.len(), 5);
    for position in 0..5 {
        assert!(got.contains(&Rid::new(1, position)));
    }
}

#[test]
fn remove_one_rid_leaves_the_others() {
    let (_dir, db) = create_db();
    let index = db.create_index("tags", &[KeyType::Text], false, 0).unwrap();

    db.put(&index, &[Value::from("blue")], Rid::new(1, 1)).unwrap();
    db.put(&index, &[Value::from("blue")], Rid::new(1, 2)).unwrap();
    db.remove(&index, &[Value::from("blue")], Some(Rid::new(1, 1)))
        .unwrap();

    assert_eq!(rids(&db, &index, &[Value::from("blue")]), vec![Rid::new(1, 2)]);
}

#[test]
fn remove_all_clears_the_key() {
    let (_dir, db) = create_db();
    let index = db.create_index("tags", &[KeyType::Text], false, 0).unwrap();

    for position in 0..3 {
        db.put(&index, &[Value::from("green")], Rid::new(1, position))
            .unwrap();
    }
    db.remove(&index, &[Value::from("green")], None).unwrap();
    assert!(rids(&db, &index, &[Value::from("green")]).is_empty());

    // A later put starts the key fresh.
    db.put(&index, &[Value::from("green")], Rid::new(2, 0)).unwrap();
    assert_eq!(rids(&db, &index, &[Value::from("green")]), vec![Rid::new(2, 0)]);
}

#[test]
fn tombstone_wins_over_older_entries_in_older_pages() {
    let (_dir, db) = create_db();
    let index = db.create_index("nums", &[KeyType::Int], false, 0).unwrap();

    // The probe lands in the first page, then thousands of fillers push the
    // tier across several pages before the delete is appended.
    db.put(&index, &[Value::Int(-1)], Rid::new(7, 7)).unwrap();
    let mut tx = db.begin().unwrap();
    for v in 0..6000i64 {
        tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
    }
    db.commit(&mut tx).unwrap();

    db.remove(&index, &[Value::Int(-1)], Some(Rid::new(7, 7))).unwrap();
    assert!(rids(&db, &index, &[Value::Int(-1)]).is_empty());

    // Unrelated keys are untouched.
    assert_eq!(rids(&db, &index, &[Value::Int(0)]), vec![Rid::new(0, 0)]);
    assert_eq!(rids(&db, &index, &[Value::Int(5999)]), vec![Rid::new(0, 5999)]);
}

#[test]
fn get_limit_caps_the_result_set() {
    let (_dir, db) = create_db();
    let index = db.create_index("tags", &[KeyType::Int], false, 0).unwrap();

    for position in 0..10 {
        db.put(&index, &[Value::Int(1)], Rid::new(0, position)).unwrap();
    }
    assert_eq!(db.get(&index, &[Value::Int(1)], 3).unwrap().len(), 3);
    assert_eq!(db.get(&index, &[Value::Int(1)], 0).unwrap().len(), 10);
}

#[test]
fn composite_keys_are_matched_column_wise() {
    let (_dir, db) = create_db();
    let index = db
        .create_index("pairs", &[KeyType::Int, KeyType::Text], false, 1)
        .unwrap();

    db.put(&index, &[Value::Int(1), Value::from("a")], Rid::new(0, 1))
        .unwrap();
    db.put(&index, &[Value::Int(1), Value::from("b")], Rid::new(0, 2))
        .unwrap();
    db.put(&index, &[Value::Int(2), Value::from("a")], Rid::new(0, 3))
        .unwrap();

    assert_eq!(
        rids(&db, &index, &[Value::Int(1), Value::from("a")]),
        vec![Rid::new(0, 1)]
    );
    assert_eq!(
        rids(&db, &index, &[Value::Int(1), Value::from("b")]),
        vec![Rid::new(0, 2)]
    );
    assert!(rids(&db, &index, &[Value::Int(2), Value::from("b")]).is_empty());
}

#[test]
fn null_is_a_valid_key_column() {
    let (_dir, db) = create_db();
    let index = db.create_index("maybe", &[KeyType::Text], false, 0).unwrap();

    db.put(&index, &[Value::Null], Rid::new(0, 1)).unwrap();
    db.put(&index, &[Value::from("x")], Rid::new(0, 2)).unwrap();

    assert_eq!(rids(&db, &index, &[Value::Null]), vec![Rid::new(0, 1)]);
    assert_eq!(rids(&db, &index, &[Value::from("x")]), vec![Rid::new(0, 2)]);
}

#[test]
fn mismatched_keys_are_rejected() {
    let (_dir, db) = create_db();
    let index = db
        .create_index("pairs", &[KeyType::Int, KeyType::Text], false, 0)
        .unwrap();

    // Wrong arity.
    assert!(db.get(&index, &[Value::Int(1)], 0).is_err());
    // Wrong column type.
    assert!(db
        .put(
            &index,
            &[Value::from("one"), Value::from("a")],
            Rid::new(0, 1)
        )
        .is_err());
}
