//! # Compaction Integration Tests
//!
//! Compaction must change physical layout only: every lookup and scan
//! returns identical results before and after, tombstones disappear for
//! good, and the background compactor keeps a growing index bounded.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use stratadb::{Database, KeyType, Rid, Value};
use tempfile::TempDir;

fn create_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    (dir, db)
}

fn fill(db: &Database, index: &stratadb::Index, range: std::ops::Range<i64>) {
    let mut tx = db.begin().unwrap();
    for v in range {
        tx.put(index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
    }
    db.commit(&mut tx).unwrap();
}

#[test]
fn compaction_is_transparent_to_lookups() {
    let (_dir, db) = create_db();
    let index = db.create_index("nums", &[KeyType::Int], false, 0).unwrap();

    fill(&db, &index, 0..8000);
    let mut tx = db.begin().unwrap();
    for v in (0..8000i64).step_by(7) {
        tx.remove(&index, &[Value::Int(v)], None).unwrap();
    }
    for v in (0..8000i64).step_by(11) {
        tx.put(&index, &[Value::Int(v)], Rid::new(1, v)).unwrap();
    }
    db.commit(&mut tx).unwrap();

    let before: Vec<BTreeSet<Rid>> = (0..8000)
        .map(|v| db.get(&index, &[Value::Int(v)], 0).unwrap())
        .collect();

    assert!(db.compact("nums").unwrap());

    for (v, expected) in before.iter().enumerate() {
        let after = db.get(&index, &[Value::Int(v as i64)], 0).unwrap();
        assert_eq!(&after, expected, "lookup diverged for key {v}");
    }
}

#[test]
fn compaction_is_transparent_to_scans() {
    let (_dir, db) = create_db();
    let index = db.create_index("nums", &[KeyType::Int], false, 0).unwrap();

    fill(&db, &index, 0..6000);
    let mut tx = db.begin().unwrap();
    for v in (0..6000i64).step_by(5) {
        tx.remove(&index, &[Value::Int(v)], None).unwrap();
    }
    db.commit(&mut tx).unwrap();

    let mut before = Vec::new();
    let mut cursor = db.iterator(&index, true).unwrap();
    while let Some(entry) = cursor.next_entry().unwrap() {
        before.push(entry);
    }
    drop(cursor);

    assert!(db.compact("nums").unwrap());

    let mut after = Vec::new();
    let mut cursor = db.iterator(&index, true).unwrap();
    while let Some(entry) = cursor.next_entry().unwrap() {
        after.push(entry);
    }
    assert_eq!(before, after);
}

#[test]
fn hundred_thousand_sorted_keys_compact_and_scan() {
    let (_dir, db) = create_db();
    let index = db.create_index("big", &[KeyType::Int], false, 0).unwrap();

    for chunk_start in (0..100_000i64).step_by(10_000) {
        fill(&db, &index, chunk_start..chunk_start + 10_000);
    }

    assert!(db.compact("big").unwrap());

    let mut cursor = db
        .range(&index, &[Value::Int(0)], &[Value::Int(99_999)])
        .unwrap();
    let mut count = 0u64;
    let mut previous = i64::MIN;
    while let Some((keys, rid)) = cursor.next_entry().unwrap() {
        let Value::Int(v) = keys[0] else { panic!("non-int key") };
        assert!(v > previous, "keys regressed: {previous} then {v}");
        assert_eq!(rid, Rid::new(0, v));
        previous = v;
        count += 1;
    }
    assert_eq!(count, 100_000);
}

#[test]
fn nothing_to_compact_returns_false() {
    let (_dir, db) = create_db();
    let index = db.create_index("small", &[KeyType::Int], false, 0).unwrap();

    assert!(!db.compact("small").unwrap());
    db.put(&index, &[Value::Int(1)], Rid::new(0, 1)).unwrap();
    assert!(!db.compact("small").unwrap());
    assert_eq!(db.get(&index, &[Value::Int(1)], 0).unwrap().len(), 1);
}

#[test]
fn unknown_index_is_an_error() {
    let (_dir, db) = create_db();
    assert!(db.compact("missing").is_err());
}

#[test]
fn repeated_compaction_folds_the_previous_tier() {
    let (_dir, db) = create_db();
    let index = db.create_index("nums", &[KeyType::Int], false, 0).unwrap();

    fill(&db, &index, 0..6000);
    assert!(db.compact("nums").unwrap());
    // Immediately after a compaction the mutable tier is empty.
    assert!(!db.compact("nums").unwrap());

    fill(&db, &index, 6000..12000);
    let mut tx = db.begin().unwrap();
    tx.remove(&index, &[Value::Int(5)], None).unwrap();
    db.commit(&mut tx).unwrap();
    assert!(db.compact("nums").unwrap());

    assert!(db.get(&index, &[Value::Int(5)], 0).unwrap().is_empty());
    for v in [0i64, 5999, 6000, 11999] {
        assert_eq!(
            db.get(&index, &[Value::Int(v)], 0).unwrap().len(),
            1,
            "key {v} lost"
        );
    }
}

#[test]
fn deleted_keys_stay_deleted_after_compaction() {
    let (_dir, db) = create_db();
    let index = db.create_index("nums", &[KeyType::Int], false, 0).unwrap();

    fill(&db, &index, 0..6000);
    db.remove(&index, &[Value::Int(42)], None).unwrap();
    assert!(db.compact("nums").unwrap());

    assert!(db.get(&index, &[Value::Int(42)], 0).unwrap().is_empty());
    let mut cursor = db
        .range(&index, &[Value::Int(41)], &[Value::Int(43)])
        .unwrap();
    let mut seen = Vec::new();
    while let Some((keys, _)) = cursor.next_entry().unwrap() {
        let Value::Int(v) = keys[0] else { panic!() };
        seen.push(v);
    }
    assert_eq!(seen, vec![41, 43]);
}

#[test]
fn oversized_value_lists_survive_compaction_whole() {
    let (_dir, db) = create_db();
    let index = db.create_index("fanout", &[KeyType::Int], false, 0).unwrap();

    // One key with more values than a single page can hold, surrounded by
    // ordinary neighbors.
    let mut tx = db.begin().unwrap();
    for position in 0..12_000i64 {
        tx.put(&index, &[Value::Int(500)], Rid::new(1, position)).unwrap();
    }
    for v in 0..100i64 {
        tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        tx.put(&index, &[Value::Int(1000 + v)], Rid::new(0, v)).unwrap();
    }
    db.commit(&mut tx).unwrap();
    assert!(db.compact("fanout").unwrap());

    assert_eq!(db.get(&index, &[Value::Int(500)], 0).unwrap().len(), 12_000);
    assert_eq!(db.get(&index, &[Value::Int(99)], 0).unwrap().len(), 1);
    assert_eq!(db.get(&index, &[Value::Int(1000)], 0).unwrap().len(), 1);

    let mut cursor = db
        .range(&index, &[Value::Int(500)], &[Value::Int(500)])
        .unwrap();
    let mut count = 0u64;
    while let Some((keys, _)) = cursor.next_entry().unwrap() {
        assert_eq!(keys[0], Value::Int(500));
        count += 1;
    }
    assert_eq!(count, 12_000);
}

#[test]
fn background_compactor_picks_up_a_growing_index() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path())
        .auto_compaction(true)
        .compaction_page_threshold(2)
        .compaction_interval(Duration::from_millis(20))
        .open()
        .unwrap();
    let index = db.create_index("grow", &[KeyType::Int], false, 0).unwrap();

    fill(&db, &index, 0..8000);

    // Two .idx files once the swap lands: new mutable tier + compacted tier.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let idx_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "idx"))
            .count();
        if idx_files == 2 && index.compaction_status() == stratadb::CompactionStatus::Idle {
            break;
        }
        assert!(Instant::now() < deadline, "background compaction never ran");
        std::thread::sleep(Duration::from_millis(20));
    }

    for v in [0i64, 4321, 7999] {
        assert_eq!(db.get(&index, &[Value::Int(v)], 0).unwrap().len(), 1);
    }
    db.close().unwrap();
}
