//! Handle sharing, the exclusive file lock, and readers racing a writer.

use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use turdb::btree::key_encoding::encode_i64;
use turdb::{Database, Options};

#[test]
fn second_open_fails_database_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.db");

    let first = Database::open(&path, Options::default()).unwrap();
    assert!(matches!(
        Database::open(&path, Options::default()),
        Err(turdb::Error::DatabaseLocked)
    ));
    first.close().unwrap();

    // Lock released with the handle.
    let _second = Database::open(&path, Options::default()).unwrap();
}

#[test]
fn readers_share_the_handle_across_threads() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("t.db"), Options::default()).unwrap());
    let tree = db.btree_create("t").unwrap();
    drop(tree);

    {
        let tree = db.btree_open("t").unwrap();
        let mut tx = db.begin().unwrap();
        for i in 0..500i64 {
            tree.put(&mut tx, &encode_i64(i), b"shared").unwrap();
        }
        db.commit(&mut tx).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let tree = db.btree_open("t").unwrap();
                let tx = db.begin().unwrap();
                for i in (worker..500).step_by(4) {
                    let got = tree.get(&tx, &encode_i64(i as i64)).unwrap();
                    assert_eq!(got, Some(b"shared".to_vec()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn readers_keep_their_snapshot_while_a_writer_churns() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("t.db"), Options::default()).unwrap());
    {
        let tree = db.btree_create("t").unwrap();
        let mut tx = db.begin().unwrap();
        for i in 0..200i64 {
            tree.put(&mut tx, &encode_i64(i), b"v0").unwrap();
        }
        db.commit(&mut tx).unwrap();
    }

    let reader_db = Arc::clone(&db);
    let reader = thread::spawn(move || {
        let tree = reader_db.btree_open("t").unwrap();
        let tx = reader_db.begin().unwrap();
        // Snapshot taken before the writer starts below may race it; every
        // read inside one transaction must still be internally consistent.
        let first = tree.get(&tx, &encode_i64(0)).unwrap().unwrap();
        for _ in 0..50 {
            for i in 0..200i64 {
                let got = tree.get(&tx, &encode_i64(i)).unwrap().unwrap();
                assert_eq!(got, first, "snapshot must not shift mid-transaction");
            }
        }
    });

    let writer = thread::spawn({
        let db = Arc::clone(&db);
        move || {
            let tree = db.btree_open("t").unwrap();
            for round in 1..6u8 {
                let mut tx = db.begin().unwrap();
                for i in 0..200i64 {
                    tree.put(&mut tx, &encode_i64(i), &[b'v', round]).unwrap();
                }
                db.commit(&mut tx).unwrap();
            }
        }
    });

    reader.join().unwrap();
    writer.join().unwrap();

    let tree = db.btree_open("t").unwrap();
    let tx = db.begin().unwrap();
    assert_eq!(tree.get(&tx, &encode_i64(7)).unwrap(), Some(vec![b'v', 5]));
}

#[test]
fn conflicting_writers_race_cleanly() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("t.db"), Options::default()).unwrap());
    {
        let tree = db.btree_create("t").unwrap();
        let mut tx = db.begin().unwrap();
        tree.put(&mut tx, b"hot", b"0").unwrap();
        db.commit(&mut tx).unwrap();
    }

    let mut wins = 0u32;
    let mut conflicts = 0u32;
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let tree = db.btree_open("t").unwrap();
                let mut tx = db.begin().unwrap();
                match tree.put(&mut tx, b"hot", &[i]) {
                    Ok(()) => {
                        db.commit(&mut tx).unwrap();
                        true
                    }
                    Err(turdb::Error::WriteConflict) => {
                        db.rollback(&mut tx).unwrap();
                        false
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            })
        })
        .collect();
    for handle in handles {
        if handle.join().unwrap() {
            wins += 1;
        } else {
            conflicts += 1;
        }
    }
    assert_eq!(wins + conflicts, 8);
    assert!(wins >= 1, "at least one writer must get through");

    // The row holds exactly one winner's value and the DB is structurally sound.
    let tree = db.btree_open("t").unwrap();
    let tx = db.begin().unwrap();
    assert!(tree.get(&tx, b"hot").unwrap().is_some());
    assert!(db.quick_check().unwrap().is_empty());
}
