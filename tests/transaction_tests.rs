//! MVCC semantics through the public surface: rollback isolation, write
//! conflicts, snapshot isolation, terminal-state policing.

use tempfile::TempDir;
use turdb::{Database, Options, TxnState};

fn open_with_table(dir: &TempDir) -> Database {
    let db = Database::open(&dir.path().join("t.db"), Options::default()).unwrap();
    let tree = db.btree_create("t").unwrap();
    let mut tx = db.begin().unwrap();
    tree.put(&mut tx, b"id1", b"a").unwrap();
    tree.put(&mut tx, b"id2", b"b").unwrap();
    tree.put(&mut tx, b"id3", b"c").unwrap();
    db.commit(&mut tx).unwrap();
    db
}

fn visible_count(db: &Database) -> usize {
    let tx = db.begin().unwrap();
    let tree = db.btree_open("t").unwrap();
    let mut cursor = tree.cursor(&tx).unwrap();
    let mut count = 0;
    if cursor.first().unwrap() {
        loop {
            count += 1;
            if !cursor.next().unwrap() {
                break;
            }
        }
    }
    count
}

#[test]
fn rollback_isolates() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let mut tx = db.begin().unwrap();
    tree.put(&mut tx, b"id4", b"d").unwrap();
    // Inside the transaction the new row is visible.
    assert_eq!(tree.get(&tx, b"id4").unwrap(), Some(b"d".to_vec()));
    {
        let mut cursor = tree.cursor(&tx).unwrap();
        let mut count = 0;
        assert!(cursor.first().unwrap());
        loop {
            count += 1;
            if !cursor.next().unwrap() {
                break;
            }
        }
        assert_eq!(count, 4);
    }
    db.rollback(&mut tx).unwrap();

    // Outside: three rows, and the key is gone.
    assert_eq!(visible_count(&db), 3);
    let tx = db.begin().unwrap();
    assert_eq!(tree.get(&tx, b"id4").unwrap(), None);
}

#[test]
fn write_conflict_protocol() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let mut t1 = db.begin().unwrap();
    let mut t2 = db.begin().unwrap();

    // T1 claims id1.
    tree.put(&mut t1, b"id1", b"A1").unwrap();
    // T2's write to the same row fails...
    assert!(matches!(
        tree.put(&mut t2, b"id1", b"A2"),
        Err(turdb::Error::WriteConflict)
    ));
    // ...but T2 stays usable and can write elsewhere.
    assert_eq!(t2.state(), TxnState::Active);
    tree.put(&mut t2, b"id2", b"B2").unwrap();

    db.commit(&mut t1).unwrap();
    db.commit(&mut t2).unwrap();

    // After T1 released its claim, a new transaction can update id1.
    let mut t3 = db.begin().unwrap();
    tree.put(&mut t3, b"id1", b"A3").unwrap();
    db.commit(&mut t3).unwrap();

    let tx = db.begin().unwrap();
    assert_eq!(tree.get(&tx, b"id1").unwrap(), Some(b"A3".to_vec()));
    assert_eq!(tree.get(&tx, b"id2").unwrap(), Some(b"B2".to_vec()));
}

#[test]
fn snapshot_isolation_repeatable_reads() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let t_read = db.begin().unwrap();
    assert_eq!(tree.get(&t_read, b"id1").unwrap(), Some(b"a".to_vec()));

    // A concurrent writer updates and commits.
    let mut t_write = db.begin().unwrap();
    tree.put(&mut t_write, b"id1", b"A").unwrap();
    db.commit(&mut t_write).unwrap();

    // The old snapshot still reads the old value.
    assert_eq!(tree.get(&t_read, b"id1").unwrap(), Some(b"a".to_vec()));
    // A fresh transaction sees the new one.
    let t_new = db.begin().unwrap();
    assert_eq!(tree.get(&t_new, b"id1").unwrap(), Some(b"A".to_vec()));
}

#[test]
fn own_uncommitted_writes_are_visible_in_order() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let mut tx = db.begin().unwrap();
    tree.put(&mut tx, b"id1", b"x1").unwrap();
    assert_eq!(tree.get(&tx, b"id1").unwrap(), Some(b"x1".to_vec()));
    tree.put(&mut tx, b"id1", b"x2").unwrap();
    assert_eq!(tree.get(&tx, b"id1").unwrap(), Some(b"x2".to_vec()));
    tree.delete(&mut tx, b"id1").unwrap();
    assert_eq!(tree.get(&tx, b"id1").unwrap(), None);
    db.rollback(&mut tx).unwrap();

    let tx = db.begin().unwrap();
    assert_eq!(tree.get(&tx, b"id1").unwrap(), Some(b"a".to_vec()));
}

#[test]
fn delete_then_commit_hides_row() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let t_old = db.begin().unwrap();
    let mut tx = db.begin().unwrap();
    assert!(tree.delete(&mut tx, b"id2").unwrap());
    db.commit(&mut tx).unwrap();

    // The pre-delete snapshot still sees it.
    assert_eq!(tree.get(&t_old, b"id2").unwrap(), Some(b"b".to_vec()));
    // Fresh snapshots do not.
    let t_new = db.begin().unwrap();
    assert_eq!(tree.get(&t_new, b"id2").unwrap(), None);
    assert_eq!(visible_count(&db), 2);
}

#[test]
fn deleting_missing_row_reports_false() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();
    let mut tx = db.begin().unwrap();
    assert!(!tree.delete(&mut tx, b"ghost").unwrap());
    db.commit(&mut tx).unwrap();
}

#[test]
fn terminal_transactions_reject_further_use() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let mut tx = db.begin().unwrap();
    db.commit(&mut tx).unwrap();
    assert!(matches!(db.commit(&mut tx), Err(turdb::Error::TxDone)));
    assert!(matches!(db.rollback(&mut tx), Err(turdb::Error::TxDone)));
    assert!(matches!(
        tree.put(&mut tx, b"k", b"v"),
        Err(turdb::Error::TxDone)
    ));
    assert!(matches!(tree.get(&tx, b"id1"), Err(turdb::Error::TxDone)));
}

#[test]
fn gc_compacts_dead_versions() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    for i in 0..5u8 {
        let mut tx = db.begin().unwrap();
        tree.put(&mut tx, b"id1", &[b'v', i]).unwrap();
        db.commit(&mut tx).unwrap();
    }
    let stats = db.gc().unwrap();
    assert!(stats.versions_removed >= 4, "got {:?}", stats);

    // Latest value survives.
    let tx = db.begin().unwrap();
    assert_eq!(tree.get(&tx, b"id1").unwrap(), Some(vec![b'v', 4]));
}

#[test]
fn snapshot_pin_blocks_gc() {
    let dir = TempDir::new().unwrap();
    let db = open_with_table(&dir);
    let tree = db.btree_open("t").unwrap();

    let reader = db.begin().unwrap();
    let pin = db.create_snapshot(&reader).unwrap();

    let mut tx = db.begin().unwrap();
    tree.put(&mut tx, b"id1", b"newer").unwrap();
    db.commit(&mut tx).unwrap();

    let stats = db.gc().unwrap();
    assert_eq!(stats.versions_removed, 0, "pinned snapshot protects versions");
    assert_eq!(tree.get(&reader, b"id1").unwrap(), Some(b"a".to_vec()));

    drop(pin);
    drop(reader);
}
