//! Row lifecycle and deferred garbage collection over the full engine.

use std::sync::Arc;

use marrowdb::{
    ColumnInfo, DataType, InMemoryStoreSystem, IsolationLevel, RecordState, Row, StoreSystem,
    TableSchema, TableSourceComposite, Value,
};

fn open_db() -> Arc<TableSourceComposite> {
    let system: Arc<dyn StoreSystem> = Arc::new(InMemoryStoreSystem::new(8192));
    let db = TableSourceComposite::open(system).unwrap();
    db.create_table(TableSchema::new(
        "t",
        vec![
            ColumnInfo::new("id", DataType::Integer).nullable(false),
            ColumnInfo::new("tag", DataType::String),
        ],
    ))
    .unwrap();
    db
}

fn row(id: i64, tag: &str) -> Row {
    Row::new(vec![Value::Integer(id), Value::String(tag.to_string())])
}

fn insert_three(db: &Arc<TableSourceComposite>) -> Vec<u64> {
    let mut txn = db.begin_transaction(IsolationLevel::Serializable);
    let ids = {
        let mut t = txn.table("t").unwrap();
        vec![
            t.add_row(row(0, "r0")).unwrap(),
            t.add_row(row(1, "r1")).unwrap(),
            t.add_row(row(2, "r2")).unwrap(),
        ]
    };
    txn.commit().unwrap();
    ids
}

#[test]
fn test_insert_commit_makes_rows_committed_added() {
    let db = open_db();
    let ids = insert_three(&db);
    let source = db.table_source("t").unwrap();
    for id in &ids {
        assert_eq!(source.row_state(*id).unwrap(), RecordState::CommittedAdded);
    }
    assert_eq!(source.raw_row_count(), 3);
}

#[test]
fn test_removed_row_outlives_commit_until_collected() {
    let db = open_db();
    let ids = insert_three(&db);
    let r1 = ids[1];
    let source = db.table_source("t").unwrap();

    // B snapshots the table before A's delete commits.
    let mut b = db.begin_transaction(IsolationLevel::Serializable);

    let mut a = db.begin_transaction(IsolationLevel::Serializable);
    a.table("t").unwrap().remove_row(r1).unwrap();
    a.commit().unwrap();

    // r1 is CommittedRemoved but B still resolves it through its snapshot.
    assert_eq!(source.row_state(r1).unwrap(), RecordState::CommittedRemoved);
    {
        let view = b.table("t").unwrap();
        assert!(view.contains_row(r1));
        assert_eq!(view.row(r1).unwrap(), row(1, "r1"));
    }

    // GC defers while B can still see the old snapshot.
    db.collect_garbage(false);
    assert_eq!(source.raw_row_count(), 3);

    b.rollback();
    db.collect_garbage(false);
    assert_eq!(source.raw_row_count(), 2);
    assert!(source.row_state(r1).is_err());

    // New snapshots see exactly r0 and r2.
    let mut c = db.begin_transaction(IsolationLevel::Serializable);
    let view = c.table("t").unwrap();
    assert_eq!(view.row_ids(), vec![ids[0], ids[2]]);
}

#[test]
fn test_force_collect_ignores_open_snapshots() {
    let db = open_db();
    let ids = insert_three(&db);
    let source = db.table_source("t").unwrap();

    let _reader = db.begin_transaction(IsolationLevel::Serializable);

    let mut a = db.begin_transaction(IsolationLevel::Serializable);
    a.table("t").unwrap().remove_row(ids[0]).unwrap();
    a.commit().unwrap();

    db.collect_garbage(true);
    assert_eq!(source.raw_row_count(), 2);
}

#[test]
fn test_uncommitted_rows_never_visible_elsewhere() {
    let db = open_db();
    insert_three(&db);

    let mut writer = db.begin_transaction(IsolationLevel::Serializable);
    let extra = writer.table("t").unwrap().add_row(row(9, "r9")).unwrap();

    let mut reader = db.begin_transaction(IsolationLevel::Serializable);
    let view = reader.table("t").unwrap();
    assert!(!view.contains_row(extra));
    assert_eq!(view.row_count(), 3);

    writer.rollback();
    let source = db.table_source("t").unwrap();
    assert_eq!(source.raw_row_count(), 3);
}
