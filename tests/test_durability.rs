//! Durability of the full engine over the journaled store system.

use std::path::Path;
use std::sync::Arc;

use marrowdb::{
    ColumnInfo, DataType, EngineConfig, IsolationLevel, JournaledStoreSystem, Row, StoreSystem,
    TableSchema, TableSourceComposite, Value,
};

fn config(dir: &Path) -> EngineConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    EngineConfig::new(dir).page_size(256)
}

fn schema() -> TableSchema {
    TableSchema::new(
        "events",
        vec![
            ColumnInfo::new("seq", DataType::Integer).nullable(false),
            ColumnInfo::new("body", DataType::String),
        ],
    )
}

fn event(seq: i64, body: &str) -> Row {
    Row::new(vec![Value::Integer(seq), Value::String(body.to_string())])
}

#[test]
fn test_committed_rows_survive_clean_restart() {
    let dir = tempfile::tempdir().unwrap();

    let row_id = {
        let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
        let db = TableSourceComposite::open(system.clone() as Arc<dyn StoreSystem>).unwrap();
        db.create_table(schema()).unwrap();

        let mut txn = db.begin_transaction(IsolationLevel::Serializable);
        let row_id = txn
            .table("events")
            .unwrap()
            .add_row(event(1, "created"))
            .unwrap();
        txn.commit().unwrap();

        db.close().unwrap();
        system.stop().unwrap();
        row_id
    };

    let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
    let db = TableSourceComposite::open(system as Arc<dyn StoreSystem>).unwrap();
    assert!(db.table_exists("events"));

    let mut txn = db.begin_transaction(IsolationLevel::Serializable);
    let view = txn.table("events").unwrap();
    assert_eq!(view.row(row_id).unwrap(), event(1, "created"));
}

#[test]
fn test_committed_rows_survive_crash_without_stop() {
    let dir = tempfile::tempdir().unwrap();

    let row_id = {
        let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
        let db = TableSourceComposite::open(system as Arc<dyn StoreSystem>).unwrap();
        db.create_table(schema()).unwrap();

        let mut txn = db.begin_transaction(IsolationLevel::Serializable);
        let row_id = txn
            .table("events")
            .unwrap()
            .add_row(event(7, "survivor"))
            .unwrap();
        txn.commit().unwrap();
        // Neither close() nor stop(): the process "crashes" here.
        row_id
    };

    // Reopening replays whatever the journal still holds.
    let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
    let db = TableSourceComposite::open(system as Arc<dyn StoreSystem>).unwrap();
    let mut txn = db.begin_transaction(IsolationLevel::Serializable);
    let view = txn.table("events").unwrap();
    assert_eq!(view.row(row_id).unwrap(), event(7, "survivor"));
}

#[test]
fn test_uncommitted_rows_do_not_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
        let db = TableSourceComposite::open(system.clone() as Arc<dyn StoreSystem>).unwrap();
        db.create_table(schema()).unwrap();

        let mut committed = db.begin_transaction(IsolationLevel::Serializable);
        committed
            .table("events")
            .unwrap()
            .add_row(event(1, "kept"))
            .unwrap();
        committed.commit().unwrap();

        // An in-flight transaction whose process dies mid-write: the row
        // reaches the store Uncommitted and the journal gets flushed.
        let mut in_flight = db.begin_transaction(IsolationLevel::Serializable);
        in_flight
            .table("events")
            .unwrap()
            .add_row(event(2, "lost"))
            .unwrap();
        system.flush().unwrap();
        std::mem::forget(in_flight);
    }

    let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
    let db = TableSourceComposite::open(system as Arc<dyn StoreSystem>).unwrap();
    let mut txn = db.begin_transaction(IsolationLevel::Serializable);
    let view = txn.table("events").unwrap();
    // Only the committed row is visible after recovery.
    assert_eq!(view.row_count(), 1);
    let ids = view.row_ids();
    assert_eq!(view.row(ids[0]).unwrap(), event(1, "kept"));
}

#[test]
fn test_checkpoint_retires_journal_files() {
    let dir = tempfile::tempdir().unwrap();

    let system = Arc::new(JournaledStoreSystem::open(config(dir.path())).unwrap());
    let db = TableSourceComposite::open(system.clone() as Arc<dyn StoreSystem>).unwrap();
    db.create_table(schema()).unwrap();

    for seq in 0..10 {
        let mut txn = db.begin_transaction(IsolationLevel::Serializable);
        txn.table("events")
            .unwrap()
            .add_row(event(seq, "bulk"))
            .unwrap();
        txn.commit().unwrap();
    }
    db.close().unwrap();

    // Every commit checkpointed; only the live journal file may remain.
    let journals = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter(|n| n.ends_with(".mjr"))
        .count();
    assert_eq!(journals, 1);
}
