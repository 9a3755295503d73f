//! Table source composite
//!
//! The composite owns every table source in the database: it creates and
//! drops tables, persists the table catalog, hands out transaction
//! snapshots, and runs the two-phase commit protocol (validate all row
//! removals against the snapshot versions, then apply and publish a new
//! committed index set per table).
//!
//! Lock order is fixed: the table registry, then the snapshot lock, then
//! each touched source's inner lock in ascending table-name order, then
//! that source's GC lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::data::TableSchema;
use crate::error::{Error, Result};
use crate::store::system::{Store, StoreSystem};
use crate::table::source::{RecordState, TableSource};
use crate::transaction::{IsolationLevel, Transaction, TxnTableState};

const CATALOG_STORE: &str = "marrow_catalog";
const TABLE_STORE_PREFIX: &str = "tbl_";

/// One commit removing at least this many rows from a table requests a
/// full GC sweep instead of tracking the rows individually.
const FULL_SWEEP_THRESHOLD: usize = 256;

/// What one commit did to one table, reported to commit callbacks.
#[derive(Debug, Clone)]
pub struct TableEvent {
    pub table: String,
    pub added: Vec<u64>,
    pub removed: Vec<u64>,
}

/// The registry of all table sources and the commit/rollback protocol.
pub struct TableSourceComposite {
    store_system: Arc<dyn StoreSystem>,
    tables: RwLock<IndexMap<String, Arc<TableSource>>>,
    catalog: Option<Store>,
    commit_counter: Mutex<u64>,
    next_txn_id: AtomicU64,
    // Commits hold this shared while they apply; snapshot capture holds it
    // exclusively, so a starting transaction never sees half of a
    // multi-table commit. Commits on disjoint tables still run in parallel.
    snapshot_lock: RwLock<()>,
}

impl TableSourceComposite {
    /// Open the composite over a store system, loading the table catalog
    /// and reopening every table source it names.
    pub fn open(store_system: Arc<dyn StoreSystem>) -> Result<Arc<Self>> {
        let mut tables = IndexMap::new();
        let catalog = if store_system.store_exists(CATALOG_STORE) {
            let catalog = store_system.open_store(CATALOG_STORE)?;
            for name in read_catalog(&catalog)? {
                let store = store_system.open_store(&table_store_name(&name))?;
                let source = Arc::new(TableSource::open(store)?);
                tables.insert(name, source);
            }
            Some(catalog)
        } else {
            match store_system.create_store(CATALOG_STORE) {
                Ok(catalog) => {
                    write_catalog(&catalog, &[])?;
                    Some(catalog)
                }
                Err(Error::ReadOnlyStoreSystem) => None,
                Err(e) => return Err(e),
            }
        };
        info!(tables = tables.len(), "table composite opened");

        Ok(Arc::new(Self {
            store_system,
            tables: RwLock::new(tables),
            catalog,
            commit_counter: Mutex::new(1),
            next_txn_id: AtomicU64::new(1),
            snapshot_lock: RwLock::new(()),
        }))
    }

    /// Create a new table from its schema.
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let name = schema.name().to_string();
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(&name) {
            return Err(Error::TableAlreadyExists(name));
        }
        let store = self.store_system.create_store(&table_store_name(&name))?;
        let source = Arc::new(TableSource::create(name.clone(), schema, store)?);
        tables.insert(name.clone(), source);
        self.persist_catalog(&tables)?;
        info!(table = %name, "table created");
        Ok(())
    }

    /// Drop a table. Fails while any open transaction can still see it.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let source = tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        {
            let inner = source.lock_inner();
            if inner.root_locks > 0 || inner.pending_changes > 0 {
                return Err(Error::TableInUse(name.to_string()));
            }
        }
        source.close();
        tables.shift_remove(name);
        self.store_system.delete_store(&table_store_name(name))?;
        self.persist_catalog(&tables)?;
        info!(table = %name, "table dropped");
        Ok(())
    }

    /// Does a table with this name exist?
    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().unwrap().contains_key(name)
    }

    /// Names of all tables, in creation order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().unwrap().keys().cloned().collect()
    }

    /// The shared source for one table.
    pub fn table_source(&self, name: &str) -> Result<Arc<TableSource>> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Begin a transaction over a snapshot of every table. Each table's
    /// committed index set is captured and root-locked until the
    /// transaction finishes.
    pub fn begin_transaction(self: &Arc<Self>, isolation: IsolationLevel) -> Transaction {
        let tables = self.tables.read().unwrap();
        let _snapshot = self.snapshot_lock.write().unwrap();
        let mut states = IndexMap::with_capacity(tables.len());
        for (name, source) in tables.iter() {
            let (snapshot, version) = {
                let mut inner = source.lock_inner();
                inner.root_locks += 1;
                (inner.committed_rows.clone(), inner.commit_version)
            };
            states.insert(name.clone(), TxnTableState::new(source.clone(), snapshot, version));
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        debug!(txn = id, tables = states.len(), "transaction started");
        Transaction::new(self.clone(), id, isolation, states)
    }

    /// Checkpoint the underlying store system.
    pub fn set_check_point(&self) -> Result<()> {
        self.store_system.set_check_point()
    }

    /// Run a garbage collection cycle over every table.
    pub fn collect_garbage(&self, force: bool) {
        let tables = self.tables.read().unwrap();
        for source in tables.values() {
            source.collect(force);
        }
    }

    /// Close every table source and checkpoint.
    pub fn close(&self) -> Result<()> {
        let tables = self.tables.read().unwrap();
        for source in tables.values() {
            source.close();
        }
        self.store_system.set_check_point()
    }

    /// Validate and apply one transaction's changes.
    ///
    /// Touched tables are locked in ascending name order so concurrent
    /// commits serialize without deadlocking. A removal of a row whose
    /// version advanced past the transaction's snapshot (or whose state
    /// already left CommittedAdded) is a commit conflict; the first
    /// conflict aborts the whole commit before anything is applied.
    ///
    /// Validation touches only in-memory state, so an error from this
    /// method is either a [`Error::CommitConflict`] (nothing was applied)
    /// or a store write failure reported after every table's new committed
    /// set was installed; the caller maps the latter to a durability
    /// failure of an otherwise committed transaction.
    pub(crate) fn commit_transaction(
        &self,
        txn_id: u64,
        states: &IndexMap<String, TxnTableState>,
    ) -> Result<Vec<TableEvent>> {
        let mut touched: Vec<&str> = states
            .iter()
            .filter(|(_, s)| s.index_set.has_changes() || !s.inserted.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        touched.sort_unstable();
        if touched.is_empty() {
            debug!(txn = txn_id, "commit with no changes");
            return Ok(Vec::new());
        }

        let _apply = self.snapshot_lock.read().unwrap();
        let sources: Vec<Arc<TableSource>> = touched
            .iter()
            .map(|name| states[*name].source.clone())
            .collect();
        let mut guards: Vec<_> = sources.iter().map(|s| s.lock_inner()).collect();

        // Phase one: validate.
        for (i, name) in touched.iter().enumerate() {
            let state = &states[*name];
            let inner = &guards[i];
            for &row in state.index_set.removed() {
                let current = TableSource::slot_state(inner, row);
                let version = inner.row_versions.get(&row).copied().unwrap_or(0);
                if current != Some(RecordState::CommittedAdded) || version > state.snapshot_version
                {
                    debug!(txn = txn_id, table = %name, row, "commit conflict");
                    return Err(Error::CommitConflict {
                        table: name.to_string(),
                        row,
                    });
                }
            }
        }

        // Phase two: apply under a single new commit version. Each table's
        // deltas are merged into its *current* committed set, not the
        // begin-time snapshot, so rows committed by transactions that
        // overlapped this one survive.
        let version = {
            let mut counter = self.commit_counter.lock().unwrap();
            *counter += 1;
            *counter
        };

        let mut durability: Option<Error> = None;
        let mut events = Vec::with_capacity(touched.len());
        for (i, name) in touched.iter().enumerate() {
            let state = &states[*name];
            let source = &sources[i];
            let inner = &mut guards[i];

            if state.index_set.has_changes() {
                let added: Vec<u64> = state.index_set.added().iter().copied().collect();
                let removed: Vec<u64> = state.index_set.removed().iter().copied().collect();
                for &row in &added {
                    if let Err(e) = source.commit_row_add(inner, row, version) {
                        warn!(txn = txn_id, table = %name, row, error = %e,
                            "row state write failed during commit");
                        durability.get_or_insert(e);
                    }
                }
                for &row in &removed {
                    if let Err(e) = source.commit_row_remove(inner, row, version) {
                        warn!(txn = txn_id, table = %name, row, error = %e,
                            "row state write failed during commit");
                        durability.get_or_insert(e);
                    }
                }

                let committed = state.index_set.merge_into(&inner.committed_rows);
                source.install_committed(inner, committed, version);

                if !removed.is_empty() {
                    let mut gc = source.gc.lock().unwrap();
                    if removed.len() >= FULL_SWEEP_THRESHOLD {
                        gc.request_full_sweep();
                    } else {
                        for &row in &removed {
                            gc.delete_row(row);
                        }
                    }
                }

                events.push(TableEvent {
                    table: name.to_string(),
                    added,
                    removed,
                });
            }

            // Rows this transaction inserted and then removed again were
            // never visible to anyone; reclaim their records now.
            for &row in &state.inserted {
                if !state.index_set.added().contains(&row) {
                    if let Err(e) = source.reclaim_uncommitted(inner, row) {
                        warn!(txn = txn_id, table = %name, row, error = %e,
                            "could not reclaim replaced row");
                        durability.get_or_insert(e);
                    }
                }
            }
        }
        drop(guards);

        debug!(txn = txn_id, version, tables = events.len(), "transaction committed");
        match durability {
            Some(e) => Err(e),
            None => Ok(events),
        }
    }

    /// Discard one transaction's changes: every row it inserted is
    /// reclaimed, and its removals are forgotten with its index set.
    pub(crate) fn rollback_transaction(
        &self,
        txn_id: u64,
        states: &IndexMap<String, TxnTableState>,
    ) {
        for (name, state) in states.iter() {
            if state.inserted.is_empty() {
                continue;
            }
            let mut inner = state.source.lock_inner();
            for &row in &state.inserted {
                if let Err(e) = state.source.reclaim_uncommitted(&mut inner, row) {
                    warn!(txn = txn_id, table = %name, row, error = %e,
                        "could not reclaim rolled-back row");
                }
            }
        }
        debug!(txn = txn_id, "transaction rolled back");
    }
}

fn table_store_name(table: &str) -> String {
    format!("{}{}", TABLE_STORE_PREFIX, table)
}

fn read_catalog(catalog: &Store) -> Result<Vec<String>> {
    if catalog.size() < 4 {
        return Ok(Vec::new());
    }
    let mut word = [0u8; 4];
    catalog.read_bytes(0, &mut word)?;
    let len = LittleEndian::read_u32(&word) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut bytes = vec![0u8; len];
    catalog.read_bytes(4, &mut bytes)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Internal(format!("cannot decode table catalog: {}", e)))
}

fn write_catalog(catalog: &Store, names: &[&str]) -> Result<()> {
    let bytes = serde_json::to_vec(names)
        .map_err(|e| Error::Internal(format!("cannot encode table catalog: {}", e)))?;
    let mut record = Vec::with_capacity(4 + bytes.len());
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, bytes.len() as u32);
    record.extend_from_slice(&word);
    record.extend_from_slice(&bytes);
    catalog.write_bytes(0, &record)
}

impl TableSourceComposite {
    fn persist_catalog(&self, tables: &IndexMap<String, Arc<TableSource>>) -> Result<()> {
        if let Some(catalog) = &self.catalog {
            let names: Vec<&str> = tables.keys().map(|n| n.as_str()).collect();
            write_catalog(catalog, &names)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PAGE_SIZE;
    use crate::data::{ColumnInfo, DataType};
    use crate::store::system::InMemoryStoreSystem;

    fn schema(name: &str) -> TableSchema {
        TableSchema::new(name, vec![ColumnInfo::new("v", DataType::Integer)])
    }

    fn composite() -> Arc<TableSourceComposite> {
        let sys: Arc<dyn StoreSystem> = Arc::new(InMemoryStoreSystem::new(DEFAULT_PAGE_SIZE));
        TableSourceComposite::open(sys).unwrap()
    }

    #[test]
    fn test_create_and_drop_tables() {
        let composite = composite();
        composite.create_table(schema("a")).unwrap();
        composite.create_table(schema("b")).unwrap();
        assert!(composite.table_exists("a"));
        assert_eq!(composite.table_names(), vec!["a", "b"]);
        assert!(matches!(
            composite.create_table(schema("a")),
            Err(Error::TableAlreadyExists(_))
        ));

        composite.drop_table("a").unwrap();
        assert!(!composite.table_exists("a"));
        assert!(matches!(
            composite.drop_table("a"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn test_drop_refused_while_table_in_use() {
        let composite = composite();
        composite.create_table(schema("a")).unwrap();

        let txn = composite.begin_transaction(IsolationLevel::Serializable);
        assert!(matches!(
            composite.drop_table("a"),
            Err(Error::TableInUse(_))
        ));
        drop(txn);
        composite.drop_table("a").unwrap();
    }

    #[test]
    fn test_catalog_survives_reopen() {
        let sys: Arc<dyn StoreSystem> = Arc::new(InMemoryStoreSystem::new(DEFAULT_PAGE_SIZE));
        {
            let composite = TableSourceComposite::open(sys.clone()).unwrap();
            composite.create_table(schema("accounts")).unwrap();
            composite.close().unwrap();
        }
        let composite = TableSourceComposite::open(sys).unwrap();
        assert!(composite.table_exists("accounts"));
        let source = composite.table_source("accounts").unwrap();
        assert_eq!(source.schema(), &schema("accounts"));
    }
}
