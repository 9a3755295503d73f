//! Transaction implementation
//!
//! Each transaction owns one [`TxnTableState`] per table: the shared
//! committed snapshot (root-locked for the transaction's lifetime) plus
//! the private index-set deltas. Row payloads written by the transaction
//! go straight to the table source in the Uncommitted state, so a
//! rollback only has to reclaim those rows and drop the deltas.
//!
//! Dropping an active transaction rolls it back.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::data::{Row, TableSchema, Value};
use crate::error::{Error, Result};
use crate::table::composite::{TableEvent, TableSourceComposite};
use crate::table::index_set::IndexSet;
use crate::table::source::TableSource;

/// Isolation level of a transaction. The engine always provides snapshot
/// isolation; the level is recorded for layers above that restrict it
/// further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// Per-table state a transaction carries: the shared source, the commit
/// version its snapshot was taken at, and the private index-set view.
/// `inserted` records every physical row the transaction wrote, including
/// ones it removed from its view again, so commit and rollback can reclaim
/// records the index set no longer mentions.
pub(crate) struct TxnTableState {
    pub(crate) source: Arc<TableSource>,
    pub(crate) snapshot_version: u64,
    pub(crate) index_set: IndexSet,
    pub(crate) inserted: Vec<u64>,
    pub(crate) dirty: bool,
}

impl TxnTableState {
    pub(crate) fn new(
        source: Arc<TableSource>,
        snapshot: Arc<BTreeSet<u64>>,
        snapshot_version: u64,
    ) -> Self {
        Self {
            source,
            snapshot_version,
            index_set: IndexSet::from_snapshot(snapshot),
            inserted: Vec::new(),
            dirty: false,
        }
    }
}

type CommitCallback = Box<dyn FnMut(&TableEvent) + Send>;

/// An isolated snapshot of the database with buffered changes.
pub struct Transaction {
    id: u64,
    isolation: IsolationLevel,
    read_only: bool,
    state: TransactionState,
    composite: Arc<TableSourceComposite>,
    tables: IndexMap<String, TxnTableState>,
    callbacks: Vec<(String, CommitCallback)>,
}

impl Transaction {
    pub(crate) fn new(
        composite: Arc<TableSourceComposite>,
        id: u64,
        isolation: IsolationLevel,
        tables: IndexMap<String, TxnTableState>,
    ) -> Self {
        Self {
            id,
            isolation,
            read_only: false,
            state: TransactionState::Active,
            composite,
            tables,
            callbacks: Vec::new(),
        }
    }

    /// Transaction identifier, unique within this composite.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Isolation level the transaction was begun with.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Is the transaction still open?
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Mark the transaction read-only: any mutating table operation fails
    /// with [`Error::ReadOnlyTransaction`].
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    /// Register a callback fired after this transaction commits, with the
    /// rows the commit added to and removed from the named table.
    pub fn on_commit<F>(&mut self, table: impl Into<String>, callback: F)
    where
        F: FnMut(&TableEvent) + Send + 'static,
    {
        self.callbacks.push((table.into(), Box::new(callback)));
    }

    /// A mutable view over one table within this transaction.
    pub fn table(&mut self, name: &str) -> Result<TableView<'_>> {
        if self.state != TransactionState::Active {
            return Err(Error::TransactionClosed(self.id));
        }
        let id = self.id;
        let read_only = self.read_only;
        let state = self
            .tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        Ok(TableView {
            txn_id: id,
            read_only,
            state,
        })
    }

    /// Commit the transaction's changes.
    ///
    /// On a commit conflict the transaction is rolled back before the
    /// error is returned; the caller should retry against a fresh
    /// snapshot. Any other error is a durability failure reported after
    /// the changes were already published: the transaction still ends
    /// `Committed` and must not be retried.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::TransactionClosed(self.id));
        }
        match self.composite.commit_transaction(self.id, &self.tables) {
            Ok(events) => {
                for event in &events {
                    for (table, callback) in self.callbacks.iter_mut() {
                        if table == &event.table {
                            callback(event);
                        }
                    }
                }
                self.state = TransactionState::Committed;
                self.finish();
                // Commit is the durability boundary; the changes stay
                // published even when flushing them fails.
                self.composite.set_check_point()
            }
            Err(e) if e.is_commit_conflict() => {
                self.composite.rollback_transaction(self.id, &self.tables);
                self.state = TransactionState::RolledBack;
                self.finish();
                Err(e)
            }
            Err(e) => {
                self.state = TransactionState::Committed;
                self.finish();
                Err(e)
            }
        }
    }

    /// Roll the transaction back, reclaiming every row it inserted.
    /// Idempotent: rolling back a closed transaction does nothing.
    pub fn rollback(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        self.composite.rollback_transaction(self.id, &self.tables);
        self.state = TransactionState::RolledBack;
        self.finish();
    }

    /// Release root locks and pending-change counters. Called exactly once
    /// when the transaction leaves the Active state.
    fn finish(&mut self) {
        for state in self.tables.values() {
            if state.dirty {
                state.source.remove_pending_changes();
            }
            state.source.remove_root_lock();
        }
        self.tables.clear();
        debug!(txn = self.id, state = ?self.state, "transaction finished");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            self.rollback();
        }
    }
}

/// A transaction's view of one table.
pub struct TableView<'a> {
    txn_id: u64,
    read_only: bool,
    state: &'a mut TxnTableState,
}

impl TableView<'_> {
    /// Schema of the underlying table.
    pub fn schema(&self) -> &TableSchema {
        self.state.source.schema()
    }

    /// An all-NULL row shaped for this table's schema.
    pub fn new_row(&self) -> Row {
        Row::new(vec![Value::Null; self.schema().column_count()])
    }

    /// Number of rows visible to this transaction.
    pub fn row_count(&self) -> usize {
        self.state.index_set.len()
    }

    /// Identifiers of all visible rows, ascending within snapshot and
    /// added parts.
    pub fn row_ids(&self) -> Vec<u64> {
        self.state.index_set.iter().collect()
    }

    /// Is this row visible to the transaction?
    pub fn contains_row(&self, row_id: u64) -> bool {
        self.state.index_set.contains(row_id)
    }

    /// Read a visible row.
    pub fn row(&self, row_id: u64) -> Result<Row> {
        if !self.state.index_set.contains(row_id) {
            return Err(Error::RowNotFound(row_id));
        }
        self.state.source.read_row(row_id)
    }

    /// Read one value of a visible row.
    pub fn value(&self, row_id: u64, column: usize) -> Result<Value> {
        let row = self.row(row_id)?;
        row.get(column)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("column index {} out of range", column)))
    }

    /// Insert a row, visible only to this transaction until commit.
    /// Returns the new row identifier.
    pub fn add_row(&mut self, row: Row) -> Result<u64> {
        self.check_writable()?;
        let expected = self.schema().column_count();
        if row.len() != expected {
            return Err(Error::ColumnCountMismatch {
                expected,
                found: row.len(),
            });
        }
        let row_id = self.state.source.insert_row(&row)?;
        self.mark_dirty();
        self.state.inserted.push(row_id);
        self.state.index_set.insert(row_id);
        Ok(row_id)
    }

    /// Remove a visible row from this transaction's view.
    pub fn remove_row(&mut self, row_id: u64) -> Result<()> {
        self.check_writable()?;
        if !self.state.index_set.contains(row_id) {
            return Err(Error::RowNotFound(row_id));
        }
        self.mark_dirty();
        self.state.index_set.remove(row_id);
        Ok(())
    }

    /// Replace a visible row: the old row is removed and the new values
    /// inserted under a fresh row identifier, which is returned.
    pub fn update_row(&mut self, row_id: u64, row: Row) -> Result<u64> {
        self.remove_row(row_id)?;
        self.add_row(row)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyTransaction(self.txn_id));
        }
        Ok(())
    }

    fn mark_dirty(&mut self) {
        if !self.state.dirty {
            self.state.source.add_pending_changes();
            self.state.dirty = true;
        }
    }
}
