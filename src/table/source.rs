//! Table sources
//!
//! A `TableSource` is the single shared physical representation of one
//! table's rows: an append-mostly row store written through a journaled
//! store resource, with a lifecycle state per row. Transactions never
//! mutate it directly; the composite's commit-apply step and the GC sweep
//! are the only writers of shared state, both under the source's lock.
//!
//! # Row record layout
//!
//! The store begins with a header (`magic u32`, `schema_len u32`, schema
//! JSON), followed by row records `[len u32][state u8][row_id u64]
//! [payload]`, appended in write order. The state byte is updated in place
//! as the row advances; the slot directory is rebuilt by a sequential scan
//! when the table is opened.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::data::{Row, TableSchema};
use crate::error::{Error, Result};
use crate::store::system::Store;
use crate::table::gc::TableSourceGC;

const TABLE_MAGIC: u32 = 0x4d52_5754; // "MRWT"
const HEADER_BASE: u64 = 8;
const RECORD_HEADER: u64 = 13;

/// Lifecycle state of one physical row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordState {
    /// Written by a transaction that has not committed yet.
    Uncommitted = 0,
    /// Visible in the committed index set.
    CommittedAdded = 1,
    /// Removed by a committed transaction; awaiting reclamation.
    CommittedRemoved = 2,
    /// Physically reclaimed; the slot is reusable.
    Deleted = 3,
}

impl RecordState {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RecordState::Uncommitted),
            1 => Some(RecordState::CommittedAdded),
            2 => Some(RecordState::CommittedRemoved),
            3 => Some(RecordState::Deleted),
            _ => None,
        }
    }

    /// A row's state only ever advances through the lifecycle.
    pub fn can_advance_to(self, next: RecordState) -> bool {
        matches!(
            (self, next),
            (RecordState::Uncommitted, RecordState::CommittedAdded)
                | (RecordState::Uncommitted, RecordState::Deleted)
                | (RecordState::CommittedAdded, RecordState::CommittedRemoved)
                | (RecordState::CommittedRemoved, RecordState::Deleted)
        )
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RowSlot {
    position: u64,
    length: u32,
    state: RecordState,
}

pub(crate) struct SourceInner {
    pub(crate) closed: bool,
    slots: Vec<Option<RowSlot>>,
    append_pos: u64,
    pub(crate) committed_rows: Arc<BTreeSet<u64>>,
    pub(crate) commit_version: u64,
    pub(crate) row_versions: HashMap<u64, u64>,
    pub(crate) root_locks: usize,
    pub(crate) pending_changes: usize,
}

/// Shared, versioned physical storage for one table.
pub struct TableSource {
    name: String,
    schema: TableSchema,
    store: Store,
    pub(crate) inner: Mutex<SourceInner>,
    pub(crate) gc: Mutex<TableSourceGC>,
}

impl TableSource {
    /// Create a new table source, writing the schema header to its store.
    pub fn create(name: impl Into<String>, schema: TableSchema, store: Store) -> Result<Self> {
        let name = name.into();
        let schema_bytes = serde_json::to_vec(&schema)
            .map_err(|e| Error::Internal(format!("cannot encode schema: {}", e)))?;
        let mut header = Vec::with_capacity(HEADER_BASE as usize + schema_bytes.len());
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, TABLE_MAGIC);
        header.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, schema_bytes.len() as u32);
        header.extend_from_slice(&word);
        header.extend_from_slice(&schema_bytes);
        store.write_bytes(0, &header)?;

        Ok(Self {
            name,
            schema,
            store,
            inner: Mutex::new(SourceInner {
                closed: false,
                slots: Vec::new(),
                append_pos: HEADER_BASE + schema_bytes.len() as u64,
                committed_rows: Arc::new(BTreeSet::new()),
                commit_version: 0,
                row_versions: HashMap::new(),
                root_locks: 0,
                pending_changes: 0,
            }),
            gc: Mutex::new(TableSourceGC::new()),
        })
    }

    /// Open an existing table source, rebuilding the slot directory by a
    /// sequential scan. Rows left Uncommitted by a crashed transaction are
    /// reclaimed; CommittedRemoved rows are left for a full GC sweep.
    pub fn open(store: Store) -> Result<Self> {
        let mut word = [0u8; 8];
        store.read_bytes(0, &mut word)?;
        if LittleEndian::read_u32(&word[0..4]) != TABLE_MAGIC {
            return Err(Error::Internal(
                "store does not contain a table source".to_string(),
            ));
        }
        let schema_len = LittleEndian::read_u32(&word[4..8]) as u64;
        let mut schema_bytes = vec![0u8; schema_len as usize];
        store.read_bytes(HEADER_BASE, &mut schema_bytes)?;
        let schema: TableSchema = serde_json::from_slice(&schema_bytes)
            .map_err(|e| Error::Internal(format!("cannot decode schema: {}", e)))?;
        let name = schema.name().to_string();

        // Scan the row records.
        let mut by_id: HashMap<u64, RowSlot> = HashMap::new();
        let mut reclaim = Vec::new();
        let mut pos = HEADER_BASE + schema_len;
        let size = store.size();
        let mut header = [0u8; RECORD_HEADER as usize];
        while pos + RECORD_HEADER <= size {
            store.read_bytes(pos, &mut header)?;
            let length = LittleEndian::read_u32(&header[0..4]);
            if length == 0 {
                break;
            }
            let state = RecordState::from_u8(header[4])
                .ok_or_else(|| Error::Internal(format!("invalid record state at {}", pos)))?;
            let row_id = LittleEndian::read_u64(&header[5..13]);

            match state {
                RecordState::Uncommitted => reclaim.push(pos),
                RecordState::Deleted => {
                    by_id.remove(&row_id);
                }
                _ => {
                    by_id.insert(
                        row_id,
                        RowSlot {
                            position: pos,
                            length,
                            state,
                        },
                    );
                }
            }
            pos += RECORD_HEADER + length as u64;
        }

        // A crashed transaction's rows were never visible; reclaim them.
        for record_pos in reclaim {
            store.write_bytes(record_pos + 4, &[RecordState::Deleted as u8])?;
        }

        let slot_count = by_id.keys().max().map(|m| m + 1).unwrap_or(0) as usize;
        let mut slots: Vec<Option<RowSlot>> = vec![None; slot_count];
        let mut committed = BTreeSet::new();
        let mut has_removed = false;
        for (row_id, slot) in by_id {
            if slot.state == RecordState::CommittedAdded {
                committed.insert(row_id);
            } else {
                has_removed = true;
            }
            slots[row_id as usize] = Some(slot);
        }

        let mut gc = TableSourceGC::new();
        if has_removed {
            gc.request_full_sweep();
        }

        Ok(Self {
            name,
            schema,
            store,
            inner: Mutex::new(SourceInner {
                closed: false,
                slots,
                append_pos: pos,
                committed_rows: Arc::new(committed),
                commit_version: 0,
                row_versions: HashMap::new(),
                root_locks: 0,
                pending_changes: 0,
            }),
            gc: Mutex::new(gc),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, SourceInner> {
        self.inner.lock().unwrap()
    }

    /// Append a new physical row in the Uncommitted state. Called by a
    /// transaction's table view; the row is invisible to everyone else
    /// until the transaction commits.
    pub(crate) fn insert_row(&self, row: &Row) -> Result<u64> {
        let payload = row.to_bytes()?;
        let mut inner = self.lock_inner();

        let row_id = match inner.slots.iter().position(|s| s.is_none()) {
            Some(free) => free as u64,
            None => {
                inner.slots.push(None);
                (inner.slots.len() - 1) as u64
            }
        };

        let position = inner.append_pos;
        let mut record = Vec::with_capacity(RECORD_HEADER as usize + payload.len());
        let mut word = [0u8; 8];
        LittleEndian::write_u32(&mut word[0..4], payload.len() as u32);
        record.extend_from_slice(&word[0..4]);
        record.push(RecordState::Uncommitted as u8);
        LittleEndian::write_u64(&mut word, row_id);
        record.extend_from_slice(&word);
        record.extend_from_slice(&payload);
        self.store.write_bytes(position, &record)?;

        inner.slots[row_id as usize] = Some(RowSlot {
            position,
            length: payload.len() as u32,
            state: RecordState::Uncommitted,
        });
        inner.append_pos = position + RECORD_HEADER + payload.len() as u64;
        Ok(row_id)
    }

    /// Read the row payload for any non-reclaimed row.
    pub(crate) fn read_row(&self, row_id: u64) -> Result<Row> {
        let inner = self.lock_inner();
        let slot = inner
            .slots
            .get(row_id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::RowNotFound(row_id))?;
        let mut payload = vec![0u8; slot.length as usize];
        self.store
            .read_bytes(slot.position + RECORD_HEADER, &mut payload)?;
        Row::from_bytes(&payload)
    }

    /// Current state of a physical row.
    pub fn row_state(&self, row_id: u64) -> Result<RecordState> {
        let inner = self.lock_inner();
        inner
            .slots
            .get(row_id as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state)
            .ok_or(Error::RowNotFound(row_id))
    }

    /// Number of physical (non-reclaimed) row slots, regardless of
    /// visibility.
    pub fn raw_row_count(&self) -> usize {
        self.lock_inner().slots.iter().flatten().count()
    }

    /// The current committed index set.
    pub fn committed_rows(&self) -> Arc<BTreeSet<u64>> {
        self.lock_inner().committed_rows.clone()
    }

    /// Is some open transaction still able to see a pre-commit version of
    /// this table's rows?
    pub fn is_root_locked(&self) -> bool {
        self.lock_inner().root_locks > 0
    }

    pub(crate) fn add_root_lock(&self) {
        self.lock_inner().root_locks += 1;
    }

    pub(crate) fn remove_root_lock(&self) {
        let mut inner = self.lock_inner();
        assert!(inner.root_locks > 0, "root lock count underflow");
        inner.root_locks -= 1;
    }

    /// Does some open transaction hold uncommitted changes to this table?
    pub fn has_changes_pending(&self) -> bool {
        self.lock_inner().pending_changes > 0
    }

    pub(crate) fn add_pending_changes(&self) {
        self.lock_inner().pending_changes += 1;
    }

    pub(crate) fn remove_pending_changes(&self) {
        let mut inner = self.lock_inner();
        assert!(inner.pending_changes > 0, "pending change count underflow");
        inner.pending_changes -= 1;
    }

    /// Is this table source closed (dropped)?
    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    pub(crate) fn close(&self) {
        self.lock_inner().closed = true;
    }

    /// Run a garbage collection cycle over this table source.
    pub fn collect(&self, force: bool) {
        let mut inner = self.lock_inner();
        let mut gc = self.gc.lock().unwrap();
        gc.collect(self, &mut inner, force);
    }

    // ---- state transitions; callers hold the inner lock ----

    fn write_state(&self, slot: &mut RowSlot, next: RecordState) -> Result<()> {
        assert!(
            slot.state.can_advance_to(next),
            "illegal record state transition {:?} -> {:?}",
            slot.state,
            next
        );
        self.store
            .write_bytes(slot.position + 4, &[next as u8])?;
        slot.state = next;
        Ok(())
    }

    fn slot_mut<'a>(
        &self,
        inner: &'a mut SourceInner,
        row_id: u64,
    ) -> Result<&'a mut RowSlot> {
        inner
            .slots
            .get_mut(row_id as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::RowNotFound(row_id))
    }

    /// Advance a row state for commit publication. The in-memory state
    /// always advances; a failed store write is returned so the caller can
    /// surface the durability loss once the commit is fully published.
    fn publish_state(
        &self,
        inner: &mut SourceInner,
        row_id: u64,
        next: RecordState,
        version: u64,
    ) -> Result<()> {
        let slot = self.slot_mut(inner, row_id)?;
        assert!(
            slot.state.can_advance_to(next),
            "illegal record state transition {:?} -> {:?}",
            slot.state,
            next
        );
        slot.state = next;
        let position = slot.position;
        inner.row_versions.insert(row_id, version);
        self.store.write_bytes(position + 4, &[next as u8])
    }

    /// Commit an inserted row: Uncommitted -> CommittedAdded.
    pub(crate) fn commit_row_add(
        &self,
        inner: &mut SourceInner,
        row_id: u64,
        version: u64,
    ) -> Result<()> {
        self.publish_state(inner, row_id, RecordState::CommittedAdded, version)
    }

    /// Commit a removed row: CommittedAdded -> CommittedRemoved.
    pub(crate) fn commit_row_remove(
        &self,
        inner: &mut SourceInner,
        row_id: u64,
        version: u64,
    ) -> Result<()> {
        self.publish_state(inner, row_id, RecordState::CommittedRemoved, version)
    }

    /// Reclaim a row its own transaction made unreachable: either rolled
    /// back, or inserted and removed again before the commit. The slot is
    /// freed in memory even when the store write fails; a record whose
    /// state byte never landed is dropped by the open-time scan anyway.
    pub(crate) fn reclaim_uncommitted(&self, inner: &mut SourceInner, row_id: u64) -> Result<()> {
        let slot = self.slot_mut(inner, row_id)?;
        assert!(
            slot.state.can_advance_to(RecordState::Deleted),
            "illegal record state transition {:?} -> Deleted",
            slot.state
        );
        let position = slot.position;
        inner.slots[row_id as usize] = None;
        self.store
            .write_bytes(position + 4, &[RecordState::Deleted as u8])
    }

    /// Physically reclaim a CommittedRemoved row. GC only.
    pub(crate) fn hard_remove_row(&self, inner: &mut SourceInner, row_id: u64) -> Result<()> {
        let slot = self.slot_mut(inner, row_id)?;
        self.write_state(slot, RecordState::Deleted)?;
        inner.slots[row_id as usize] = None;
        inner.row_versions.remove(&row_id);
        Ok(())
    }

    /// Reclaim the row slot if it holds an unreferenced CommittedRemoved
    /// row. Returns true when the slot was reclaimed. GC full sweeps only.
    pub(crate) fn hard_check_and_reclaim_row(
        &self,
        inner: &mut SourceInner,
        row_id: u64,
    ) -> Result<bool> {
        let state = match inner.slots.get(row_id as usize).and_then(|s| s.as_ref()) {
            Some(slot) => slot.state,
            None => return Ok(false),
        };
        if state != RecordState::CommittedRemoved || inner.committed_rows.contains(&row_id) {
            return Ok(false);
        }
        self.hard_remove_row(inner, row_id)?;
        Ok(true)
    }

    /// Install a transaction's index set as the new committed snapshot.
    pub(crate) fn install_committed(
        &self,
        inner: &mut SourceInner,
        committed: Arc<BTreeSet<u64>>,
        version: u64,
    ) {
        debug!(
            table = %self.name,
            version,
            rows = committed.len(),
            "installing committed index set"
        );
        inner.committed_rows = committed;
        inner.commit_version = version;
    }

    /// Number of slots (including reclaimed ones); GC sweeps iterate this
    /// range.
    pub(crate) fn slot_range(inner: &SourceInner) -> usize {
        inner.slots.len()
    }

    /// State of a row slot, for callers already holding the inner lock.
    pub(crate) fn slot_state(inner: &SourceInner, row_id: u64) -> Option<RecordState> {
        inner
            .slots
            .get(row_id as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PAGE_SIZE;
    use crate::data::{ColumnInfo, DataType, Value};
    use crate::store::system::{InMemoryStoreSystem, StoreSystem};

    fn test_schema() -> TableSchema {
        TableSchema::new(
            "people",
            vec![
                ColumnInfo::new("id", DataType::Integer).nullable(false),
                ColumnInfo::new("name", DataType::String),
            ],
        )
    }

    fn test_source() -> (InMemoryStoreSystem, TableSource) {
        let sys = InMemoryStoreSystem::new(DEFAULT_PAGE_SIZE);
        let store = sys.create_store("tbl_people").unwrap();
        let source = TableSource::create("people", test_schema(), store).unwrap();
        (sys, source)
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new(vec![Value::Integer(id), Value::String(name.to_string())])
    }

    #[test]
    fn test_insert_starts_uncommitted() {
        let (_sys, source) = test_source();
        let r = source.insert_row(&row(1, "alice")).unwrap();
        assert_eq!(source.row_state(r).unwrap(), RecordState::Uncommitted);
        assert_eq!(source.read_row(r).unwrap(), row(1, "alice"));
        assert_eq!(source.raw_row_count(), 1);
        // Not visible until committed.
        assert!(!source.committed_rows().contains(&r));
    }

    #[test]
    fn test_state_advances_through_lifecycle() {
        let (_sys, source) = test_source();
        let r = source.insert_row(&row(1, "alice")).unwrap();
        {
            let mut inner = source.lock_inner();
            source.commit_row_add(&mut inner, r, 1).unwrap();
        }
        assert_eq!(source.row_state(r).unwrap(), RecordState::CommittedAdded);
        {
            let mut inner = source.lock_inner();
            source.commit_row_remove(&mut inner, r, 2).unwrap();
        }
        assert_eq!(source.row_state(r).unwrap(), RecordState::CommittedRemoved);
        {
            let mut inner = source.lock_inner();
            source.hard_remove_row(&mut inner, r).unwrap();
        }
        assert!(matches!(source.row_state(r), Err(Error::RowNotFound(_))));
        assert_eq!(source.raw_row_count(), 0);
    }

    #[test]
    #[should_panic(expected = "illegal record state transition")]
    fn test_state_never_regresses() {
        let (_sys, source) = test_source();
        let r = source.insert_row(&row(1, "alice")).unwrap();
        let mut inner = source.lock_inner();
        source.commit_row_add(&mut inner, r, 1).unwrap();
        // CommittedAdded -> CommittedAdded is not a legal advance.
        source.commit_row_add(&mut inner, r, 2).unwrap();
    }

    #[test]
    fn test_deleted_slot_is_reused() {
        let (_sys, source) = test_source();
        let r0 = source.insert_row(&row(1, "a")).unwrap();
        let _r1 = source.insert_row(&row(2, "b")).unwrap();
        {
            let mut inner = source.lock_inner();
            source.commit_row_add(&mut inner, r0, 1).unwrap();
            source.commit_row_remove(&mut inner, r0, 2).unwrap();
            source.hard_remove_row(&mut inner, r0).unwrap();
        }
        let r2 = source.insert_row(&row(3, "c")).unwrap();
        assert_eq!(r2, r0);
        assert_eq!(source.read_row(r2).unwrap(), row(3, "c"));
    }

    #[test]
    fn test_reopen_rebuilds_slots_and_reclaims_uncommitted() {
        let sys = InMemoryStoreSystem::new(DEFAULT_PAGE_SIZE);
        let store = sys.create_store("tbl_people").unwrap();
        let source = TableSource::create("people", test_schema(), store).unwrap();

        let committed = source.insert_row(&row(1, "alice")).unwrap();
        let dangling = source.insert_row(&row(2, "bob")).unwrap();
        {
            let mut inner = source.lock_inner();
            source.commit_row_add(&mut inner, committed, 1).unwrap();
            let set: BTreeSet<u64> = [committed].into_iter().collect();
            source.install_committed(&mut inner, Arc::new(set), 1);
        }
        drop(source);

        let store = sys.open_store("tbl_people").unwrap();
        let reopened = TableSource::open(store).unwrap();
        assert_eq!(reopened.name(), "people");
        assert_eq!(reopened.schema(), &test_schema());
        assert_eq!(
            reopened.row_state(committed).unwrap(),
            RecordState::CommittedAdded
        );
        assert!(reopened.committed_rows().contains(&committed));
        // The uncommitted row from the "crashed" session is gone.
        assert!(matches!(
            reopened.row_state(dangling),
            Err(Error::RowNotFound(_))
        ));
    }
}
