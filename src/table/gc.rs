//! Table source garbage collection
//!
//! Rows removed by a committed transaction stay on disk in the
//! CommittedRemoved state until no open transaction could still see them.
//! The collector tracks those rows and reclaims them in a later sweep,
//! deferring whenever a root lock or pending change indicates an open
//! transaction may still reference an old snapshot.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::table::source::{SourceInner, TableSource};

/// Deferred reclamation state for one table source.
pub struct TableSourceGC {
    deleted_rows: BTreeSet<u64>,
    full_sweep: bool,
}

impl TableSourceGC {
    pub fn new() -> Self {
        Self {
            deleted_rows: BTreeSet::new(),
            full_sweep: false,
        }
    }

    /// Mark a row for eventual physical removal. Marking the same row
    /// twice without an intervening collection is an accounting bug in the
    /// caller.
    pub fn delete_row(&mut self, row_id: u64) {
        if self.full_sweep {
            // The sweep will visit every slot anyway.
            return;
        }
        if !self.deleted_rows.insert(row_id) {
            panic!("row {} marked for deletion twice", row_id);
        }
    }

    /// Request that the next collection scan every slot instead of only
    /// the marked rows.
    pub fn request_full_sweep(&mut self) {
        self.full_sweep = true;
        self.deleted_rows.clear();
    }

    /// Rows currently marked for removal.
    pub fn pending_count(&self) -> usize {
        self.deleted_rows.len()
    }

    /// Run one collection cycle. When `force` is false the cycle is
    /// deferred while any transaction holds a root lock or pending changes
    /// on the table; `force` overrides that and is only safe when the
    /// caller knows no open transaction can see the removed rows.
    pub(crate) fn collect(&mut self, source: &TableSource, inner: &mut SourceInner, force: bool) {
        if inner.closed {
            return;
        }
        if !force && (inner.root_locks > 0 || inner.pending_changes > 0) {
            debug!(table = %source.name(), "garbage collection deferred");
            return;
        }

        let mut reclaimed = 0usize;
        if self.full_sweep {
            let range = TableSource::slot_range(inner);
            for row_id in 0..range as u64 {
                match source.hard_check_and_reclaim_row(inner, row_id) {
                    Ok(true) => reclaimed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(table = %source.name(), row_id, error = %e,
                            "error reclaiming row; sweep will be retried");
                        return;
                    }
                }
            }
            self.full_sweep = false;
            debug!(table = %source.name(), checked = range, reclaimed, "full sweep complete");
        } else {
            let marked = std::mem::take(&mut self.deleted_rows);
            let mut pending = marked.into_iter();
            while let Some(row_id) = pending.next() {
                if let Err(e) = source.hard_remove_row(inner, row_id) {
                    warn!(table = %source.name(), row_id, error = %e,
                        "error reclaiming row; re-marked for the next cycle");
                    // Put back the failed row and everything not yet swept.
                    self.deleted_rows.insert(row_id);
                    self.deleted_rows.extend(pending);
                    return;
                }
                reclaimed += 1;
            }
            debug!(table = %source.name(), reclaimed, "incremental sweep complete");
        }
    }
}

impl Default for TableSourceGC {
    fn default() -> Self {
        Self::new()
    }
}
