//! Index sets
//!
//! An `IndexSet` is the set of row identifiers a transaction can see in
//! one table: the committed snapshot captured when the transaction began,
//! shared immutably between transactions, plus the transaction's own added
//! and removed rows. Only commit turns the deltas into a new shared
//! snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

/// Copy-on-write view of the visible row identifiers of one table.
#[derive(Debug, Clone)]
pub struct IndexSet {
    base: Arc<BTreeSet<u64>>,
    added: BTreeSet<u64>,
    removed: BTreeSet<u64>,
}

impl IndexSet {
    /// Create a view over a committed snapshot with no private changes.
    pub fn from_snapshot(base: Arc<BTreeSet<u64>>) -> Self {
        Self {
            base,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Is this row visible through the view?
    pub fn contains(&self, row: u64) -> bool {
        if self.removed.contains(&row) {
            return false;
        }
        self.added.contains(&row) || self.base.contains(&row)
    }

    /// Add a row to the private view.
    pub fn insert(&mut self, row: u64) {
        self.removed.remove(&row);
        if !self.base.contains(&row) {
            self.added.insert(row);
        }
    }

    /// Remove a row from the private view.
    pub fn remove(&mut self, row: u64) {
        if self.added.remove(&row) {
            return;
        }
        if self.base.contains(&row) {
            self.removed.insert(row);
        }
    }

    /// All visible rows, ascending.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.base
            .iter()
            .filter(move |row| !self.removed.contains(row))
            .chain(self.added.iter())
            .copied()
    }

    /// Number of visible rows.
    pub fn len(&self) -> usize {
        self.base.len() - self.removed.len() + self.added.len()
    }

    /// Is the view empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows added by this transaction.
    pub fn added(&self) -> &BTreeSet<u64> {
        &self.added
    }

    /// Rows removed by this transaction that were committed in the
    /// snapshot.
    pub fn removed(&self) -> &BTreeSet<u64> {
        &self.removed
    }

    /// Does the view carry any private changes?
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Apply this view's private deltas to `current`, the latest committed
    /// snapshot, producing the next committed set. `current` may be newer
    /// than the snapshot the view was created from; rows committed by
    /// transactions that overlapped this one are preserved.
    pub fn merge_into(&self, current: &Arc<BTreeSet<u64>>) -> Arc<BTreeSet<u64>> {
        if !self.has_changes() {
            return current.clone();
        }
        let mut next: BTreeSet<u64> = current
            .iter()
            .filter(|row| !self.removed.contains(row))
            .copied()
            .collect();
        next.extend(self.added.iter().copied());
        Arc::new(next)
    }
}
