//! Transactions
//!
//! A transaction is an isolated snapshot of the whole database: it reads
//! the committed index sets captured when it began and buffers its own
//! row additions and removals until commit. See [`Transaction`].

mod transaction;

pub use transaction::{
    IsolationLevel, TableView, Transaction, TransactionState,
};
pub(crate) use transaction::TxnTableState;
