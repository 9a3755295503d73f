//! Versioned table storage
//!
//! - `TableSource`: the shared physical row store for one table, with a
//!   lifecycle state per row
//! - `IndexSet`: the set of row ids one transaction sees, as a committed
//!   snapshot plus private deltas
//! - `TableSourceGC`: deferred reclamation of physically deleted rows
//! - `TableSourceComposite`: the registry of all table sources, snapshot
//!   creation, and the commit/rollback protocol

pub mod composite;
pub mod gc;
pub mod index_set;
pub mod source;

pub use composite::TableSourceComposite;
pub use gc::TableSourceGC;
pub use index_set::IndexSet;
pub use source::{RecordState, TableSource};
