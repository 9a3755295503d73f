//! MarrowDB - a transactional table storage engine in Rust
//!
//! MarrowDB is the storage core of a relational database: versioned table
//! storage with snapshot isolation, commit-time conflict detection,
//! deferred garbage collection of removed rows, and a page-level
//! write-ahead journal with crash recovery.
//!
//! # Architecture
//!
//! ```text
//!   Transaction / TableView          (snapshot + private deltas)
//!           |
//!   TableSourceComposite             (registry, commit protocol, GC)
//!           |
//!   TableSource + IndexSet           (row records, lifecycle states)
//!           |
//!   StoreSystem / Store              (named paged stores)
//!           |
//!   JournaledSystem / LoggingResource (write-ahead journal, recovery)
//!           |
//!   StoreData                        (memory or file bytes)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use marrowdb::{
//!     ColumnInfo, DataType, IsolationLevel, Row, TableSchema,
//!     TableSourceComposite, Value,
//! };
//! use marrowdb::store::system::{InMemoryStoreSystem, StoreSystem};
//! use std::sync::Arc;
//!
//! # fn main() -> marrowdb::Result<()> {
//! let system: Arc<dyn StoreSystem> = Arc::new(InMemoryStoreSystem::new(8192));
//! let db = TableSourceComposite::open(system)?;
//! db.create_table(TableSchema::new(
//!     "people",
//!     vec![
//!         ColumnInfo::new("id", DataType::Integer).nullable(false),
//!         ColumnInfo::new("name", DataType::String),
//!     ],
//! ))?;
//!
//! let mut txn = db.begin_transaction(IsolationLevel::Serializable);
//! let mut people = txn.table("people")?;
//! people.add_row(Row::new(vec![
//!     Value::Integer(1),
//!     Value::String("ada".into()),
//! ]))?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod journal;
pub mod store;
pub mod table;
pub mod transaction;

pub use config::EngineConfig;
pub use data::{ColumnInfo, DataType, Row, TableSchema, Value};
pub use error::{Error, Result};
pub use store::journaled::JournaledStoreSystem;
pub use store::system::{InMemoryStoreSystem, Store, StoreSystem};
pub use table::composite::{TableEvent, TableSourceComposite};
pub use table::source::{RecordState, TableSource};
pub use transaction::{IsolationLevel, TableView, Transaction, TransactionState};
