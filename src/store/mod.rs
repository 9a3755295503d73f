//! Store system
//!
//! This module abstracts the named, byte-addressable persistent resources
//! the engine stores itself in:
//! - `StoreData`: a raw byte container (in-memory or file backed)
//! - `Resource`: page-granular access over one container
//! - `Store`: the handle the table layer reads and writes rows through
//! - `StoreSystem`: create/open/delete/lock of named stores

pub mod data;
pub mod journaled;
pub mod system;

pub use data::{FileStoreData, MemoryStoreData, StoreData};
pub use journaled::JournaledStoreSystem;
pub use system::{DirectResource, InMemoryStoreSystem, Resource, Store, StoreSystem};
