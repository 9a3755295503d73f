//! Journaled resource layer
//!
//! Gives every store resource write-ahead durability without rewriting the
//! backing file on each write. Page writes are appended to an append-only
//! journal file; reads overlay the journaled entries for a page, oldest to
//! newest, on top of the backing data. Checkpointing persists a journal
//! file into the backing stores and retires it; recovery replays every
//! journal file still on disk, in write order.

pub mod entry;
pub mod file;
pub mod resource;
pub mod system;

pub use entry::JournalEntry;
pub use file::{JournalFile, JournalRecord};
pub use resource::LoggingResource;
pub use system::JournaledSystem;
