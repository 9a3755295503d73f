//! Journal entries
//!
//! A `JournalEntry` points at one logged page write inside a journal file.
//! The entries for a page are kept by the owning resource in commit order,
//! oldest first, so reconstruction applies them newest-last.

use std::sync::Arc;

use crate::journal::file::JournalFile;

/// Reference to a single logged page write.
#[derive(Clone)]
pub struct JournalEntry {
    file: Arc<JournalFile>,
    page_number: u64,
    position: u64,
}

impl JournalEntry {
    pub fn new(file: Arc<JournalFile>, page_number: u64, position: u64) -> Self {
        Self {
            file,
            page_number,
            position,
        }
    }

    /// The journal file holding the record.
    pub fn file(&self) -> &Arc<JournalFile> {
        &self.file
    }

    /// The page this entry modifies.
    pub fn page_number(&self) -> u64 {
        self.page_number
    }

    /// Byte position of the record inside the journal file.
    pub fn position(&self) -> u64 {
        self.position
    }
}
