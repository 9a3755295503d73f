//! Append-only journal files
//!
//! A journal file holds a sequence of logged resource modifications. It is
//! named `NNNNNNNN.mjr` where `NNNNNNNN` is the zero-padded journal number.
//!
//! # File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (16 bytes): magic, version, number    │
//! ├──────────────────────────────────────────────┤
//! │ Record: [tag u8][crc32 u32][len u32][payload]│
//! ├──────────────────────────────────────────────┤
//! │ ...                                          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Page-write payload: `[name_len u16][name][page u64][offset u32][count
//! u32][data]`. Size-change payload: `[name_len u16][name][size u64]`.
//! Delete payload: `[name_len u16][name]`. The close marker has an empty
//! payload. All integers are little-endian. A CRC mismatch or truncated
//! record marks the end of the valid prefix during replay.
//!
//! A journal file carries a reference count: readers take a reference
//! before rebuilding pages outside the resource lock, and a file marked
//! deleted is only physically removed once its count drops to zero.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::error::{Error, Result};

/// Magic bytes identifying a journal file.
pub const JOURNAL_MAGIC: [u8; 4] = *b"MRWJ";

/// Current journal format version.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// Size of the journal file header in bytes.
pub const JOURNAL_HEADER_SIZE: u64 = 16;

const TAG_PAGE_WRITE: u8 = 1;
const TAG_SIZE_CHANGE: u8 = 2;
const TAG_DELETE: u8 = 3;
const TAG_CLOSE: u8 = 255;

/// A parsed journal record.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    /// A logged page write: `data` covers page bytes
    /// `[offset, offset + data.len())`.
    PageWrite {
        resource: String,
        page_number: u64,
        offset: u32,
        data: Vec<u8>,
    },
    /// A logged resource size change.
    SizeChange { resource: String, size: u64 },
    /// A logged resource delete.
    Delete { resource: String },
    /// Marker written when the journal file was closed cleanly.
    Close,
}

#[derive(Debug)]
struct FileState {
    file: Option<File>,
    write_pos: u64,
}

#[derive(Debug)]
struct RefState {
    count: usize,
    deleted: bool,
}

/// One append-only journal file with reference-counted lifetime.
pub struct JournalFile {
    journal_number: u64,
    path: PathBuf,
    state: Mutex<FileState>,
    refs: Mutex<RefState>,
}

impl JournalFile {
    /// File name for a journal number.
    pub fn file_name(journal_number: u64) -> String {
        format!("{:08}.mjr", journal_number)
    }

    /// Parse a journal number out of a file name, if it is one of ours.
    pub fn parse_file_name(name: &str) -> Option<u64> {
        let stem = name.strip_suffix(".mjr")?;
        if stem.len() != 8 {
            return None;
        }
        stem.parse().ok()
    }

    /// Create a fresh journal file in `dir` and write its header.
    pub fn create(dir: &Path, journal_number: u64) -> Result<Self> {
        let path = dir.join(Self::file_name(journal_number));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.write_all(&JOURNAL_MAGIC)?;
        file.write_u32::<LittleEndian>(JOURNAL_FORMAT_VERSION)?;
        file.write_u64::<LittleEndian>(journal_number)?;

        Ok(Self {
            journal_number,
            path,
            state: Mutex::new(FileState {
                file: Some(file),
                write_pos: JOURNAL_HEADER_SIZE,
            }),
            refs: Mutex::new(RefState {
                count: 0,
                deleted: false,
            }),
        })
    }

    /// Open an existing journal file (recovery path) and validate its
    /// header.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != JOURNAL_MAGIC {
            return Err(Error::JournalError(format!(
                "'{}' is not a journal file",
                path.display()
            )));
        }
        let version = file.read_u32::<LittleEndian>()?;
        if version != JOURNAL_FORMAT_VERSION {
            return Err(Error::JournalError(format!(
                "unsupported journal format version {}",
                version
            )));
        }
        let journal_number = file.read_u64::<LittleEndian>()?;
        let write_pos = file.metadata()?.len();

        Ok(Self {
            journal_number,
            path,
            state: Mutex::new(FileState {
                file: Some(file),
                write_pos,
            }),
            refs: Mutex::new(RefState {
                count: 0,
                deleted: false,
            }),
        })
    }

    /// The journal number of this file.
    pub fn journal_number(&self) -> u64 {
        self.journal_number
    }

    /// Path of the journal file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_record(&self, tag: u8, payload: &[u8]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let position = state.write_pos;
        let file = state.file.as_mut().ok_or_else(|| {
            Error::JournalError(format!(
                "journal {} is no longer writable",
                self.journal_number
            ))
        })?;

        let crc = crc32fast::hash(payload);
        file.seek(SeekFrom::Start(position))?;
        file.write_u8(tag)?;
        file.write_u32::<LittleEndian>(crc)?;
        file.write_u32::<LittleEndian>(payload.len() as u32)?;
        file.write_all(payload)?;

        state.write_pos = position + 9 + payload.len() as u64;
        Ok(position)
    }

    /// Append a page-write record; returns the record's byte position.
    pub fn log_page_write(
        &self,
        resource: &str,
        page_number: u64,
        buf: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<u64> {
        let mut payload = Vec::with_capacity(18 + resource.len() + count);
        payload.write_u16::<LittleEndian>(resource.len() as u16)?;
        payload.extend_from_slice(resource.as_bytes());
        payload.write_u64::<LittleEndian>(page_number)?;
        payload.write_u32::<LittleEndian>(offset as u32)?;
        payload.write_u32::<LittleEndian>(count as u32)?;
        payload.extend_from_slice(&buf[offset..offset + count]);
        self.append_record(TAG_PAGE_WRITE, &payload)
    }

    /// Append a size-change record.
    pub fn log_size_change(&self, resource: &str, size: u64) -> Result<u64> {
        let mut payload = Vec::with_capacity(10 + resource.len());
        payload.write_u16::<LittleEndian>(resource.len() as u16)?;
        payload.extend_from_slice(resource.as_bytes());
        payload.write_u64::<LittleEndian>(size)?;
        self.append_record(TAG_SIZE_CHANGE, &payload)
    }

    /// Append a resource-delete record.
    pub fn log_delete(&self, resource: &str) -> Result<u64> {
        let mut payload = Vec::with_capacity(2 + resource.len());
        payload.write_u16::<LittleEndian>(resource.len() as u16)?;
        payload.extend_from_slice(resource.as_bytes());
        self.append_record(TAG_DELETE, &payload)
    }

    /// Write the close marker and flush everything to disk.
    pub fn close(&self) -> Result<()> {
        self.append_record(TAG_CLOSE, &[])?;
        self.flush()
    }

    /// Flush buffered writes.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Overlay the page-write record at `position` onto `buf`, which holds
    /// the full page starting at `buf_offset`.
    pub fn build_page(
        &self,
        page_number: u64,
        position: u64,
        buf: &mut [u8],
        buf_offset: usize,
    ) -> Result<()> {
        let record = {
            let mut state = self.state.lock().unwrap();
            let file = state.file.as_mut().ok_or_else(|| {
                Error::JournalError(format!(
                    "journal {} is no longer readable",
                    self.journal_number
                ))
            })?;
            file.seek(SeekFrom::Start(position))?;
            read_record(file)?.ok_or(Error::CorruptedJournal(self.journal_number, position))?
        };

        match record {
            JournalRecord::PageWrite {
                page_number: page,
                offset,
                data,
                ..
            } => {
                if page != page_number {
                    return Err(Error::CorruptedJournal(self.journal_number, position));
                }
                let start = buf_offset + offset as usize;
                buf[start..start + data.len()].copy_from_slice(&data);
                Ok(())
            }
            _ => Err(Error::CorruptedJournal(self.journal_number, position)),
        }
    }

    /// Read every valid record in write order. Stops silently at a
    /// truncated or corrupt tail, which is what a crash mid-append leaves
    /// behind.
    pub fn read_records(&self) -> Result<Vec<JournalRecord>> {
        let mut state = self.state.lock().unwrap();
        let end = state.write_pos;
        let file = state.file.as_mut().ok_or_else(|| {
            Error::JournalError(format!(
                "journal {} is no longer readable",
                self.journal_number
            ))
        })?;

        let mut records = Vec::new();
        let mut pos = JOURNAL_HEADER_SIZE;
        file.seek(SeekFrom::Start(pos))?;
        while pos < end {
            match read_record(file) {
                Ok(Some(record)) => {
                    pos = file.stream_position()?;
                    records.push(record);
                }
                Ok(None) | Err(_) => {
                    warn!(
                        journal = self.journal_number,
                        position = pos,
                        "journal has a corrupt or truncated tail; stopping replay here"
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Take a reference, preventing physical removal of the file.
    pub fn reference(&self) {
        let mut refs = self.refs.lock().unwrap();
        refs.count += 1;
    }

    /// Drop a reference. When the file is marked deleted and the count
    /// reaches zero the file is physically removed.
    pub fn dereference(&self) {
        let mut refs = self.refs.lock().unwrap();
        assert!(refs.count > 0, "journal file reference count underflow");
        refs.count -= 1;
        if refs.count == 0 && refs.deleted {
            self.unlink();
        }
    }

    /// Current reference count.
    pub fn reference_count(&self) -> usize {
        self.refs.lock().unwrap().count
    }

    /// Has this file been marked deleted (checkpointed and retired)?
    pub fn is_deleted(&self) -> bool {
        self.refs.lock().unwrap().deleted
    }

    /// Mark the file deleted. Physical removal happens immediately when no
    /// references are held, otherwise on the last dereference.
    pub fn mark_deleted(&self) {
        let mut refs = self.refs.lock().unwrap();
        refs.deleted = true;
        if refs.count == 0 {
            self.unlink();
        }
    }

    fn unlink(&self) {
        let mut state = self.state.lock().unwrap();
        state.file.take();
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(
                journal = self.journal_number,
                error = %e,
                "failed to remove retired journal file"
            );
        }
    }
}

/// Read one record at the current file position. Returns `Ok(None)` on a
/// truncated or CRC-corrupt record.
fn read_record(file: &mut File) -> Result<Option<JournalRecord>> {
    let tag = match file.read_u8() {
        Ok(t) => t,
        Err(_) => return Ok(None),
    };
    let crc = match file.read_u32::<LittleEndian>() {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let len = match file.read_u32::<LittleEndian>() {
        Ok(v) => v as usize,
        Err(_) => return Ok(None),
    };
    let mut payload = vec![0u8; len];
    if file.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if crc32fast::hash(&payload) != crc {
        return Ok(None);
    }

    let mut cursor = &payload[..];
    let record = match tag {
        TAG_PAGE_WRITE => {
            let resource = read_name(&mut cursor)?;
            let page_number = cursor.read_u64::<LittleEndian>()?;
            let offset = cursor.read_u32::<LittleEndian>()?;
            let count = cursor.read_u32::<LittleEndian>()? as usize;
            if cursor.len() < count {
                return Ok(None);
            }
            JournalRecord::PageWrite {
                resource,
                page_number,
                offset,
                data: cursor[..count].to_vec(),
            }
        }
        TAG_SIZE_CHANGE => {
            let resource = read_name(&mut cursor)?;
            let size = cursor.read_u64::<LittleEndian>()?;
            JournalRecord::SizeChange { resource, size }
        }
        TAG_DELETE => {
            let resource = read_name(&mut cursor)?;
            JournalRecord::Delete { resource }
        }
        TAG_CLOSE => JournalRecord::Close,
        _ => return Ok(None),
    };
    Ok(Some(record))
}

fn read_name(cursor: &mut &[u8]) -> Result<String> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    if cursor.len() < len {
        return Err(Error::JournalError("truncated resource name".to_string()));
    }
    let name = String::from_utf8(cursor[..len].to_vec())
        .map_err(|_| Error::JournalError("invalid resource name".to_string()))?;
    *cursor = &cursor[len..];
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalFile::create(dir.path(), 1).unwrap();

        let page = vec![7u8; 64];
        journal.log_page_write("t1", 3, &page, 16, 8).unwrap();
        journal.log_size_change("t1", 4096).unwrap();
        journal.log_delete("t2").unwrap();
        journal.close().unwrap();

        let records = journal.read_records().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0],
            JournalRecord::PageWrite {
                resource: "t1".to_string(),
                page_number: 3,
                offset: 16,
                data: vec![7u8; 8],
            }
        );
        assert_eq!(
            records[1],
            JournalRecord::SizeChange {
                resource: "t1".to_string(),
                size: 4096
            }
        );
        assert_eq!(
            records[2],
            JournalRecord::Delete {
                resource: "t2".to_string()
            }
        );
        assert_eq!(records[3], JournalRecord::Close);
    }

    #[test]
    fn test_build_page_overlays_byte_range() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalFile::create(dir.path(), 1).unwrap();

        let mut write_buf = vec![0u8; 32];
        write_buf[4..8].copy_from_slice(&[9, 9, 9, 9]);
        let pos = journal.log_page_write("t1", 0, &write_buf, 4, 4).unwrap();

        let mut page = vec![1u8; 32];
        journal.build_page(0, pos, &mut page, 0).unwrap();
        assert_eq!(&page[..4], &[1, 1, 1, 1]);
        assert_eq!(&page[4..8], &[9, 9, 9, 9]);
        assert_eq!(&page[8..], &vec![1u8; 24][..]);
    }

    #[test]
    fn test_truncated_tail_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let journal = JournalFile::create(dir.path(), 1).unwrap();
            let page = vec![1u8; 16];
            journal.log_page_write("t1", 0, &page, 0, 16).unwrap();
            journal.log_page_write("t1", 1, &page, 0, 16).unwrap();
            journal.flush().unwrap();
            journal.path().to_path_buf()
        };

        // Chop the second record in half, as a crash mid-append would.
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();
        drop(file);

        let journal = JournalFile::open(&path).unwrap();
        let records = journal.read_records().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_reference_counting_gates_removal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalFile::create(dir.path(), 1).unwrap();
        let path = journal.path().to_path_buf();

        journal.reference();
        journal.mark_deleted();
        // Still referenced, so the file must remain on disk.
        assert!(path.exists());
        assert_eq!(journal.reference_count(), 1);

        journal.dereference();
        assert!(!path.exists());
        assert_eq!(journal.reference_count(), 0);
    }

    #[test]
    fn test_referenced_file_stays_readable_after_mark_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalFile::create(dir.path(), 1).unwrap();
        let path = journal.path().to_path_buf();

        let mut page = vec![0u8; 32];
        page[0..4].copy_from_slice(&[5, 5, 5, 5]);
        let pos = journal.log_page_write("t1", 0, &page, 0, 4).unwrap();

        // A reader that referenced the file before a checkpoint retired it
        // must still be able to rebuild its pages.
        journal.reference();
        journal.mark_deleted();
        let mut buf = vec![0u8; 32];
        journal.build_page(0, pos, &mut buf, 0).unwrap();
        assert_eq!(&buf[0..4], &[5, 5, 5, 5]);

        journal.dereference();
        assert!(!path.exists());
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_dereference_underflow_panics() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalFile::create(dir.path(), 1).unwrap();
        journal.dereference();
    }
}
