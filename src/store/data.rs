//! Byte-addressable store backends
//!
//! `StoreData` is the lowest-level contract in the engine: a named container
//! of bytes that can be created, opened, grown, and deleted. Everything else
//! (journaling, tables) is layered above it.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// A raw byte container backing one named resource.
///
/// All methods take `&self`; implementations guard their state internally so
/// that a container can be shared behind an `Arc`.
pub trait StoreData: Send + Sync {
    /// Does the backing data physically exist?
    fn exists(&self) -> bool;

    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Open the container. Creates it when missing unless read-only.
    fn open(&self, read_only: bool) -> Result<()>;

    /// Close the container, flushing buffered writes.
    fn close(&self) -> Result<()>;

    /// Physically delete the backing data.
    fn delete(&self) -> Result<()>;

    /// Read up to `buf.len()` bytes at `pos`. Returns the number of bytes
    /// read; a short read means the container ends inside `buf`.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at `pos`, growing the container as needed.
    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()>;

    /// Grow the container to `len` bytes. Never shrinks.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flush buffered writes to the backing medium.
    fn flush(&self) -> Result<()>;
}

/// Heap-backed store data, used by the in-memory store system and tests.
#[derive(Debug, Default)]
pub struct MemoryStoreData {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    bytes: Vec<u8>,
    exists: bool,
    open: bool,
}

impl MemoryStoreData {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreData for MemoryStoreData {
    fn exists(&self) -> bool {
        self.inner.lock().unwrap().exists
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().bytes.len() as u64)
    }

    fn open(&self, _read_only: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.exists = true;
        inner.open = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.inner.lock().unwrap().open = false;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes.clear();
        inner.exists = false;
        inner.open = false;
        Ok(())
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        let pos = pos as usize;
        if pos >= inner.bytes.len() {
            return Ok(0);
        }
        let count = buf.len().min(inner.bytes.len() - pos);
        buf[..count].copy_from_slice(&inner.bytes[pos..pos + count]);
        Ok(count)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let end = pos as usize + buf.len();
        if inner.bytes.len() < end {
            inner.bytes.resize(end, 0);
        }
        inner.bytes[pos as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if (inner.bytes.len() as u64) < len {
            inner.bytes.resize(len as usize, 0);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed store data: one file per resource.
#[derive(Debug)]
pub struct FileStoreData {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileStoreData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut guard = self.file.lock().unwrap();
        match guard.as_mut() {
            Some(file) => f(file),
            None => Err(Error::Internal(format!(
                "store data '{}' is not open",
                self.path.display()
            ))),
        }
    }
}

impl StoreData for FileStoreData {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn len(&self) -> Result<u64> {
        let guard = self.file.lock().unwrap();
        match guard.as_ref() {
            Some(file) => Ok(file.metadata()?.len()),
            None => Ok(fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)),
        }
    }

    fn open(&self, read_only: bool) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&self.path)?;
        *guard = Some(file);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        {
            let mut guard = self.file.lock().unwrap();
            guard.take();
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_file(|file| {
            let len = file.metadata()?.len();
            if pos >= len {
                return Ok(0);
            }
            file.seek(SeekFrom::Start(pos))?;
            let count = buf.len().min((len - pos) as usize);
            file.read_exact(&mut buf[..count])?;
            Ok(count)
        })
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(buf)?;
            Ok(())
        })
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.with_file(|file| {
            if file.metadata()?.len() < len {
                file.set_len(len)?;
            }
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        self.with_file(|file| {
            file.sync_data()?;
            Ok(())
        })
    }
}
