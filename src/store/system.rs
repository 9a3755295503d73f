//! Store system contract and the in-memory backend
//!
//! A `StoreSystem` creates and manages the named stores the engine
//! represents itself in. One implementation keeps everything on the heap
//! (tests, scratch databases); the journaled implementation in
//! [`crate::store::journaled`] keeps one file per store behind the
//! write-ahead journal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::store::data::{MemoryStoreData, StoreData};

/// Page-granular access to one named resource.
///
/// `write_page` writes `buf[offset..offset + count]` into the same byte
/// range of the page; `read_page` fills `buf[offset..offset + page_size]`
/// with the whole page, zero-filled where no backing data exists.
pub trait Resource: Send + Sync {
    /// Name of the resource within its store system.
    fn name(&self) -> &str;

    /// Page size this resource was created with.
    fn page_size(&self) -> usize;

    /// Logical size of the resource in bytes.
    fn size(&self) -> u64;

    /// Does the resource logically exist?
    fn exists(&self) -> bool;

    /// Open the resource for reading and (unless `read_only`) writing.
    fn open(&self, read_only: bool) -> Result<()>;

    /// Close the resource.
    fn close(&self) -> Result<()>;

    /// Logically delete the resource.
    fn delete(&self) -> Result<()>;

    /// Read the full page `page_number` into `buf[offset..]`.
    fn read_page(&self, page_number: u64, buf: &mut [u8], offset: usize) -> Result<()>;

    /// Write `count` bytes of `buf` starting at `offset` into the same
    /// range of page `page_number`.
    fn write_page(&self, page_number: u64, buf: &[u8], offset: usize, count: usize) -> Result<()>;

    /// Set the logical size of the resource.
    fn set_size(&self, size: u64) -> Result<()>;
}

/// A resource that passes page operations straight through to its backing
/// `StoreData`, with no journaling. Used by the in-memory store system.
pub struct DirectResource {
    name: String,
    page_size: usize,
    data: Arc<dyn StoreData>,
    open: Mutex<bool>,
}

impl DirectResource {
    pub fn new(name: impl Into<String>, page_size: usize, data: Arc<dyn StoreData>) -> Self {
        Self {
            name: name.into(),
            page_size,
            data,
            open: Mutex::new(false),
        }
    }
}

impl Resource for DirectResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn size(&self) -> u64 {
        self.data.len().unwrap_or(0)
    }

    fn exists(&self) -> bool {
        self.data.exists()
    }

    fn open(&self, read_only: bool) -> Result<()> {
        self.data.open(read_only)?;
        *self.open.lock().unwrap() = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.open.lock().unwrap() = false;
        self.data.close()
    }

    fn delete(&self) -> Result<()> {
        *self.open.lock().unwrap() = false;
        self.data.delete()
    }

    fn read_page(&self, page_number: u64, buf: &mut [u8], offset: usize) -> Result<()> {
        assert!(
            *self.open.lock().unwrap(),
            "read on resource '{}' which is not open",
            self.name
        );
        let page = &mut buf[offset..offset + self.page_size];
        let read = self
            .data
            .read_at(page_number * self.page_size as u64, page)?;
        // Zero-fill past the end of the backing data.
        for b in page[read..].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    fn write_page(&self, page_number: u64, buf: &[u8], offset: usize, count: usize) -> Result<()> {
        assert!(
            *self.open.lock().unwrap(),
            "write on resource '{}' which is not open",
            self.name
        );
        let pos = page_number * self.page_size as u64 + offset as u64;
        self.data.write_at(pos, &buf[offset..offset + count])
    }

    fn set_size(&self, size: u64) -> Result<()> {
        self.data.set_len(size)
    }
}

/// Handle to one open store: byte-level helpers over a page resource.
///
/// The table layer addresses its row records by byte position; this handle
/// splits those accesses over page boundaries so that the underlying
/// resource only ever sees page writes (which is what the journal logs).
#[derive(Clone)]
pub struct Store {
    resource: Arc<dyn Resource>,
}

impl Store {
    pub fn new(resource: Arc<dyn Resource>) -> Self {
        Self { resource }
    }

    /// The underlying page resource.
    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    /// Page size of the underlying resource.
    pub fn page_size(&self) -> usize {
        self.resource.page_size()
    }

    /// Logical size of the store in bytes.
    pub fn size(&self) -> u64 {
        self.resource.size()
    }

    /// Grow the store to at least `size` bytes.
    pub fn set_size(&self, size: u64) -> Result<()> {
        self.resource.set_size(size)
    }

    /// Read `buf.len()` bytes starting at byte position `pos`.
    pub fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let page_size = self.page_size() as u64;
        let mut page_buf = vec![0u8; self.page_size()];
        let mut copied = 0usize;
        while copied < buf.len() {
            let abs = pos + copied as u64;
            let page = abs / page_size;
            let in_page = (abs % page_size) as usize;
            let count = (self.page_size() - in_page).min(buf.len() - copied);
            self.resource.read_page(page, &mut page_buf, 0)?;
            buf[copied..copied + count].copy_from_slice(&page_buf[in_page..in_page + count]);
            copied += count;
        }
        Ok(())
    }

    /// Write `data` starting at byte position `pos`, growing the store.
    pub fn write_bytes(&self, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        if end > self.resource.size() {
            self.resource.set_size(end)?;
        }
        let page_size = self.page_size() as u64;
        let mut page_buf = vec![0u8; self.page_size()];
        let mut written = 0usize;
        while written < data.len() {
            let abs = pos + written as u64;
            let page = abs / page_size;
            let in_page = (abs % page_size) as usize;
            let count = (self.page_size() - in_page).min(data.len() - written);
            page_buf[in_page..in_page + count].copy_from_slice(&data[written..written + count]);
            self.resource.write_page(page, &page_buf, in_page, count)?;
            written += count;
        }
        Ok(())
    }
}

/// The store system contract: named persistent stores, checkpointing, and
/// advisory process-exclusive locks.
pub trait StoreSystem: Send + Sync {
    /// Does a store with this name exist?
    fn store_exists(&self, name: &str) -> bool;

    /// Create and open a new store. Fails if it already exists or the
    /// system is read-only.
    fn create_store(&self, name: &str) -> Result<Store>;

    /// Open an existing store. Fails if it does not exist.
    fn open_store(&self, name: &str) -> Result<Store>;

    /// Close a store previously created or opened.
    fn close_store(&self, name: &str) -> Result<()>;

    /// Permanently delete a store. Returns false if the delete could not
    /// complete yet and should be retried.
    fn delete_store(&self, name: &str) -> Result<bool>;

    /// Mark a stable recovery boundary. Backends without journaling treat
    /// this as a no-op.
    fn set_check_point(&self) -> Result<()>;

    /// Acquire the named advisory lock. Fails if it is already held.
    fn lock(&self, name: &str) -> Result<()>;

    /// Release the named advisory lock.
    fn unlock(&self, name: &str) -> Result<()>;
}

/// Store system keeping every store on the heap. Checkpointing is a no-op;
/// nothing survives the process.
pub struct InMemoryStoreSystem {
    page_size: usize,
    stores: Mutex<HashMap<String, Arc<dyn Resource>>>,
    locks: Mutex<HashSet<String>>,
    read_only: bool,
}

impl InMemoryStoreSystem {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            stores: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashSet::new()),
            read_only: false,
        }
    }
}

impl StoreSystem for InMemoryStoreSystem {
    fn store_exists(&self, name: &str) -> bool {
        self.stores.lock().unwrap().contains_key(name)
    }

    fn create_store(&self, name: &str) -> Result<Store> {
        if self.read_only {
            return Err(Error::ReadOnlyStoreSystem);
        }
        let mut stores = self.stores.lock().unwrap();
        if stores.contains_key(name) {
            return Err(Error::StoreAlreadyExists(name.to_string()));
        }
        let data: Arc<dyn StoreData> = Arc::new(MemoryStoreData::new());
        let resource: Arc<dyn Resource> =
            Arc::new(DirectResource::new(name, self.page_size, data));
        resource.open(false)?;
        stores.insert(name.to_string(), resource.clone());
        Ok(Store::new(resource))
    }

    fn open_store(&self, name: &str) -> Result<Store> {
        let stores = self.stores.lock().unwrap();
        let resource = stores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))?;
        resource.open(self.read_only)?;
        Ok(Store::new(resource))
    }

    fn close_store(&self, name: &str) -> Result<()> {
        let stores = self.stores.lock().unwrap();
        match stores.get(name) {
            Some(resource) => resource.close(),
            None => Err(Error::StoreNotFound(name.to_string())),
        }
    }

    fn delete_store(&self, name: &str) -> Result<bool> {
        let mut stores = self.stores.lock().unwrap();
        match stores.remove(name) {
            Some(resource) => {
                resource.delete()?;
                Ok(true)
            }
            None => Err(Error::StoreNotFound(name.to_string())),
        }
    }

    fn set_check_point(&self) -> Result<()> {
        Ok(())
    }

    fn lock(&self, name: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.insert(name.to_string()) {
            return Err(Error::StoreLocked(name.to_string()));
        }
        Ok(())
    }

    fn unlock(&self, name: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.remove(name) {
            return Err(Error::StoreNotLocked(name.to_string()));
        }
        Ok(())
    }
}
