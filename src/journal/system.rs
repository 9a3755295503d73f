//! Journaled system: logging, checkpointing and crash recovery
//!
//! `JournalLog` owns the live journal file all resources append to.
//! `JournaledSystem` ties the log to the set of logging resources, drives
//! checkpoints (rotate the log, persist the closed file into the backing
//! stores, retire it) and replays leftover journal files on startup.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::journal::entry::JournalEntry;
use crate::journal::file::{JournalFile, JournalRecord};
use crate::journal::resource::LoggingResource;
use crate::store::data::{FileStoreData, StoreData};
use crate::store::system::Resource;

/// The live journal file and its numbering.
pub struct JournalLog {
    dir: PathBuf,
    inner: Mutex<LogInner>,
}

struct LogInner {
    current: Arc<JournalFile>,
    next_number: u64,
}

impl JournalLog {
    fn new(dir: PathBuf, first_number: u64) -> Result<Self> {
        let current = Arc::new(JournalFile::create(&dir, first_number)?);
        Ok(Self {
            dir,
            inner: Mutex::new(LogInner {
                current,
                next_number: first_number + 1,
            }),
        })
    }

    /// Log a page modification and return the entry pointing at it.
    pub fn log_page_modification(
        &self,
        resource: &str,
        page_number: u64,
        buf: &[u8],
        offset: usize,
        count: usize,
    ) -> Result<JournalEntry> {
        let inner = self.inner.lock().unwrap();
        let position = inner
            .current
            .log_page_write(resource, page_number, buf, offset, count)?;
        Ok(JournalEntry::new(
            inner.current.clone(),
            page_number,
            position,
        ))
    }

    /// Log a resource size change.
    pub fn log_resource_size_change(&self, resource: &str, size: u64) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.current.log_size_change(resource, size)?;
        Ok(())
    }

    /// Log a resource delete.
    pub fn log_resource_delete(&self, resource: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.current.log_delete(resource)?;
        Ok(())
    }

    /// Flush the live journal file to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.current.flush()
    }

    /// Close the live journal file, open the next one, and return the
    /// closed file for persisting.
    fn rotate(&self) -> Result<Arc<JournalFile>> {
        let mut inner = self.inner.lock().unwrap();
        let closed = inner.current.clone();
        closed.close()?;
        inner.current = Arc::new(JournalFile::create(&self.dir, inner.next_number)?);
        inner.next_number += 1;
        Ok(closed)
    }
}

/// The journaled resource system for one data directory.
pub struct JournaledSystem {
    data_dir: PathBuf,
    page_size: usize,
    chain_threshold: usize,
    read_only: bool,
    log: Arc<JournalLog>,
    resources: Mutex<HashMap<String, Arc<LoggingResource>>>,
    checkpoint_lock: Mutex<()>,
}

impl JournaledSystem {
    /// Start the journaled system: run crash recovery over any journal
    /// files left in the data directory, then open a fresh live journal.
    pub fn start(config: &EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let next_number = recover(&config.data_dir, config.page_size)?;
        let log = Arc::new(JournalLog::new(config.data_dir.clone(), next_number)?);

        Ok(Self {
            data_dir: config.data_dir.clone(),
            page_size: config.page_size,
            chain_threshold: config.journal_chain_threshold,
            read_only: config.read_only,
            log,
            resources: Mutex::new(HashMap::new()),
            checkpoint_lock: Mutex::new(()),
        })
    }

    /// The page size the journal operates on.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Get or create the logging resource with this name.
    pub fn resource(&self, name: &str) -> Arc<LoggingResource> {
        let mut resources = self.resources.lock().unwrap();
        resources
            .entry(name.to_string())
            .or_insert_with(|| {
                let data: Arc<dyn StoreData> =
                    Arc::new(FileStoreData::new(self.data_dir.join(data_file_name(name))));
                Arc::new(LoggingResource::new(
                    name,
                    self.page_size,
                    self.chain_threshold,
                    self.log.clone(),
                    data,
                ))
            })
            .clone()
    }

    /// Flush the live journal. Called after commit apply so that logged
    /// writes survive a crash even before the next checkpoint.
    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    /// Set a checkpoint: rotate the journal, persist the closed file into
    /// the backing stores and retire it.
    pub fn set_check_point(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let _guard = self.checkpoint_lock.lock().unwrap();

        let closed = self.log.rotate()?;
        debug!(
            journal = closed.journal_number(),
            "persisting journal at checkpoint"
        );

        // Hold a reference across the persist so the file cannot vanish
        // under a concurrent reader once it is marked deleted below.
        closed.reference();
        let result = self.persist(&closed);
        closed.dereference();
        result?;

        closed.mark_deleted();
        Ok(())
    }

    fn persist(&self, file: &Arc<JournalFile>) -> Result<()> {
        let records = file.read_records()?;
        for record in &records {
            match record {
                JournalRecord::PageWrite {
                    resource,
                    page_number,
                    offset,
                    data,
                } => {
                    self.resource(resource)
                        .persist_page_change(*page_number, *offset as usize, data)?;
                }
                JournalRecord::SizeChange { resource, size } => {
                    self.resource(resource).persist_set_size(*size)?;
                }
                JournalRecord::Delete { resource } => {
                    self.resource(resource).persist_delete()?;
                }
                JournalRecord::Close => {}
            }
        }
        let resources = self.resources.lock().unwrap();
        for resource in resources.values() {
            resource.synch()?;
        }
        Ok(())
    }

    /// Stop the system: checkpoint outstanding journal data and close all
    /// backing resources.
    pub fn stop(&self) -> Result<()> {
        self.set_check_point()?;
        let resources = self.resources.lock().unwrap();
        for resource in resources.values() {
            if let Err(e) = resource.persist_close() {
                warn!(resource = resource.name(), error = %e, "error closing resource");
            }
        }
        Ok(())
    }
}

/// Replay every journal file left in `dir` against the backing data files,
/// oldest journal first, then remove them. Returns the next journal number.
fn recover(dir: &Path, page_size: usize) -> Result<u64> {
    let mut numbers = Vec::new();
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if let Some(name) = dir_entry.file_name().to_str() {
            if let Some(number) = JournalFile::parse_file_name(name) {
                numbers.push(number);
            }
        }
    }
    numbers.sort_unstable();
    let next_number = numbers.last().map(|n| n + 1).unwrap_or(1);
    if numbers.is_empty() {
        return Ok(next_number);
    }

    info!(count = numbers.len(), "recovering from journal files");
    let mut datas: HashMap<String, FileStoreData> = HashMap::new();
    for number in &numbers {
        let path = dir.join(JournalFile::file_name(*number));
        let file = JournalFile::open(&path)?;
        let records = file.read_records()?;
        debug!(journal = number, records = records.len(), "replaying journal");

        for record in records {
            match record {
                JournalRecord::PageWrite {
                    resource,
                    page_number,
                    offset,
                    data,
                } => {
                    let store = backing(&mut datas, dir, &resource)?;
                    let pos = page_number * page_size as u64 + offset as u64;
                    store.write_at(pos, &data)?;
                }
                JournalRecord::SizeChange { resource, size } => {
                    let store = backing(&mut datas, dir, &resource)?;
                    store.set_len(size)?;
                }
                JournalRecord::Delete { resource } => {
                    // Drop the cached handle; a later record may recreate
                    // the resource from scratch.
                    let store = datas.remove(&resource).unwrap_or_else(|| {
                        FileStoreData::new(dir.join(data_file_name(&resource)))
                    });
                    store.delete()?;
                }
                JournalRecord::Close => {}
            }
        }
        file.mark_deleted();
    }

    for store in datas.values() {
        // Deleted stores have no open handle left; flushing them is a
        // no-op failure we can ignore.
        if store.exists() {
            store.flush()?;
            store.close()?;
        }
    }
    Ok(next_number)
}

fn backing<'a>(
    datas: &'a mut HashMap<String, FileStoreData>,
    dir: &Path,
    name: &str,
) -> Result<&'a FileStoreData> {
    match datas.entry(name.to_string()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let data = FileStoreData::new(dir.join(data_file_name(name)));
            data.open(false)?;
            Ok(entry.insert(data))
        }
    }
}

fn data_file_name(name: &str) -> String {
    format!("{}.dat", name)
}
