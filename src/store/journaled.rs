//! Journaled store system
//!
//! The durable store backend: one data file per store under the data
//! directory, every resource wrapped in a [`LoggingResource`] so that page
//! writes go through the write-ahead journal. Opening the system replays
//! any journal files a crash left behind; `set_check_point` persists the
//! journal into the backing files and retires it.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::journal::system::JournaledSystem;
use crate::store::system::{Resource, Store, StoreSystem};

/// Store system with write-ahead journaling and crash recovery.
pub struct JournaledStoreSystem {
    config: EngineConfig,
    system: Arc<JournaledSystem>,
    locks: Mutex<HashSet<String>>,
}

impl JournaledStoreSystem {
    /// Open the store system over `config.data_dir`, running crash
    /// recovery first.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let system = Arc::new(JournaledSystem::start(&config)?);
        Ok(Self {
            config,
            system,
            locks: Mutex::new(HashSet::new()),
        })
    }

    /// The underlying journaled system.
    pub fn journaled_system(&self) -> &Arc<JournaledSystem> {
        &self.system
    }

    /// Flush the live journal to disk.
    pub fn flush(&self) -> Result<()> {
        self.system.flush()
    }

    /// Checkpoint and close every backing resource.
    pub fn stop(&self) -> Result<()> {
        self.system.stop()
    }

    fn lock_file_path(&self, name: &str) -> std::path::PathBuf {
        self.config.data_dir.join(format!("{}.lock", name))
    }
}

impl StoreSystem for JournaledStoreSystem {
    fn store_exists(&self, name: &str) -> bool {
        self.system.resource(name).exists()
    }

    fn create_store(&self, name: &str) -> Result<Store> {
        if self.config.read_only {
            return Err(Error::ReadOnlyStoreSystem);
        }
        let resource = self.system.resource(name);
        if resource.exists() {
            return Err(Error::StoreAlreadyExists(name.to_string()));
        }
        resource.open(false)?;
        Ok(Store::new(resource as Arc<dyn Resource>))
    }

    fn open_store(&self, name: &str) -> Result<Store> {
        let resource = self.system.resource(name);
        if !resource.exists() {
            return Err(Error::StoreNotFound(name.to_string()));
        }
        resource.open(self.config.read_only)?;
        Ok(Store::new(resource as Arc<dyn Resource>))
    }

    fn close_store(&self, name: &str) -> Result<()> {
        let resource = self.system.resource(name);
        if !resource.exists() {
            return Err(Error::StoreNotFound(name.to_string()));
        }
        resource.close()
    }

    fn delete_store(&self, name: &str) -> Result<bool> {
        let resource = self.system.resource(name);
        if !resource.exists() {
            return Err(Error::StoreNotFound(name.to_string()));
        }
        resource.delete()?;
        Ok(true)
    }

    fn set_check_point(&self) -> Result<()> {
        self.system.set_check_point()
    }

    fn lock(&self, name: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.contains(name) {
            return Err(Error::StoreLocked(name.to_string()));
        }
        // The lock file guards against another process opening the same
        // physical resources.
        let path = self.lock_file_path(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| Error::StoreLocked(name.to_string()))?;
        locks.insert(name.to_string());
        Ok(())
    }

    fn unlock(&self, name: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.remove(name) {
            return Err(Error::StoreNotLocked(name.to_string()));
        }
        fs::remove_file(self.lock_file_path(name))?;
        Ok(())
    }
}
