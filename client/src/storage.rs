//! Local key/value persistence for the engine's state blob.

use crate::{error::Result, Error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Byte storage keyed by name.
///
/// `write` must replace the previous value atomically: after a crash a
/// reader sees either the old bytes or the new ones, never a mix.
pub trait LocalStorage: Send + Sync + Debug {
    /// Read a value. `None` if the key was never written.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace a value.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a value. Removing a missing key succeeds.
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The storage directory.
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !key.starts_with('.');
        if !valid {
            return Err(Error::Storage(format!("invalid storage key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> Result<()> {
        Ok(())
    }
}

impl LocalStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.file_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let target = self.file_for(key)?;
        let temp = target.with_extension("json.tmp");

        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        self.sync_directory()
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.file_for(key)?) {
            Ok(()) => self.sync_directory(),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory storage for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents, as a process restarting after a crash
    /// would find them.
    pub fn fork(&self) -> Self {
        Self {
            values: Mutex::new(self.values.lock().clone()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw bytes stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }
}

impl LocalStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage is read-only".into()));
        }
        self.values.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}
