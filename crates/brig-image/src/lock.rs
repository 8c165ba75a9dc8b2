use crate::ImageError;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Advisory, cross-process exclusive lock on a file. Released on drop.
pub struct PullLock {
    lock_file: File,
}

impl PullLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, ImageError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        file.lock_exclusive()
            .map_err(|e| ImageError::Lock(format!("{}: {e}", lock_path.display())))?;

        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, ImageError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for PullLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// In-process registry of per-key mutexes. `flock` locks are per open file
/// description, so threads of one process need their own serialization.
#[derive(Default)]
pub struct KeyedMutex {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, key: &str) -> Result<Arc<Mutex<()>>, ImageError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| ImageError::Lock(format!("mutex poisoned: {e}")))?;
        Ok(Arc::clone(slots.entry(key.to_owned()).or_default()))
    }
}
