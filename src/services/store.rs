//! Crash-safe JSON record persistence.
//!
//! Every record is a named logical file `<dir>/<key>.json` holding a JSON
//! object stamped with a `schema_version` field. Writers serialize through an
//! advisory `flock` on `<dir>/.<key>.lock`, stage the new content in a
//! temporary file inside the same directory and rename it over the target, so
//! readers observe either the complete old or the complete new content.

use log::{debug, error, warn};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const SCHEMA_VERSION_FIELD: &str = "schema_version";
pub const SCHEMA_VERSION: u64 = 1;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type Record = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store record '{key}' is busy: lock not acquired within {timeout:?}")]
    Busy { key: String, timeout: Duration },
    #[error("store record '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store io failure on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

impl StoreError {
    fn io(key: &str, source: io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    fn corrupt(key: &str, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Durable mapping store shared by all subsystems.
///
/// Cheap to clone; all clones operate on the same directory.
#[derive(Clone, Debug)]
pub struct AtomicStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl AtomicStore {
    /// Open (and create if necessary) a store rooted at `dir`
    ///
    /// # Arguments
    /// * `dir` - Directory holding the record files
    /// * `lock_timeout` - Upper bound for acquiring a record lock
    pub fn open(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("<root>", e))?;

        Ok(Self {
            inner: Arc::new(StoreInner { dir, lock_timeout }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Read a record, returning the default record if it was never written
    pub fn read(&self, key: &str) -> Result<Record, StoreError> {
        Ok(self.load(key)?.unwrap_or_else(default_record))
    }

    /// Replace a record as a whole
    pub fn write(&self, key: &str, mut record: Record) -> Result<(), StoreError> {
        let _lock = self.lock(key)?;
        stamp(&mut record);
        let staged = self.stage(key, &record)?;
        self.commit(key, staged)
    }

    /// Read-modify-write a record under its exclusive lock
    ///
    /// The transform runs while the lock is held, so concurrent updates of the
    /// same key never interleave. A corrupt record is never handed to the
    /// transform and nothing is written.
    ///
    /// # Returns
    /// The record as written
    pub fn update<F>(&self, key: &str, transform: F) -> Result<Record, StoreError>
    where
        F: FnOnce(Record) -> Record,
    {
        let _lock = self.lock(key)?;
        let current = self.load(key)?.unwrap_or_else(default_record);
        let mut next = transform(current);
        stamp(&mut next);
        let staged = self.stage(key, &next)?;
        self.commit(key, staged)?;
        Ok(next)
    }

    /// Read a record into a typed structure
    pub fn read_as<T>(&self, key: &str) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        match self.load(key)? {
            Some(record) => from_record(key, record),
            None => Ok(T::default()),
        }
    }

    /// Typed read-modify-write under the record lock
    ///
    /// # Returns
    /// Whatever the closure returns
    pub fn update_as<T, F, R>(&self, key: &str, mutate: F) -> Result<R, StoreError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _lock = self.lock(key)?;
        let mut value: T = match self.load(key)? {
            Some(record) => from_record(key, record)?,
            None => T::default(),
        };
        let result = mutate(&mut value);

        let Value::Object(mut record) =
            serde_json::to_value(&value).map_err(|e| StoreError::corrupt(key, e))?
        else {
            return Err(StoreError::corrupt(key, "record is not a JSON object"));
        };
        stamp(&mut record);

        let staged = self.stage(key, &record)?;
        self.commit(key, staged)?;
        Ok(result)
    }

    fn load(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let path = self.record_path(key)?;

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(key, e)),
        };

        let record = match serde_json::from_slice::<Value>(&content) {
            Ok(Value::Object(record)) => record,
            Ok(_) => {
                error!("store record {key} is not a JSON object");
                return Err(StoreError::corrupt(key, "record is not a JSON object"));
            }
            Err(e) => {
                error!("store record {key} is unreadable: {e}");
                return Err(StoreError::corrupt(key, e));
            }
        };

        match record.get(SCHEMA_VERSION_FIELD).and_then(Value::as_u64) {
            Some(version) if version > SCHEMA_VERSION => {
                debug!("store record {key} has newer schema version {version}")
            }
            None => debug!("store record {key} has no schema version, migrating on next write"),
            _ => {}
        }

        Ok(Some(record))
    }

    fn lock(&self, key: &str) -> Result<KeyLock, StoreError> {
        validate_key(key)?;
        KeyLock::acquire(
            &self.inner.dir.join(format!(".{key}.lock")),
            key,
            self.inner.lock_timeout,
        )
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.inner.dir.join(format!("{key}.json")))
    }

    /// Write the serialized record to a synced temporary file next to the target
    fn stage(&self, key: &str, record: &Record) -> Result<NamedTempFile, StoreError> {
        let mut staged = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.inner.dir)
            .map_err(|e| StoreError::io(key, e))?;

        serde_json::to_writer_pretty(&mut staged, record)
            .map_err(|e| StoreError::corrupt(key, e))?;
        staged
            .write_all(b"\n")
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| StoreError::io(key, e))?;

        Ok(staged)
    }

    /// Atomically rename a staged file over the record
    fn commit(&self, key: &str, staged: NamedTempFile) -> Result<(), StoreError> {
        let path = self.record_path(key)?;

        staged.persist(&path).map_err(|e| {
            error!("failed to replace store record {key}: {}", e.error);
            StoreError::io(key, e.error)
        })?;

        match File::open(&self.inner.dir) {
            Ok(dir) => {
                if let Err(e) = dir.sync_all() {
                    warn!("failed to sync store directory after writing {key}: {e}");
                }
            }
            Err(e) => warn!("failed to open store directory for sync: {e}"),
        }

        debug!("store record {key} written");
        Ok(())
    }
}

/// Exclusive advisory lock on a record, released on drop
struct KeyLock {
    file: File,
}

impl KeyLock {
    fn acquire(path: &Path, key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(key, e))?;
        let deadline = Instant::now() + timeout;

        loop {
            // SAFETY: the descriptor is owned by `file` and outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(Self { file });
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted => {}
                _ => return Err(StoreError::io(key, err)),
            }

            if Instant::now() >= deadline {
                warn!("store record {key} still locked after {timeout:?}");
                return Err(StoreError::Busy {
                    key: key.to_string(),
                    timeout,
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // SAFETY: see `acquire`; closing the file would release the lock as well.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn default_record() -> Record {
    let mut record = Record::new();
    stamp(&mut record);
    record
}

fn stamp(record: &mut Record) {
    record.insert(SCHEMA_VERSION_FIELD.to_string(), SCHEMA_VERSION.into());
}

fn from_record<T: DeserializeOwned>(key: &str, record: Record) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(record)).map_err(|e| {
        error!("store record {key} does not match its schema: {e}");
        StoreError::corrupt(key, e)
    })
}
