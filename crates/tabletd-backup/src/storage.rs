//! Backup storage interface
//!
//! A [`BackupStorage`] stores backups under `<keyspace>/<shard>` directories;
//! a [`BackupHandle`] is one in-progress or previously stored backup. File
//! sinks are atomic-on-commit: a writer that is dropped without
//! [`SinkWriter::finish`] leaves no visible file.
//!
//! Handles double as error recorders for the fan-out copy tasks: any task can
//! [`BackupHandle::record_error`] without blocking, later tasks observe
//! [`BackupHandle::has_errors`] and skip their work, and the session collects
//! the first recorded error at the end.
//!
//! The concrete object stores (S3, GCS, ...) live outside this crate; the
//! in-memory implementation below backs the test suites.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tabletd_core::{Result, TabletError};

/// Writable sink for one backup file. Bytes become visible only after
/// `finish` returns.
pub trait SinkWriter: Write + Send {
    /// Commit the file. Dropping without calling this abandons the write.
    fn finish(&mut self) -> Result<()>;
}

/// Readable source for one stored backup file.
pub trait SourceReader: Read + Send {}

impl<T: Read + Send> SourceReader for T {}

/// One backup, identified by (directory, name).
#[async_trait]
pub trait BackupHandle: Send + Sync {
    /// The `<keyspace>/<shard>` directory this backup lives in.
    fn directory(&self) -> &str;

    /// The backup name within the directory.
    fn name(&self) -> &str;

    /// Open a named file for writing. `size_hint` is `None` for files of
    /// unknown size such as the manifest. Concurrent `add_file` calls on the
    /// same handle are independent.
    async fn add_file(&self, name: &str, size_hint: Option<u64>) -> Result<Box<dyn SinkWriter>>;

    /// Open a named file for reading.
    async fn read_file(&self, name: &str) -> Result<Box<dyn SourceReader>>;

    /// Record an error from a concurrent task. Never blocks.
    fn record_error(&self, err: TabletError);

    /// True once any error has been recorded.
    fn has_errors(&self) -> bool;

    /// Consolidate recorded errors: the first error wins. Consumes the
    /// recorded set.
    fn take_error(&self) -> Option<TabletError>;

    /// Finalize the backup. After this returns, the backup is discoverable
    /// through [`BackupStorage::list_backups`].
    async fn finish(&self) -> Result<()>;

    /// Abandon the backup, removing anything written so far.
    async fn abort(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn BackupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackupHandle({}/{})", self.directory(), self.name())
    }
}

/// A place backups are stored.
#[async_trait]
pub trait BackupStorage: Send + Sync {
    /// Handles in `dir`, ordered by creation time ascending. Only finished
    /// backups are returned.
    async fn list_backups(&self, dir: &str) -> Result<Vec<Arc<dyn BackupHandle>>>;

    /// Create a new in-progress backup.
    async fn start_backup(&self, dir: &str, name: &str) -> Result<Arc<dyn BackupHandle>>;

    /// Remove a backup and all its files.
    async fn remove_backup(&self, dir: &str, name: &str) -> Result<()>;
}

/// Non-blocking error registry shared by the fan-out copy tasks.
#[derive(Default)]
pub struct ErrorRecorder {
    errors: Mutex<Vec<TabletError>>,
}

impl ErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: TabletError) {
        self.errors.lock().push(err);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    /// The first recorded error, removing it from the registry.
    pub fn take_first(&self) -> Option<TabletError> {
        let mut errors = self.errors.lock();
        if errors.is_empty() {
            None
        } else {
            Some(errors.remove(0))
        }
    }
}

#[derive(Default)]
struct MemoryBackup {
    files: HashMap<String, Vec<u8>>,
    finished: bool,
}

#[derive(Default)]
struct MemoryStore {
    // directory -> backups in creation order
    dirs: HashMap<String, Vec<(String, MemoryBackup)>>,
}

/// In-memory [`BackupStorage`]. Backs the engine test suites and any caller
/// that wants a throwaway store.
#[derive(Clone, Default)]
pub struct MemoryBackupStorage {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryBackupStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStorage for MemoryBackupStorage {
    async fn list_backups(&self, dir: &str) -> Result<Vec<Arc<dyn BackupHandle>>> {
        let store = self.store.lock();
        let mut out: Vec<Arc<dyn BackupHandle>> = Vec::new();
        if let Some(backups) = store.dirs.get(dir) {
            for (name, backup) in backups {
                if backup.finished {
                    out.push(Arc::new(MemoryBackupHandle {
                        store: self.store.clone(),
                        directory: dir.to_string(),
                        name: name.clone(),
                        errors: ErrorRecorder::new(),
                    }));
                }
            }
        }
        Ok(out)
    }

    async fn start_backup(&self, dir: &str, name: &str) -> Result<Arc<dyn BackupHandle>> {
        let mut store = self.store.lock();
        let backups = store.dirs.entry(dir.to_string()).or_default();
        if backups.iter().any(|(n, _)| n == name) {
            return Err(TabletError::failed_precondition(format!(
                "backup {dir}/{name} already exists"
            )));
        }
        backups.push((name.to_string(), MemoryBackup::default()));
        Ok(Arc::new(MemoryBackupHandle {
            store: self.store.clone(),
            directory: dir.to_string(),
            name: name.to_string(),
            errors: ErrorRecorder::new(),
        }))
    }

    async fn remove_backup(&self, dir: &str, name: &str) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(backups) = store.dirs.get_mut(dir) {
            backups.retain(|(n, _)| n != name);
        }
        Ok(())
    }
}

struct MemoryBackupHandle {
    store: Arc<Mutex<MemoryStore>>,
    directory: String,
    name: String,
    errors: ErrorRecorder,
}

impl MemoryBackupHandle {
    fn with_backup<T>(&self, f: impl FnOnce(&mut MemoryBackup) -> T) -> Result<T> {
        let mut store = self.store.lock();
        let backups = store
            .dirs
            .get_mut(&self.directory)
            .ok_or_else(|| TabletError::not_found(format!("no backups in {}", self.directory)))?;
        let backup = backups
            .iter_mut()
            .find(|(n, _)| *n == self.name)
            .map(|(_, b)| b)
            .ok_or_else(|| {
                TabletError::not_found(format!("backup {}/{}", self.directory, self.name))
            })?;
        Ok(f(backup))
    }
}

#[async_trait]
impl BackupHandle for MemoryBackupHandle {
    fn directory(&self) -> &str {
        &self.directory
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn add_file(&self, name: &str, _size_hint: Option<u64>) -> Result<Box<dyn SinkWriter>> {
        // Existence check up front; content lands on commit.
        self.with_backup(|_| ())?;
        Ok(Box::new(MemorySink {
            store: self.store.clone(),
            directory: self.directory.clone(),
            backup: self.name.clone(),
            file: name.to_string(),
            buf: Vec::new(),
            committed: false,
        }))
    }

    async fn read_file(&self, name: &str) -> Result<Box<dyn SourceReader>> {
        let data = self.with_backup(|b| b.files.get(name).cloned())?;
        match data {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes))),
            None => Err(TabletError::not_found(format!(
                "file {name} in backup {}/{}",
                self.directory, self.name
            ))),
        }
    }

    fn record_error(&self, err: TabletError) {
        self.errors.record(err);
    }

    fn has_errors(&self) -> bool {
        self.errors.has_errors()
    }

    fn take_error(&self) -> Option<TabletError> {
        self.errors.take_first()
    }

    async fn finish(&self) -> Result<()> {
        self.with_backup(|b| b.finished = true)
    }

    async fn abort(&self) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(backups) = store.dirs.get_mut(&self.directory) {
            backups.retain(|(n, _)| *n != self.name);
        }
        Ok(())
    }
}

struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
    directory: String,
    backup: String,
    file: String,
    buf: Vec<u8>,
    committed: bool,
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SinkWriter for MemorySink {
    fn finish(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        let mut store = self.store.lock();
        let backup = store
            .dirs
            .get_mut(&self.directory)
            .and_then(|backups| backups.iter_mut().find(|(n, _)| *n == self.backup))
            .map(|(_, b)| b)
            .ok_or_else(|| {
                TabletError::not_found(format!("backup {}/{}", self.directory, self.backup))
            })?;
        backup
            .files
            .insert(self.file.clone(), std::mem::take(&mut self.buf));
        self.committed = true;
        Ok(())
    }
}

/// Convert the consolidated error of a handle into a session result.
pub fn consolidate(handle: &dyn BackupHandle) -> Result<()> {
    if handle.has_errors() {
        return Err(handle
            .take_error()
            .unwrap_or_else(|| TabletError::unknown("unknown backup error")));
    }
    Ok(())
}
