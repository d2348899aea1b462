//! Log Storage Abstraction
//!
//! File operations behind the durable batch log, split out so tests can
//! simulate crashes and disk faults without touching the filesystem.
//!
//! ## Implementations
//!
//! - `InMemoryLogStore`: unit tests, crash simulation, fault injection
//! - `LocalLogStore`: production (std::fs::File + sync_all)

use crate::error::LogError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Trait for log file writers
pub trait LogFileWriter: Send {
    /// Append data. Returns the file size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError>;
    /// Fsync the file to durable storage.
    fn sync(&mut self) -> Result<(), LogError>;
    /// Current size in bytes.
    fn size(&self) -> u64;
}

/// Trait for log file readers
pub trait LogFileReader: Send {
    fn read_all(&mut self) -> Result<Vec<u8>, LogError>;
}

/// Trait for log storage backends
pub trait LogStore: Send + Sync + 'static {
    type Writer: LogFileWriter;
    type Reader: LogFileReader;

    /// Create (or truncate) a file for writing.
    fn create(&self, name: &str) -> Result<Self::Writer, LogError>;
    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError>;
    /// All file names in the store, sorted.
    fn list(&self) -> Result<Vec<String>, LogError>;
    /// Delete a file. Deleting a missing file succeeds.
    fn delete(&self, name: &str) -> Result<(), LogError>;
    /// Atomically replace `to` with `from`.
    fn rename(&self, from: &str, to: &str) -> Result<(), LogError>;
    fn exists(&self, name: &str) -> Result<bool, LogError>;
}

// ============================================================================
// InMemoryLogStore - For unit tests and crash simulation
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Position up to which data is "synced" (durable)
    synced_pos: usize,
}

type FileMap = Arc<Mutex<HashMap<String, InMemoryFile>>>;

/// In-memory log store. Clones share the same files, so a test can keep a
/// handle, drop the batch store, and reopen it to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    files: FileMap,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }

    /// Overwrite the raw bytes of a file (corruption and torn-write simulation)
    pub fn set_file_data(&self, name: &str, data: Vec<u8>) {
        let mut files = self.files.lock();
        let file = files.entry(name.to_string()).or_default();
        file.synced_pos = data.len();
        file.data = data;
    }

    /// Simulate a crash: un-synced bytes are lost.
    pub fn simulate_crash(&self) {
        for file in self.files.lock().values_mut() {
            file.data.truncate(file.synced_pos);
        }
    }

    /// Make every subsequent append fail, as a full or failing disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

pub struct InMemoryLogWriter {
    name: String,
    files: FileMap,
    fail_writes: Arc<AtomicBool>,
    current_size: u64,
}

impl LogFileWriter for InMemoryLogWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LogError::DiskFull);
        }

        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| LogError::NotFound(self.name.clone()))?;
        file.data.extend_from_slice(data);
        self.current_size = file.data.len() as u64;
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        if let Some(file) = self.files.lock().get_mut(&self.name) {
            file.synced_pos = file.data.len();
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

pub struct InMemoryLogReader {
    data: Vec<u8>,
}

impl LogFileReader for InMemoryLogReader {
    fn read_all(&mut self) -> Result<Vec<u8>, LogError> {
        Ok(std::mem::take(&mut self.data))
    }
}

impl LogStore for InMemoryLogStore {
    type Writer = InMemoryLogWriter;
    type Reader = InMemoryLogReader;

    fn create(&self, name: &str) -> Result<Self::Writer, LogError> {
        self.files
            .lock()
            .insert(name.to_string(), InMemoryFile::default());

        Ok(InMemoryLogWriter {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            fail_writes: Arc::clone(&self.fail_writes),
            current_size: 0,
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| LogError::NotFound(name.to_string()))?;
        Ok(InMemoryLogReader {
            data: file.data.clone(),
        })
    }

    fn list(&self) -> Result<Vec<String>, LogError> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), LogError> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), LogError> {
        let mut files = self.files.lock();
        let file = files
            .remove(from)
            .ok_or_else(|| LogError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, LogError> {
        Ok(self.files.lock().contains_key(name))
    }
}

// ============================================================================
// LocalLogStore - For production
// ============================================================================

/// Files in one local directory
#[derive(Debug, Clone)]
pub struct LocalLogStore {
    dir: PathBuf,
}

impl LocalLogStore {
    /// Create the store, creating the directory if needed.
    pub fn new(dir: PathBuf) -> Result<Self, LogError> {
        std::fs::create_dir_all(&dir)?;
        Ok(LocalLogStore { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Persist directory entries so a rename survives power loss.
    fn sync_dir(&self) -> Result<(), LogError> {
        #[cfg(unix)]
        {
            std::fs::File::open(&self.dir)
                .and_then(|d| d.sync_all())
                .map_err(|e| LogError::FsyncFailed(e.to_string()))?;
        }
        Ok(())
    }
}

pub struct LocalLogWriter {
    file: std::fs::File,
    current_size: u64,
}

impl LogFileWriter for LocalLogWriter {
    fn append(&mut self, data: &[u8]) -> Result<u64, LogError> {
        self.file.write_all(data).map_err(LogError::from)?;
        self.current_size = self.current_size.saturating_add(data.len() as u64);
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.file
            .sync_all()
            .map_err(|e| LogError::FsyncFailed(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

pub struct LocalLogReader {
    path: PathBuf,
}

impl LogFileReader for LocalLogReader {
    fn read_all(&mut self) -> Result<Vec<u8>, LogError> {
        std::fs::read(&self.path).map_err(LogError::Io)
    }
}

impl LogStore for LocalLogStore {
    type Writer = LocalLogWriter;
    type Reader = LocalLogReader;

    fn create(&self, name: &str) -> Result<Self::Writer, LogError> {
        let file = std::fs::File::create(self.file_path(name)).map_err(LogError::Io)?;
        Ok(LocalLogWriter {
            file,
            current_size: 0,
        })
    }

    fn open_read(&self, name: &str) -> Result<Self::Reader, LogError> {
        let path = self.file_path(name);
        if !path.exists() {
            return Err(LogError::NotFound(name.to_string()));
        }
        Ok(LocalLogReader { path })
    }

    fn list(&self) -> Result<Vec<String>, LogError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(LogError::Io)? {
            let entry = entry.map_err(LogError::Io)?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), LogError> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => self.sync_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogError::Io(e)),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), LogError> {
        std::fs::rename(self.file_path(from), self.file_path(to)).map_err(LogError::from)?;
        self.sync_dir()
    }

    fn exists(&self, name: &str) -> Result<bool, LogError> {
        Ok(self.file_path(name).exists())
    }
}
