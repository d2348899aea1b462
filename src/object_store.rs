//! Object Store Abstraction
//!
//! The uploader writes one object per closed batch through [`ObjectStore`].
//! I/O errors are plain `std::io::Error`; their `ErrorKind` decides whether a
//! failed upload is retried by redelivery or stops the process.
//!
//! Implementations:
//! - `InMemoryObjectStore`: unit and integration tests
//! - `LocalFsObjectStore`: local archive directory
//! - `FailingObjectStore`: fault-injecting wrapper for tests
//! - `DryRunObjectStore`: logs keys, stores nothing
//! - `RemoteObjectStore` (feature `remote`): S3 and GCS

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Store an object. The object is either fully visible or absent afterwards.
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Objects whose key starts with `prefix`, sorted by key
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        (**self).put(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        (**self).exists(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        (**self).list(prefix)
    }
}

// ============================================================================
// InMemoryObjectStore - For tests
// ============================================================================

/// In-memory object store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().insert(key.to_string(), data.to_vec());
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let mut objects: Vec<ObjectMeta> = self
                .data
                .read()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.len() as u64,
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }
}

// ============================================================================
// LocalFsObjectStore - Archive directory on local disk
// ============================================================================

/// Objects as files under a base directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> IoResult<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("object key escapes the store root: {}", key),
            ));
        }
        Ok(self.base_path.join(relative))
    }
}

fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(&path, base, prefix, objects)?;
        } else if path.is_file() {
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            if key.starts_with(prefix) && !key.ends_with(".tmp") {
                objects.push(ObjectMeta {
                    key,
                    size_bytes: std::fs::metadata(&path)?.len(),
                });
            }
        }
    }
    Ok(())
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Write-then-rename so readers never see a partial object
            let mut tmp = path.clone().into_os_string();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, &path).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)?).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(self.full_path(key)?).await })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            if !self.base_path.exists() {
                return Ok(Vec::new());
            }
            let mut objects = Vec::new();
            walk_dir(&self.base_path, &self.base_path, prefix, &mut objects)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }
}

// ============================================================================
// FailingObjectStore - Fault injection
// ============================================================================

/// Wraps a store and fails `put` on demand.
///
/// Failures are queued: each `put` pops one scheduled error kind, if any,
/// before touching the inner store. `fail_always` makes every put fail until
/// `heal` is called.
#[derive(Clone)]
pub struct FailingObjectStore<S: ObjectStore> {
    inner: S,
    scheduled: Arc<Mutex<VecDeque<ErrorKind>>>,
    always: Arc<Mutex<Option<ErrorKind>>>,
    latency: Arc<Mutex<Duration>>,
    put_attempts: Arc<AtomicU64>,
    put_failures: Arc<AtomicU64>,
}

impl<S: ObjectStore> FailingObjectStore<S> {
    pub fn new(inner: S) -> Self {
        FailingObjectStore {
            inner,
            scheduled: Arc::new(Mutex::new(VecDeque::new())),
            always: Arc::new(Mutex::new(None)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            put_attempts: Arc::new(AtomicU64::new(0)),
            put_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next `count` puts with `kind`
    pub fn fail_next(&self, count: usize, kind: ErrorKind) {
        let mut scheduled = self.scheduled.lock();
        for _ in 0..count {
            scheduled.push_back(kind);
        }
    }

    pub fn fail_always(&self, kind: ErrorKind) {
        *self.always.lock() = Some(kind);
    }

    pub fn heal(&self) {
        *self.always.lock() = None;
        self.scheduled.lock().clear();
    }

    /// Delay every put, so tests can observe uploads in flight
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn put_failures(&self) -> u64 {
        self.put_failures.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<ErrorKind> {
        if let Some(kind) = *self.always.lock() {
            return Some(kind);
        }
        self.scheduled.lock().pop_front()
    }
}

impl<S: ObjectStore> ObjectStore for FailingObjectStore<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.put_attempts.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if let Some(kind) = self.next_failure() {
                self.put_failures.fetch_add(1, Ordering::SeqCst);
                return Err(IoError::new(kind, format!("injected put failure: {}", key)));
            }
            self.inner.put(key, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        self.inner.get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        self.inner.exists(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        self.inner.list(prefix)
    }
}

// ============================================================================
// DryRunObjectStore - Log instead of store
// ============================================================================

/// Accepts every put and logs where the object would have gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunObjectStore;

impl ObjectStore for DryRunObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            info!(key, bytes = data.len(), "Would store object");
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            Err(IoError::new(
                ErrorKind::NotFound,
                format!("dry run stores nothing: {}", key),
            ))
        })
    }

    fn exists<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(false) })
    }

    fn list<'a>(&'a self, _prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move { Ok(Vec::new()) })
    }
}
