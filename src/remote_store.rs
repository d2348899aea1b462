//! Remote Object Store (S3, GCS)
//!
//! Backed by the `object_store` crate from the Arrow ecosystem. Credentials
//! come from the usual provider environment (`AWS_*`, `GOOGLE_*`).
//!
//! Errors are mapped onto `std::io::ErrorKind` so the uploader can classify
//! them: rejected credentials and missing buckets are fatal, everything else
//! is retried through broker redelivery.

use crate::config::{StoreConfig, StoreType};
use crate::object_store::{ObjectMeta, ObjectStore, StoreFuture};
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore as ObjectStoreTrait;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Bucket-backed object store
#[derive(Clone)]
pub struct RemoteObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    bucket: String,
}

impl RemoteObjectStore {
    /// Build a client for the configured bucket.
    pub fn new(config: &StoreConfig) -> Result<Self, IoError> {
        let store: Arc<dyn ObjectStoreTrait> = match config.store_type {
            StoreType::S3 => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(&config.bucket)
                    .with_region(&config.region);

                // Custom endpoint for S3-compatible services (MinIO, LocalStack)
                if let Some(endpoint) = &config.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Arc::new(builder.build().map_err(|e| {
                    IoError::new(ErrorKind::InvalidInput, format!("Failed to create S3 store: {}", e))
                })?)
            }
            StoreType::Gcs => {
                let builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&config.bucket);
                Arc::new(builder.build().map_err(|e| {
                    IoError::new(ErrorKind::InvalidInput, format!("Failed to create GCS store: {}", e))
                })?)
            }
            other => {
                return Err(IoError::new(
                    ErrorKind::InvalidInput,
                    format!("{:?} is not a remote store type", other),
                ))
            }
        };

        Ok(RemoteObjectStore {
            store,
            bucket: config.bucket.clone(),
        })
    }

    /// Wrap an existing store (tests use `object_store::memory::InMemory`)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, bucket: &str) -> Self {
        RemoteObjectStore {
            store,
            bucket: bucket.to_string(),
        }
    }

    fn map_error(err: object_store::Error) -> IoError {
        let kind = match &err {
            object_store::Error::NotFound { .. } => ErrorKind::NotFound,
            object_store::Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            object_store::Error::Precondition { .. } => ErrorKind::InvalidInput,
            object_store::Error::InvalidPath { .. } => ErrorKind::InvalidInput,
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => ErrorKind::PermissionDenied,
            _ => ErrorKind::Other,
        };
        IoError::new(kind, err.to_string())
    }
}

impl std::fmt::Debug for RemoteObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ObjectStore for RemoteObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            self.store
                .put(&path, Bytes::copy_from_slice(data).into())
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            let result = self.store.get(&path).await.map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            match self.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            use futures::TryStreamExt;

            let prefix_path = ObjectPath::from(prefix);
            let listed: Vec<_> = self
                .store
                .list(Some(&prefix_path))
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut objects: Vec<ObjectMeta> = listed
                .into_iter()
                .map(|meta| ObjectMeta {
                    key: meta.location.to_string(),
                    size_bytes: meta.size as u64,
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> RemoteObjectStore {
        RemoteObjectStore::from_store(Arc::new(InMemory::new()), "test-bucket")
    }

    #[tokio::test]
    async fn test_put_get_exists() {
        let store = store();
        store.put("raw/2024/01/02/file-20240102_0304.json.gz", b"gz").await.unwrap();

        assert!(store.exists("raw/2024/01/02/file-20240102_0304.json.gz").await.unwrap());
        assert!(!store.exists("raw/missing").await.unwrap());
        assert_eq!(
            store.get("raw/2024/01/02/file-20240102_0304.json.gz").await.unwrap(),
            b"gz"
        );
    }

    #[tokio::test]
    async fn test_missing_object_maps_to_not_found() {
        let err = store().get("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = store();
        store.put("raw/a", b"1").await.unwrap();
        store.put("raw/b", b"22").await.unwrap();
        store.put("other/c", b"3").await.unwrap();

        let listed = store.list("raw").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].size_bytes, 2);
    }

    #[test]
    fn test_rejects_local_store_type() {
        let config = StoreConfig::default();
        assert!(RemoteObjectStore::new(&config).is_err());
    }
}
