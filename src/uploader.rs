//! Batch upload
//!
//! Serializes a closed batch as newline-delimited bodies, gzips it, and puts
//! it as one object. Handles are acknowledged only after the put returns Ok;
//! on failure they are requeued and nothing is acknowledged.
//!
//! ## Object Keys
//!
//! ```text
//! {path}/{YYYY}/{MM}/{DD}/{prefix}-{YYYY}{MM}{DD}_{HH}{mm}.{extension}.gz
//! ```
//!
//! Derived from the batch close time in UTC. Two batches closing in the same
//! minute would share a key, so an occupied key gets a `-1`, `-2`, ... suffix
//! before `.{extension}.gz`.

use crate::batch::ClosedBatch;
use crate::clock::Timestamp;
use crate::config::StoreConfig;
use crate::error::SinkError;
use crate::object_store::ObjectStore;
use chrono::{Datelike, Timelike};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Error as IoError, ErrorKind, Write};
use tracing::{debug, info, warn};

/// Upper bound on collision suffixes tried for one key
const MAX_KEY_SUFFIX: u32 = 10_000;

/// Outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub messages: usize,
    /// Compressed object size
    pub bytes: usize,
}

pub struct BatchUploader<O: ObjectStore> {
    store: O,
    path: String,
    prefix: String,
    extension: String,
}

impl<O: ObjectStore> BatchUploader<O> {
    pub fn new(store: O, config: &StoreConfig) -> Self {
        BatchUploader {
            store,
            path: config.path.trim_matches('/').to_string(),
            prefix: config.prefix.clone(),
            extension: config.extension.clone(),
        }
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    /// Key for a batch closed at `closed_at`, without collision suffix
    pub fn object_key(&self, closed_at: Timestamp) -> String {
        self.key_with_suffix(closed_at, 0)
    }

    fn key_with_suffix(&self, closed_at: Timestamp, suffix: u32) -> String {
        let t = closed_at.to_utc();
        let (year, month, day) = (t.year(), t.month(), t.day());

        let mut name = format!(
            "{}-{:04}{:02}{:02}_{:02}{:02}",
            self.prefix,
            year,
            month,
            day,
            t.hour(),
            t.minute()
        );
        if suffix > 0 {
            name.push_str(&format!("-{}", suffix));
        }

        let dir = format!("{:04}/{:02}/{:02}", year, month, day);
        if self.path.is_empty() {
            format!("{}/{}.{}.gz", dir, name, self.extension)
        } else {
            format!("{}/{}/{}.{}.gz", self.path, dir, name, self.extension)
        }
    }

    /// First key for `closed_at` not already present in the store
    async fn free_key(&self, closed_at: Timestamp) -> Result<String, IoError> {
        for suffix in 0..=MAX_KEY_SUFFIX {
            let key = self.key_with_suffix(closed_at, suffix);
            if !self.store.exists(&key).await? {
                if suffix > 0 {
                    debug!(key = %key, "Object key taken, using suffixed key");
                }
                return Ok(key);
            }
        }
        Err(IoError::new(
            ErrorKind::AlreadyExists,
            format!(
                "no free object key for {}",
                self.key_with_suffix(closed_at, 0)
            ),
        ))
    }

    async fn store_payload(
        &self,
        closed_at: Timestamp,
        payload: Vec<u8>,
    ) -> Result<(String, usize), IoError> {
        let key = self.free_key(closed_at).await?;
        self.store.put(&key, &payload).await?;
        Ok((key, payload.len()))
    }

    /// Upload the batch and, on success, acknowledge every message in receipt order.
    pub async fn upload(&self, batch: &mut ClosedBatch) -> Result<UploadReceipt, SinkError> {
        let closed_at = batch.closed_at();
        let base_key = self.object_key(closed_at);

        // Nothing borrowed from the batch may live across an await
        let result = match encode_batch(batch) {
            Ok(payload) => self.store_payload(closed_at, payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((key, bytes)) => {
                let acked = batch.ack_all();
                info!(
                    key = %key,
                    messages = batch.len(),
                    acked,
                    bytes,
                    "Stored batch"
                );
                Ok(UploadReceipt {
                    key,
                    messages: batch.len(),
                    bytes,
                })
            }
            Err(e) => {
                let requeued = batch.requeue_all();
                let err = SinkError::from_upload(&base_key, e);
                warn!(
                    key = %base_key,
                    messages = batch.len(),
                    requeued,
                    error = %err,
                    "Batch upload failed"
                );
                Err(err)
            }
        }
    }
}

/// Newline-delimited bodies, gzip-compressed
pub fn encode_batch(batch: &ClosedBatch) -> Result<Vec<u8>, IoError> {
    let raw_len: usize = batch.messages().iter().map(|m| m.body.len() + 1).sum();
    let mut encoder = GzEncoder::new(Vec::with_capacity(raw_len / 4 + 64), Compression::default());
    for message in batch.messages() {
        encoder.write_all(&message.body)?;
        encoder.write_all(b"\n")?;
    }
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::broker::AckLedger;
    use crate::message::Message;
    use crate::object_store::{FailingObjectStore, InMemoryObjectStore};
    use flate2::read::GzDecoder;
    use std::io::Read;

    // 2024-03-05T07:09:30Z
    const CLOSE_MS: u64 = 1_709_622_570_000;

    fn config(path: &str) -> StoreConfig {
        StoreConfig {
            path: path.to_string(),
            prefix: "events".to_string(),
            extension: "json".to_string(),
            ..StoreConfig::default()
        }
    }

    fn closed(ledger: &AckLedger, bodies: &[&str]) -> ClosedBatch {
        let mut batch = Batch::open(Timestamp::ZERO);
        for (i, body) in bodies.iter().enumerate() {
            let key = format!("m{}", i);
            batch.push(Message::new(
                key.clone(),
                body.to_string(),
                Timestamp::from_millis(i as u64),
                ledger.handle(&key),
            ));
        }
        batch.close(Timestamp::from_millis(CLOSE_MS))
    }

    fn gunzip(data: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(data).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_object_key_layout() {
        let uploader = BatchUploader::new(InMemoryObjectStore::new(), &config("/nsq-archive/"));
        assert_eq!(
            uploader.object_key(Timestamp::from_millis(CLOSE_MS)),
            "nsq-archive/2024/03/05/events-20240305_0709.json.gz"
        );

        let bare = BatchUploader::new(InMemoryObjectStore::new(), &config(""));
        assert_eq!(
            bare.object_key(Timestamp::from_millis(CLOSE_MS)),
            "2024/03/05/events-20240305_0709.json.gz"
        );
    }

    #[tokio::test]
    async fn test_upload_writes_gzip_lines_and_acks() {
        let ledger = AckLedger::new();
        let store = InMemoryObjectStore::new();
        let uploader = BatchUploader::new(store.clone(), &config("raw"));

        let mut batch = closed(&ledger, &["{\"a\":1}", "{\"b\":2}"]);
        let receipt = uploader.upload(&mut batch).await.unwrap();

        assert_eq!(receipt.key, "raw/2024/03/05/events-20240305_0709.json.gz");
        assert_eq!(receipt.messages, 2);
        let stored = store.get(&receipt.key).await.unwrap();
        assert_eq!(receipt.bytes, stored.len());
        assert_eq!(gunzip(&stored), "{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(ledger.acked(), vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn test_same_minute_gets_suffix() {
        let ledger = AckLedger::new();
        let store = InMemoryObjectStore::new();
        let uploader = BatchUploader::new(store.clone(), &config("raw"));

        let first = uploader.upload(&mut closed(&ledger, &["1"])).await.unwrap();
        let second = uploader.upload(&mut closed(&ledger, &["2"])).await.unwrap();
        let third = uploader.upload(&mut closed(&ledger, &["3"])).await.unwrap();

        assert_eq!(first.key, "raw/2024/03/05/events-20240305_0709.json.gz");
        assert_eq!(second.key, "raw/2024/03/05/events-20240305_0709-1.json.gz");
        assert_eq!(third.key, "raw/2024/03/05/events-20240305_0709-2.json.gz");
        assert_eq!(gunzip(&store.get(&first.key).await.unwrap()), "1\n");
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_put_acks_nothing() {
        let ledger = AckLedger::new();
        let store = FailingObjectStore::new(InMemoryObjectStore::new());
        store.fail_next(1, ErrorKind::ConnectionReset);
        let uploader = BatchUploader::new(store.clone(), &config("raw"));

        let mut batch = closed(&ledger, &["x", "y"]);
        let err = uploader.upload(&mut batch).await.unwrap_err();

        assert!(matches!(err, SinkError::UploadTransient { .. }));
        assert!(ledger.acked().is_empty());
        assert_eq!(ledger.requeued(), vec!["m0", "m1"]);
        assert!(store.inner().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_is_fatal() {
        let ledger = AckLedger::new();
        let store = FailingObjectStore::new(InMemoryObjectStore::new());
        store.fail_always(ErrorKind::PermissionDenied);
        let uploader = BatchUploader::new(store, &config("raw"));

        let err = uploader.upload(&mut closed(&ledger, &["x"])).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.ack_count("m0"), 0);
    }
}
