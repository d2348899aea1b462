//! Inbound messages and their acknowledgment handles

use crate::clock::Timestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Capability to settle exactly one broker delivery.
///
/// Both methods consume the handle, so a delivery can be settled at most once.
/// Dropping a handle without calling either leaves the delivery in flight until
/// the broker's own redelivery timeout requeues it.
pub trait AckHandle: Send + Sync + 'static {
    /// Permanently remove the delivery from the broker.
    fn ack(self: Box<Self>);
    /// Ask the broker to redeliver the message.
    fn requeue(self: Box<Self>);
}

/// How the dedup key of a delivery is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupKeySource {
    /// The broker-assigned message ID. Redeliveries of one message share it.
    #[default]
    BrokerId,
    /// SHA-1 of the body. Also collapses distinct messages with identical bodies.
    ContentHash,
}

impl DedupKeySource {
    pub fn derive(&self, broker_id: &str, body: &[u8]) -> String {
        match self {
            DedupKeySource::BrokerId => broker_id.to_string(),
            DedupKeySource::ContentHash => format!("{:x}", Sha1::digest(body)),
        }
    }
}

/// A delivered message waiting to be batched
pub struct Message {
    pub key: String,
    pub body: Bytes,
    pub received_at: Timestamp,
    handle: Option<Box<dyn AckHandle>>,
}

impl Message {
    pub fn new(
        key: impl Into<String>,
        body: impl Into<Bytes>,
        received_at: Timestamp,
        handle: Box<dyn AckHandle>,
    ) -> Self {
        Message {
            key: key.into(),
            body: body.into(),
            received_at,
            handle: Some(handle),
        }
    }

    /// A message read back from the durable log. The original delivery is gone,
    /// so there is nothing to acknowledge.
    pub(crate) fn recovered(key: String, body: Bytes, received_at: Timestamp) -> Self {
        Message {
            key,
            body,
            received_at,
            handle: None,
        }
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn ack(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.ack();
        }
    }

    pub(crate) fn requeue(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.requeue();
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("key", &self.key)
            .field("body_len", &self.body.len())
            .field("received_at", &self.received_at)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}
