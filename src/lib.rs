//! topic-archiver: batches pub/sub deliveries into gzip objects in object storage.
//!
//! A delivery is acknowledged to the broker only once the batch holding it
//! has been stored. See [`orchestrator::Orchestrator`] for the entry point.

pub mod batch;
pub mod broker;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod flush;
pub mod message;
pub mod object_store;
pub mod observability;
pub mod orchestrator;
#[cfg(feature = "remote")]
pub mod remote_store;
pub mod uploader;
pub mod wal;

pub use clock::{Clock, SimulatedClock, SystemClock, Timestamp};
pub use config::{BatchMode, FlushPolicy, FsyncPolicy, SinkConfig, StoreConfig, StoreType};
pub use error::{LogError, SinkError};
pub use message::{AckHandle, DedupKeySource, Message};
pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore};
pub use orchestrator::{Disposition, Orchestrator, StatsSnapshot};
pub use uploader::UploadReceipt;
