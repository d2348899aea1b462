//! Configuration for the archiver
//!
//! `SinkConfig` is built once at startup (from environment variables or a TOML
//! file), validated, and passed by value into the orchestrator. Nothing in the
//! core reads configuration from global state.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | ARCHIVER_TOPIC | - | Broker topic (required) |
//! | ARCHIVER_CHANNEL | random ephemeral | Broker consumer channel |
//! | ARCHIVER_BATCH_MODE | memory | memory, disk or channel |
//! | ARCHIVER_MAX_MESSAGES | 0 | Messages per batch (0 = unbounded) |
//! | ARCHIVER_MAX_SECONDS | 600 | Batch age before flush (0 = unbounded) |
//! | ARCHIVER_MAX_IN_FLIGHT | 1000 | Unacked messages before flush |
//! | ARCHIVER_MAX_IN_FLIGHT_SECONDS | 60 | Oldest unacked message age before flush |
//! | ARCHIVER_BUFFER_FILE | /tmp/topic-archiver.{topic} | Durable log (disk mode) |
//! | ARCHIVER_FSYNC | always | Durable log fsync: always, everysec, no |
//! | ARCHIVER_DEDUP_KEY | broker_id | broker_id or content_hash |
//! | ARCHIVER_STORE_TYPE | localfs | memory, localfs, s3, gcs |
//! | ARCHIVER_DATA_PATH | /data | LocalFs root |
//! | ARCHIVER_BUCKET | - | Bucket name (required for s3/gcs) |
//! | ARCHIVER_REGION | us-east-1 | S3 region |
//! | ARCHIVER_ENDPOINT | - | S3-compatible endpoint (MinIO, LocalStack) |
//! | ARCHIVER_PATH | - | Key path under the bucket |
//! | ARCHIVER_PREFIX | file | Object name prefix |
//! | ARCHIVER_EXTENSION | json | Object name extension |
//! | ARCHIVER_CHECK_INTERVAL_MS | 1000 | Timer-driven flush check (0 = receive-only) |
//! | ARCHIVER_SHUTDOWN_TIMEOUT_MS | 30000 | Budget for the final flush |
//! | ARCHIVER_DRY_RUN | false | Log object keys instead of storing batches |

use crate::error::SinkError;
use crate::message::DedupKeySource;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How messages are held between flushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// In-process buffer; a crash loses the open batch.
    #[default]
    Memory,
    /// Append-only log on local disk with startup recovery.
    Disk,
    /// Leave messages in the broker between flushes. Recognised, not supported.
    Channel,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Memory => "memory",
            BatchMode::Disk => "disk",
            BatchMode::Channel => "channel",
        }
    }
}

impl FromStr for BatchMode {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BatchMode::Memory),
            "disk" => Ok(BatchMode::Disk),
            "channel" => Ok(BatchMode::Channel),
            other => Err(SinkError::Config(format!(
                "unknown batch mode '{}', expected one of [disk, memory, channel]",
                other
            ))),
        }
    }
}

/// Fsync policy for the durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every append, before the append returns.
    #[default]
    Always,
    /// Fsync from the periodic flush check. A crash may lose up to one interval.
    EverySecond,
    /// Leave flushing to the OS.
    No,
}

impl FromStr for FsyncPolicy {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" | "every_second" => Ok(FsyncPolicy::EverySecond),
            "no" => Ok(FsyncPolicy::No),
            other => Err(SinkError::Config(format!(
                "unknown fsync policy '{}', expected always, everysec or no",
                other
            ))),
        }
    }
}

/// Thresholds that close the open batch. Zero disables a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushPolicy {
    pub max_messages: u64,
    pub max_seconds: u64,
    pub max_in_flight: u64,
    pub max_in_flight_seconds: u64,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            max_messages: 0,
            max_seconds: 600,
            max_in_flight: 1000,
            max_in_flight_seconds: 60,
        }
    }
}

impl FlushPolicy {
    /// Count-only policy, handy in tests
    pub fn messages(max_messages: u64) -> Self {
        FlushPolicy {
            max_messages,
            max_seconds: 0,
            max_in_flight: 0,
            max_in_flight_seconds: 0,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_messages == 0
            && self.max_seconds == 0
            && self.max_in_flight == 0
            && self.max_in_flight_seconds == 0
    }
}

/// Object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Memory,
    #[default]
    LocalFs,
    S3,
    Gcs,
}

impl FromStr for StoreType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreType::Memory),
            "localfs" => Ok(StoreType::LocalFs),
            "s3" => Ok(StoreType::S3),
            "gcs" => Ok(StoreType::Gcs),
            other => Err(SinkError::Config(format!(
                "unknown store type '{}', expected memory, localfs, s3 or gcs",
                other
            ))),
        }
    }
}

/// Where and how batches are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub store_type: StoreType,
    /// Root directory for the LocalFs store
    pub local_path: PathBuf,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    /// Key path under the bucket (`{path}/{YYYY}/{MM}/{DD}/...`)
    pub path: String,
    pub prefix: String,
    pub extension: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            store_type: StoreType::LocalFs,
            local_path: PathBuf::from("/data"),
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            path: String::new(),
            prefix: "file".to_string(),
            extension: "json".to_string(),
        }
    }
}

/// Top-level sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub topic: String,
    pub channel: String,
    pub batch_mode: BatchMode,
    pub flush: FlushPolicy,
    /// Durable log path for disk mode
    pub buffer_file: Option<PathBuf>,
    pub fsync_policy: FsyncPolicy,
    pub dedup_key: DedupKeySource,
    pub store: StoreConfig,
    /// Period of the timer-driven flush check; zero means check on receive only
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
    /// Log what would be stored and acknowledge without writing objects
    pub dry_run: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            topic: String::new(),
            channel: String::new(),
            batch_mode: BatchMode::Memory,
            flush: FlushPolicy::default(),
            buffer_file: None,
            fsync_policy: FsyncPolicy::Always,
            dedup_key: DedupKeySource::BrokerId,
            store: StoreConfig::default(),
            check_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

impl SinkConfig {
    /// Configuration for tests: in-memory store, count-only flushing
    pub fn test(topic: &str, flush: FlushPolicy) -> Self {
        SinkConfig {
            topic: topic.to_string(),
            channel: "test".to_string(),
            flush,
            store: StoreConfig {
                store_type: StoreType::Memory,
                path: "archive".to_string(),
                ..StoreConfig::default()
            },
            check_interval: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(5),
            ..SinkConfig::default()
        }
    }

    /// Load configuration from `ARCHIVER_*` environment variables
    pub fn from_env() -> Result<Self, SinkError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SinkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SinkConfig::default();
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let flush = FlushPolicy {
            max_messages: parse_var(&get, "ARCHIVER_MAX_MESSAGES", defaults.flush.max_messages)?,
            max_seconds: parse_var(&get, "ARCHIVER_MAX_SECONDS", defaults.flush.max_seconds)?,
            max_in_flight: parse_var(&get, "ARCHIVER_MAX_IN_FLIGHT", defaults.flush.max_in_flight)?,
            max_in_flight_seconds: parse_var(
                &get,
                "ARCHIVER_MAX_IN_FLIGHT_SECONDS",
                defaults.flush.max_in_flight_seconds,
            )?,
        };

        let store_defaults = StoreConfig::default();
        let store = StoreConfig {
            store_type: parse_var(&get, "ARCHIVER_STORE_TYPE", store_defaults.store_type)?,
            local_path: get("ARCHIVER_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(store_defaults.local_path),
            bucket: get("ARCHIVER_BUCKET").unwrap_or_default(),
            region: get("ARCHIVER_REGION").unwrap_or(store_defaults.region),
            endpoint: get("ARCHIVER_ENDPOINT"),
            path: get("ARCHIVER_PATH").unwrap_or_default(),
            prefix: get("ARCHIVER_PREFIX").unwrap_or(store_defaults.prefix),
            extension: get("ARCHIVER_EXTENSION").unwrap_or(store_defaults.extension),
        };

        let dedup_key = match get("ARCHIVER_DEDUP_KEY").as_deref() {
            None | Some("broker_id") => DedupKeySource::BrokerId,
            Some("content_hash") => DedupKeySource::ContentHash,
            Some(other) => {
                return Err(SinkError::Config(format!(
                    "unknown dedup key source '{}', expected broker_id or content_hash",
                    other
                )))
            }
        };

        Ok(SinkConfig {
            topic: get("ARCHIVER_TOPIC").unwrap_or_default(),
            channel: get("ARCHIVER_CHANNEL").unwrap_or_default(),
            batch_mode: parse_var(&get, "ARCHIVER_BATCH_MODE", defaults.batch_mode)?,
            flush,
            buffer_file: get("ARCHIVER_BUFFER_FILE").map(PathBuf::from),
            fsync_policy: parse_var(&get, "ARCHIVER_FSYNC", defaults.fsync_policy)?,
            dedup_key,
            store,
            check_interval: Duration::from_millis(parse_var(
                &get,
                "ARCHIVER_CHECK_INTERVAL_MS",
                1_000u64,
            )?),
            shutdown_timeout: Duration::from_millis(parse_var(
                &get,
                "ARCHIVER_SHUTDOWN_TIMEOUT_MS",
                30_000u64,
            )?),
            dry_run: parse_var(&get, "ARCHIVER_DRY_RUN", false)?,
        })
    }

    /// Load configuration from a TOML file. Missing fields take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, SinkError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SinkError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| SinkError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Check required fields and fill in derived defaults.
    pub fn validate(mut self) -> Result<Self, SinkError> {
        if self.topic.is_empty() {
            return Err(SinkError::Config("topic is required".to_string()));
        }

        if matches!(self.store.store_type, StoreType::S3 | StoreType::Gcs) && self.store.bucket.is_empty() {
            return Err(SinkError::Config(
                "bucket is required for remote object stores".to_string(),
            ));
        }

        if self.store.extension.is_empty() {
            return Err(SinkError::Config("extension must not be empty".to_string()));
        }

        if self.channel.is_empty() {
            let n = rand::thread_rng().gen_range(0..999_999u32);
            self.channel = format!("archiver-{:06}#ephemeral", n);
        }

        if self.batch_mode == BatchMode::Disk && self.buffer_file.is_none() {
            self.buffer_file = Some(PathBuf::from(format!("/tmp/topic-archiver.{}", self.topic)));
        }

        // Never ask the broker for more unacked messages than a batch may hold.
        if self.flush.max_messages > 0 && self.flush.max_messages < self.flush.max_in_flight {
            self.flush.max_in_flight = self.flush.max_messages;
        }

        Ok(self)
    }

    /// Log the effective configuration at startup
    pub fn log_summary(&self) {
        info!(topic = %self.topic, channel = %self.channel, "Subscription");
        info!(
            mode = self.batch_mode.as_str(),
            buffer_file = ?self.buffer_file,
            fsync = ?self.fsync_policy,
            "Batch mode"
        );
        info!(
            max_messages = self.flush.max_messages,
            max_seconds = self.flush.max_seconds,
            max_in_flight = self.flush.max_in_flight,
            max_in_flight_seconds = self.flush.max_in_flight_seconds,
            "Flush policy"
        );
        info!(
            store = ?self.store.store_type,
            bucket = %self.store.bucket,
            path = %self.store.path,
            prefix = %self.store.prefix,
            extension = %self.store.extension,
            dry_run = self.dry_run,
            "Output"
        );
    }
}

fn parse_var<T, G>(get: &G, name: &str, default: T) -> Result<T, SinkError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| SinkError::Config(format!("{}={}: {}", name, raw, e))),
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
