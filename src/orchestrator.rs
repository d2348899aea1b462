//! Sink orchestrator
//!
//! Single entry point for delivered messages. Every mutation of the dedup
//! filter and the open batch happens under one `parking_lot::Mutex`; the
//! trigger is evaluated and the batch swapped in the same critical section.
//! Uploads run after the lock is released, serialized by an async gate, so
//! new deliveries keep filling the next batch while one is being shipped.
//!
//! ```text
//! receive ──► dedup ──► append ──► should_flush? ──► swap_and_close ─┐
//!   (state lock held for all of the above)                           │
//!                                                                    ▼
//!              release segment ◄── ack in order ◄── put ◄── upload gate
//! ```

use crate::batch::{BatchStore, ClosedBatch, DurableBatchStore, MemoryBatchStore};
use crate::clock::{Clock, Timestamp};
use crate::config::{BatchMode, FsyncPolicy, SinkConfig};
use crate::dedup::{DedupCheck, DedupFilter};
use crate::error::SinkError;
use crate::flush::{should_flush, BatchSnapshot, FlushReason};
use crate::message::Message;
use crate::object_store::ObjectStore;
use crate::uploader::{BatchUploader, UploadReceipt};
use crate::wal::store::{LocalLogStore, LogStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Duplicate of a message in the open batch; acknowledged immediately.
    Acked,
    /// Buffered; acknowledged when its batch uploads.
    Deferred,
    /// Refused because the sink is shutting down; handed back to the broker.
    Requeue,
}

#[derive(Debug, Default)]
struct SinkStats {
    received: AtomicU64,
    duplicates: AtomicU64,
    buffered: AtomicU64,
    flushes: AtomicU64,
    uploaded_messages: AtomicU64,
    failed_uploads: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub received: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub flushes: u64,
    pub uploaded_messages: u64,
    pub failed_uploads: u64,
    pub requeued: u64,
}

struct SinkState {
    dedup: DedupFilter,
    store: Box<dyn BatchStore>,
    shutting_down: bool,
}

enum Admission {
    Duplicate(Message, u32),
    Refused(Message),
    Buffered(Option<(ClosedBatch, FlushReason)>),
}

pub struct Orchestrator<O: ObjectStore, C: Clock> {
    config: SinkConfig,
    clock: C,
    state: Mutex<SinkState>,
    uploader: BatchUploader<O>,
    upload_gate: tokio::sync::Mutex<()>,
    stats: SinkStats,
}

impl<O: ObjectStore, C: Clock> Orchestrator<O, C> {
    /// Validate the configuration, open the batch store, and upload anything
    /// a previous run left on disk.
    ///
    /// Disk mode opens the log at `buffer_file`. Fails with
    /// `SinkError::Unsupported` for channel mode.
    pub async fn start(config: SinkConfig, object_store: O, clock: C) -> Result<Self, SinkError> {
        let config = config.validate()?;
        match config.batch_mode {
            BatchMode::Memory => {
                let store = MemoryBatchStore::new(clock.now());
                Ok(Self::assemble(config, Box::new(store), object_store, clock))
            }
            BatchMode::Disk => {
                let path = config
                    .buffer_file
                    .clone()
                    .ok_or_else(|| SinkError::Config("disk mode needs a buffer file".to_string()))?;
                let base = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        SinkError::Config(format!("invalid buffer file: {}", path.display()))
                    })?
                    .to_string();
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| std::path::PathBuf::from("."));

                let log = LocalLogStore::new(dir)?;
                Self::start_durable(config, object_store, clock, log, &base).await
            }
            BatchMode::Channel => Err(SinkError::Unsupported(
                BatchMode::Channel.as_str().to_string(),
            )),
        }
    }

    /// Start in disk mode on an explicit log store.
    pub async fn start_durable<S: LogStore>(
        config: SinkConfig,
        object_store: O,
        clock: C,
        log: S,
        base: &str,
    ) -> Result<Self, SinkError> {
        let mut config = config.validate()?;
        config.batch_mode = BatchMode::Disk;

        let (store, recovered) = DurableBatchStore::open(log, base, config.fsync_policy, clock.now())?;
        let orchestrator = Self::assemble(config, Box::new(store), object_store, clock);
        orchestrator.recover(recovered).await?;
        Ok(orchestrator)
    }

    fn assemble(config: SinkConfig, store: Box<dyn BatchStore>, object_store: O, clock: C) -> Self {
        let uploader = BatchUploader::new(object_store, &config.store);
        Orchestrator {
            config,
            clock,
            state: Mutex::new(SinkState {
                dedup: DedupFilter::new(),
                store,
                shutting_down: false,
            }),
            uploader,
            upload_gate: tokio::sync::Mutex::new(()),
            stats: SinkStats::default(),
        }
    }

    /// Upload recovered batches, oldest first. Any failure aborts startup and
    /// leaves the remaining segments on disk for the next attempt.
    async fn recover(&self, recovered: Vec<ClosedBatch>) -> Result<(), SinkError> {
        for mut batch in recovered {
            let _gate = self.upload_gate.lock().await;
            let receipt = self.uploader.upload(&mut batch).await?;
            self.state.lock().store.release(&batch)?;
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            self.stats
                .uploaded_messages
                .fetch_add(receipt.messages as u64, Ordering::Relaxed);
            info!(key = %receipt.key, messages = receipt.messages, "Uploaded recovered batch");
        }
        Ok(())
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn object_store(&self) -> &O {
        self.uploader.store()
    }

    pub fn open_batch(&self) -> BatchSnapshot {
        self.state.lock().store.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            buffered: self.stats.buffered.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            uploaded_messages: self.stats.uploaded_messages.load(Ordering::Relaxed),
            failed_uploads: self.stats.failed_uploads.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
        }
    }

    /// Handle one delivery.
    ///
    /// Returns `Err` if the message could not be buffered, or if it closed a
    /// batch whose upload then failed. In the latter case every handle of that
    /// batch, including this one, has been requeued.
    pub async fn receive(&self, message: Message) -> Result<Disposition, SinkError> {
        let admission = {
            let mut state = self.state.lock();
            if state.shutting_down {
                Admission::Refused(message)
            } else {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                let now = self.clock.now();
                match state.dedup.check(&message.key, now) {
                    DedupCheck::Duplicate { seen_count, .. } => {
                        Admission::Duplicate(message, seen_count)
                    }
                    DedupCheck::New => {
                        let key = message.key.clone();
                        if let Err(e) = state.store.append(message) {
                            state.dedup.forget(&key);
                            return Err(e);
                        }
                        self.stats.buffered.fetch_add(1, Ordering::Relaxed);
                        Admission::Buffered(self.take_due(&mut state, now)?)
                    }
                }
            }
        };

        match admission {
            Admission::Refused(mut message) => {
                message.requeue();
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                debug!(key = %message.key, "Refused delivery during shutdown");
                Ok(Disposition::Requeue)
            }
            Admission::Duplicate(mut message, seen_count) => {
                message.ack();
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(key = %message.key, seen_count, "Acked duplicate delivery");
                Ok(Disposition::Acked)
            }
            Admission::Buffered(None) => Ok(Disposition::Deferred),
            Admission::Buffered(Some((batch, reason))) => {
                self.ship(batch, reason).await?;
                Ok(Disposition::Deferred)
            }
        }
    }

    /// Close the open batch if a threshold is met. Caller holds the state lock.
    fn take_due(
        &self,
        state: &mut SinkState,
        now: Timestamp,
    ) -> Result<Option<(ClosedBatch, FlushReason)>, SinkError> {
        let snapshot = state.store.snapshot();
        let Some(reason) = should_flush(&snapshot, &self.config.flush, now) else {
            return Ok(None);
        };
        let batch = state.store.swap_and_close(now)?;
        state.dedup.clear();
        Ok(Some((batch, reason)))
    }

    async fn ship(
        &self,
        mut batch: ClosedBatch,
        reason: FlushReason,
    ) -> Result<UploadReceipt, SinkError> {
        let _gate = self.upload_gate.lock().await;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        info!(
            reason = reason.as_str(),
            messages = batch.len(),
            age_ms = batch.closed_at().saturating_sub(batch.opened_at()).as_millis() as u64,
            "Flushing batch"
        );

        match self.uploader.upload(&mut batch).await {
            Ok(receipt) => {
                self.stats
                    .uploaded_messages
                    .fetch_add(receipt.messages as u64, Ordering::Relaxed);
                self.state.lock().store.release(&batch)?;
                Ok(receipt)
            }
            Err(e) => {
                self.stats.failed_uploads.fetch_add(1, Ordering::Relaxed);
                if self.config.batch_mode == BatchMode::Disk {
                    // The sealed segment is only retried by recovery at the next start
                    error!(segment = batch.segment(), "Upload of durable batch failed");
                    return Err(e.into_fatal());
                }
                Err(e)
            }
        }
    }

    /// Evaluate the flush trigger without a delivery (idle topics).
    pub async fn flush_if_due(&self) -> Result<Option<UploadReceipt>, SinkError> {
        let due = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Ok(None);
            }
            let now = self.clock.now();
            self.take_due(&mut state, now)?
        };

        match due {
            Some((batch, reason)) => self.ship(batch, reason).await.map(Some),
            None => Ok(None),
        }
    }

    /// Fsync the durable log if its policy defers syncing to the timer.
    pub fn sync_log(&self) -> Result<(), SinkError> {
        if self.config.fsync_policy == FsyncPolicy::EverySecond {
            self.state.lock().store.sync()?;
        }
        Ok(())
    }

    /// Run `flush_if_due` every `interval` until `cancel` fires or a fatal
    /// error occurs. A zero interval disables the timer.
    pub fn spawn_flush_timer(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), SinkError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if interval.is_zero() {
                return Ok(());
            }
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Flush timer stopped");
                        return Ok(());
                    }
                    _ = tick.tick() => {}
                }

                let result = match this.sync_log() {
                    Ok(()) => this.flush_if_due().await.map(|_| ()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Fatal error in flush timer");
                        cancel.cancel();
                        return Err(e);
                    }
                    Err(e) => warn!(error = %e, "Timed flush failed, messages will be redelivered"),
                }
            }
        })
    }

    /// Stop accepting deliveries and make one bounded attempt to flush the
    /// open batch. On failure or timeout, memory-mode messages are lost to
    /// this process (the broker still holds them unacknowledged); disk-mode
    /// messages stay in the log for the next start.
    pub async fn shutdown(&self, timeout: Duration) -> Result<Option<UploadReceipt>, SinkError> {
        let closed = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.store.sync()?;
            if state.store.snapshot().count == 0 {
                None
            } else {
                let batch = state.store.swap_and_close(self.clock.now())?;
                state.dedup.clear();
                Some(batch)
            }
        };

        let Some(batch) = closed else {
            info!("Shutdown with empty batch");
            return Ok(None);
        };

        info!(messages = batch.len(), "Final flush before shutdown");
        match tokio::time::timeout(timeout, self.ship(batch, FlushReason::Shutdown)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Final flush timed out");
                Err(SinkError::ShutdownTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::AckLedger;
    use crate::clock::SimulatedClock;
    use crate::config::FlushPolicy;
    use crate::object_store::InMemoryObjectStore;

    async fn sink(flush: FlushPolicy) -> Orchestrator<InMemoryObjectStore, SimulatedClock> {
        Orchestrator::start(
            SinkConfig::test("events", flush),
            InMemoryObjectStore::new(),
            SimulatedClock::new(1_700_000_000_000),
        )
        .await
        .unwrap()
    }

    fn msg(ledger: &AckLedger, key: &str) -> Message {
        Message::new(key, key.to_string(), Timestamp::ZERO, ledger.handle(key))
    }

    #[tokio::test]
    async fn test_receive_buffers_until_threshold() {
        let ledger = AckLedger::new();
        let sink = sink(FlushPolicy::messages(2)).await;

        assert_eq!(sink.receive(msg(&ledger, "a")).await.unwrap(), Disposition::Deferred);
        assert_eq!(sink.open_batch().count, 1);
        assert!(sink.object_store().is_empty());

        assert_eq!(sink.receive(msg(&ledger, "b")).await.unwrap(), Disposition::Deferred);
        assert_eq!(sink.object_store().len(), 1);
        assert_eq!(sink.open_batch().count, 0);
        assert_eq!(ledger.acked(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_acked_immediately() {
        let ledger = AckLedger::new();
        let sink = sink(FlushPolicy::messages(10)).await;

        sink.receive(msg(&ledger, "a")).await.unwrap();
        assert_eq!(sink.receive(msg(&ledger, "a")).await.unwrap(), Disposition::Acked);

        assert_eq!(ledger.ack_count("a"), 1);
        assert_eq!(sink.open_batch().count, 1);
        assert_eq!(sink.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_deliveries() {
        let ledger = AckLedger::new();
        let sink = sink(FlushPolicy::messages(10)).await;

        sink.receive(msg(&ledger, "a")).await.unwrap();
        let receipt = sink.shutdown(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(receipt.messages, 1);

        assert_eq!(sink.receive(msg(&ledger, "b")).await.unwrap(), Disposition::Requeue);
        assert_eq!(ledger.requeued(), vec!["b"]);
        assert_eq!(sink.stats().requeued, 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_empty_batch() {
        let sink = sink(FlushPolicy::messages(10)).await;
        assert!(sink.shutdown(Duration::from_secs(1)).await.unwrap().is_none());
        assert!(sink.object_store().is_empty());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_runs_on_spawned_tasks() {
        let ledger = AckLedger::new();
        let sink = Arc::new(sink(FlushPolicy::messages(2)).await);

        let pending = sink.flush_if_due();
        assert_send(&pending);
        drop(pending);

        let mut tasks = Vec::new();
        for key in ["a", "b"] {
            let sink = Arc::clone(&sink);
            let message = msg(&ledger, key);
            tasks.push(tokio::spawn(async move { sink.receive(message).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Disposition::Deferred);
        }

        assert_eq!(sink.object_store().len(), 1);
        assert_eq!(ledger.ack_count("a") + ledger.ack_count("b"), 2);
    }

    #[tokio::test]
    async fn test_channel_mode_unsupported() {
        let mut config = SinkConfig::test("events", FlushPolicy::messages(1));
        config.batch_mode = BatchMode::Channel;

        let result = Orchestrator::start(config, InMemoryObjectStore::new(), SimulatedClock::new(0)).await;
        assert!(matches!(result, Err(SinkError::Unsupported(ref mode)) if mode == "channel"));
    }
}
