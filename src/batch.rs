//! Batch accumulation
//!
//! A [`Batch`] is the open, appendable set of buffered messages. Closing it
//! consumes it and yields a [`ClosedBatch`], which has no append operation.
//!
//! Two [`BatchStore`] variants hold the open batch:
//!
//! - [`MemoryBatchStore`]: a plain vector. A crash loses the open batch.
//! - [`DurableBatchStore`]: every message is appended to a checksummed log
//!   before `append` returns. Closing seals the live log under a sequence
//!   number and starts a fresh one; the sealed segment is released only once
//!   its batch has been uploaded. Opening the store recovers every sealed
//!   segment and a non-empty live log as closed batches.

use crate::clock::Timestamp;
use crate::config::FsyncPolicy;
use crate::error::{LogError, SinkError};
use crate::flush::BatchSnapshot;
use crate::message::Message;
use crate::wal::store::LogStore;
use crate::wal::{LogReader, LogRecord, LogWriter};
use tracing::{debug, info, warn};

const SEALED_SUFFIX: &str = ".sealed";

/// The open batch
#[derive(Debug)]
pub struct Batch {
    messages: Vec<Message>,
    opened_at: Timestamp,
    in_flight: u64,
    oldest_in_flight: Option<Timestamp>,
}

impl Batch {
    pub fn open(now: Timestamp) -> Self {
        Batch {
            messages: Vec::new(),
            opened_at: now,
            in_flight: 0,
            oldest_in_flight: None,
        }
    }

    pub fn push(&mut self, message: Message) {
        if message.has_handle() {
            self.in_flight += 1;
            self.oldest_in_flight = Some(match self.oldest_in_flight {
                Some(oldest) => oldest.min(message.received_at),
                None => message.received_at,
            });
        }
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn opened_at(&self) -> Timestamp {
        self.opened_at
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            count: self.messages.len() as u64,
            in_flight: self.in_flight,
            opened_at: self.opened_at,
            oldest_in_flight: self.oldest_in_flight,
        }
    }

    pub fn close(self, closed_at: Timestamp) -> ClosedBatch {
        ClosedBatch {
            messages: self.messages,
            opened_at: self.opened_at,
            closed_at,
            segment: None,
        }
    }
}

/// An immutable batch waiting for upload
#[derive(Debug)]
pub struct ClosedBatch {
    messages: Vec<Message>,
    opened_at: Timestamp,
    closed_at: Timestamp,
    /// Sealed log segment backing this batch (durable mode)
    segment: Option<String>,
}

impl ClosedBatch {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn opened_at(&self) -> Timestamp {
        self.opened_at
    }

    pub fn closed_at(&self) -> Timestamp {
        self.closed_at
    }

    pub fn segment(&self) -> Option<&str> {
        self.segment.as_deref()
    }

    /// Whether this batch was read back from disk rather than delivered live
    pub fn is_recovered(&self) -> bool {
        self.messages.iter().all(|m| !m.has_handle())
    }

    /// Acknowledge every message in receipt order. Returns how many handles fired.
    pub(crate) fn ack_all(&mut self) -> usize {
        let mut acked = 0;
        for message in &mut self.messages {
            if message.has_handle() {
                message.ack();
                acked += 1;
            }
        }
        acked
    }

    /// Hand every delivery back to the broker. Returns how many handles fired.
    pub(crate) fn requeue_all(&mut self) -> usize {
        let mut requeued = 0;
        for message in &mut self.messages {
            if message.has_handle() {
                message.requeue();
                requeued += 1;
            }
        }
        requeued
    }
}

/// Holder of the open batch
pub trait BatchStore: Send {
    /// Buffer a message. In durable mode the message is on disk when this returns.
    fn append(&mut self, message: Message) -> Result<(), SinkError>;

    fn snapshot(&self) -> BatchSnapshot;

    /// Close the open batch and start a new empty one opened at `now`.
    fn swap_and_close(&mut self, now: Timestamp) -> Result<ClosedBatch, SinkError>;

    /// Flush buffered log writes to stable storage.
    fn sync(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Drop the durable copy of a batch that has been uploaded.
    fn release(&mut self, _batch: &ClosedBatch) -> Result<(), SinkError> {
        Ok(())
    }
}

// ============================================================================
// MemoryBatchStore
// ============================================================================

#[derive(Debug)]
pub struct MemoryBatchStore {
    batch: Batch,
}

impl MemoryBatchStore {
    pub fn new(now: Timestamp) -> Self {
        MemoryBatchStore {
            batch: Batch::open(now),
        }
    }
}

impl BatchStore for MemoryBatchStore {
    fn append(&mut self, message: Message) -> Result<(), SinkError> {
        self.batch.push(message);
        Ok(())
    }

    fn snapshot(&self) -> BatchSnapshot {
        self.batch.snapshot()
    }

    fn swap_and_close(&mut self, now: Timestamp) -> Result<ClosedBatch, SinkError> {
        let closed = std::mem::replace(&mut self.batch, Batch::open(now));
        Ok(closed.close(now))
    }
}

// ============================================================================
// DurableBatchStore
// ============================================================================

/// File name of a sealed segment: `{base}.{seq:08x}.sealed`
pub fn sealed_name(base: &str, sequence: u64) -> String {
    format!("{}.{:08x}{}", base, sequence, SEALED_SUFFIX)
}

/// Sequence number of a sealed segment belonging to `base`
pub fn parse_sealed_sequence(base: &str, name: &str) -> Option<u64> {
    let rest = name.strip_prefix(base)?.strip_prefix('.')?;
    let hex = rest.strip_suffix(SEALED_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

pub struct DurableBatchStore<S: LogStore> {
    store: S,
    base: String,
    writer: LogWriter<S::Writer>,
    batch: Batch,
    fsync: FsyncPolicy,
    unsynced: bool,
}

impl<S: LogStore> DurableBatchStore<S> {
    /// Open the log named `base` in `store`, recovering whatever a previous
    /// run left behind.
    ///
    /// Returns the store, ready for appends, and the recovered batches oldest
    /// first. Each recovered batch stays on disk until it is released.
    pub fn open(
        store: S,
        base: &str,
        fsync: FsyncPolicy,
        now: Timestamp,
    ) -> Result<(Self, Vec<ClosedBatch>), LogError> {
        let names = store.list()?;

        let mut sealed: Vec<(u64, String)> = names
            .iter()
            .filter_map(|name| parse_sealed_sequence(base, name).map(|seq| (seq, name.clone())))
            .collect();
        sealed.sort();

        let mut next_sequence = sealed.last().map(|(seq, _)| seq + 1).unwrap_or(1);
        let mut recovered = Vec::new();

        for (_, name) in &sealed {
            let messages = read_segment(&store, name)?;
            if messages.is_empty() {
                store.delete(name)?;
                continue;
            }
            recovered.push(recovered_batch(messages, now, name.clone()));
        }

        if store.exists(base)? {
            let reader = LogReader::open(store.open_read(base)?)?;
            next_sequence = next_sequence.max(reader.sequence());
            let messages = read_messages(&reader, base)?;
            if !messages.is_empty() {
                let name = sealed_name(base, next_sequence);
                store.rename(base, &name)?;
                next_sequence += 1;
                recovered.push(recovered_batch(messages, now, name));
            }
        }

        let writer = LogWriter::new(store.create(base)?, next_sequence)?;

        if !recovered.is_empty() {
            info!(
                batches = recovered.len(),
                messages = recovered.iter().map(ClosedBatch::len).sum::<usize>(),
                "Recovered buffered messages from disk"
            );
        }

        Ok((
            DurableBatchStore {
                store,
                base: base.to_string(),
                writer,
                batch: Batch::open(now),
                fsync,
                unsynced: false,
            },
            recovered,
        ))
    }
}

fn read_segment<S: LogStore>(store: &S, name: &str) -> Result<Vec<Message>, LogError> {
    let reader = LogReader::open(store.open_read(name)?)?;
    read_messages(&reader, name)
}

fn read_messages(reader: &LogReader, name: &str) -> Result<Vec<Message>, LogError> {
    let log = reader.records()?;
    if log.torn_tail_bytes > 0 {
        warn!(
            file = name,
            dropped_bytes = log.torn_tail_bytes,
            "Dropping torn record at end of log"
        );
    }
    log.records.iter().map(LogRecord::to_message).collect()
}

fn recovered_batch(messages: Vec<Message>, now: Timestamp, segment: String) -> ClosedBatch {
    let opened_at = messages.first().map(|m| m.received_at).unwrap_or(now);
    ClosedBatch {
        messages,
        opened_at,
        closed_at: now,
        segment: Some(segment),
    }
}

impl<S: LogStore> BatchStore for DurableBatchStore<S> {
    fn append(&mut self, message: Message) -> Result<(), SinkError> {
        let record = LogRecord::from_message(&message)?;
        self.writer.append(&record)?;
        match self.fsync {
            FsyncPolicy::Always => self.writer.sync()?,
            FsyncPolicy::EverySecond => self.unsynced = true,
            FsyncPolicy::No => {}
        }
        self.batch.push(message);
        Ok(())
    }

    fn snapshot(&self) -> BatchSnapshot {
        self.batch.snapshot()
    }

    fn swap_and_close(&mut self, now: Timestamp) -> Result<ClosedBatch, SinkError> {
        if self.batch.is_empty() {
            let closed = std::mem::replace(&mut self.batch, Batch::open(now));
            return Ok(closed.close(now));
        }

        self.writer.sync()?;
        self.unsynced = false;

        let sequence = self.writer.sequence();
        let (records, bytes) = (self.writer.record_count(), self.writer.size());
        let sealed = sealed_name(&self.base, sequence);
        self.store.rename(&self.base, &sealed)?;
        self.writer = LogWriter::new(self.store.create(&self.base)?, sequence + 1)?;

        debug!(segment = %sealed, records, bytes, "Sealed log segment");

        let closed = std::mem::replace(&mut self.batch, Batch::open(now));
        let mut closed = closed.close(now);
        closed.segment = Some(sealed);
        Ok(closed)
    }

    fn sync(&mut self) -> Result<(), SinkError> {
        if self.unsynced {
            self.writer.sync()?;
            self.unsynced = false;
        }
        Ok(())
    }

    fn release(&mut self, batch: &ClosedBatch) -> Result<(), SinkError> {
        if let Some(segment) = batch.segment() {
            self.store.delete(segment)?;
            debug!(segment, "Released log segment");
        }
        Ok(())
    }
}
