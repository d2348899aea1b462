//! Broker-side plumbing
//!
//! The sink core only needs [`AckHandle`](crate::message::AckHandle) from a
//! broker client. This module ships two in-process producers of handles:
//!
//! - [`AckLedger`]: records every settlement, used by tests to check which
//!   deliveries were acknowledged and in what order.
//! - [`LineSource`]: turns a line-delimited reader (stdin in the binary) into
//!   deliveries, one message per line, fanned out to at most `max_in_flight`
//!   concurrent `receive` calls.

use crate::clock::Clock;
use crate::error::SinkError;
use crate::message::{AckHandle, DedupKeySource, Message};
use crate::object_store::ObjectStore;
use crate::orchestrator::{Disposition, Orchestrator};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// AckLedger - recording handles
// ============================================================================

#[derive(Debug, Default)]
struct LedgerState {
    issued: u64,
    acked: Vec<String>,
    requeued: Vec<String>,
}

/// Issues handles that record their settlement. Clones share one ledger.
#[derive(Debug, Clone, Default)]
pub struct AckLedger {
    state: Arc<Mutex<LedgerState>>,
}

struct LedgerHandle {
    id: String,
    state: Arc<Mutex<LedgerState>>,
}

impl AckHandle for LedgerHandle {
    fn ack(self: Box<Self>) {
        self.state.lock().acked.push(self.id);
    }

    fn requeue(self: Box<Self>) {
        self.state.lock().requeued.push(self.id);
    }
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, id: &str) -> Box<dyn AckHandle> {
        self.state.lock().issued += 1;
        Box::new(LedgerHandle {
            id: id.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    /// Acknowledged IDs in settlement order
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    /// Requeued IDs in settlement order
    pub fn requeued(&self) -> Vec<String> {
        self.state.lock().requeued.clone()
    }

    pub fn ack_count(&self, id: &str) -> usize {
        self.state.lock().acked.iter().filter(|a| *a == id).count()
    }

    pub fn requeue_count(&self, id: &str) -> usize {
        self.state.lock().requeued.iter().filter(|r| *r == id).count()
    }

    /// Handles issued but not yet settled (including dropped ones)
    pub fn outstanding(&self) -> u64 {
        let state = self.state.lock();
        state
            .issued
            .saturating_sub((state.acked.len() + state.requeued.len()) as u64)
    }
}

// ============================================================================
// LineSource - line-delimited input
// ============================================================================

/// Settlement counters for a line source
#[derive(Debug, Default)]
pub struct SourceCounters {
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
}

struct LineHandle {
    line: u64,
    counters: Arc<SourceCounters>,
}

impl AckHandle for LineHandle {
    fn ack(self: Box<Self>) {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    fn requeue(self: Box<Self>) {
        // A line reader cannot redeliver
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        warn!(line = self.line, "Line was not archived");
    }
}

/// Final tally of a line source run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSummary {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
}

/// Feeds lines from a reader into an orchestrator.
///
/// The broker ID of a line is its 1-based line number. Empty lines are skipped.
pub struct LineSource<R> {
    reader: R,
    dedup_key: DedupKeySource,
    max_in_flight: usize,
    counters: Arc<SourceCounters>,
}

impl<R: AsyncBufRead + Unpin> LineSource<R> {
    pub fn new(reader: R, dedup_key: DedupKeySource, max_in_flight: usize) -> Self {
        LineSource {
            reader,
            dedup_key,
            max_in_flight: max_in_flight.max(1),
            counters: Arc::new(SourceCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SourceCounters> {
        Arc::clone(&self.counters)
    }

    /// Read until EOF, cancellation, or a sink error.
    ///
    /// A line cannot be redelivered once read, so any failed upload stops the
    /// source with a fatal error instead of requeueing. Read errors are fatal too.
    pub async fn run<O, C>(
        mut self,
        orchestrator: Arc<Orchestrator<O, C>>,
        cancel: CancellationToken,
    ) -> Result<SourceSummary, SinkError>
    where
        O: ObjectStore,
        C: Clock,
    {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let failure: Arc<Mutex<Option<SinkError>>> = Arc::new(Mutex::new(None));
        let mut tasks = JoinSet::new();
        let mut line_no = 0u64;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Line source cancelled");
                    break;
                }
                read = self.reader.read_until(b'\n', &mut line) => read,
            };

            match read {
                Ok(0) => {
                    info!(lines = line_no, "Input exhausted");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, line = line_no + 1, "Failed to read input");
                    failure.lock().get_or_insert(SinkError::Input(e));
                    cancel.cancel();
                    break;
                }
            }
            line_no += 1;

            let body = trim_line_end(&line);
            if body.is_empty() {
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let body = Bytes::copy_from_slice(body);
            let key = self.dedup_key.derive(&line_no.to_string(), &body);
            let handle = Box::new(LineHandle {
                line: line_no,
                counters: Arc::clone(&self.counters),
            });
            let message = Message::new(key, body, orchestrator.now(), handle);
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);

            let orchestrator = Arc::clone(&orchestrator);
            let failure = Arc::clone(&failure);
            let cancel_on_failure = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                match orchestrator.receive(message).await {
                    Ok(Disposition::Acked | Disposition::Deferred | Disposition::Requeue) => {}
                    Err(e) => {
                        error!(
                            error = %e,
                            "Batch not archived and lines cannot be redelivered, stopping input"
                        );
                        failure.lock().get_or_insert(e.into_fatal());
                        cancel_on_failure.cancel();
                    }
                }
            });

            // Reap finished tasks so the set does not grow with the input
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}

        if let Some(e) = failure.lock().take() {
            return Err(e);
        }

        Ok(SourceSummary {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
        })
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_records_settlement_order() {
        let ledger = AckLedger::new();
        let a = ledger.handle("a");
        let b = ledger.handle("b");
        let c = ledger.handle("c");

        b.ack();
        a.ack();
        c.requeue();

        assert_eq!(ledger.acked(), vec!["b", "a"]);
        assert_eq!(ledger.requeued(), vec!["c"]);
        assert_eq!(ledger.ack_count("a"), 1);
        assert_eq!(ledger.requeue_count("c"), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_ledger_counts_dropped_as_outstanding() {
        let ledger = AckLedger::new();
        drop(ledger.handle("x"));
        ledger.handle("y").ack();
        assert_eq!(ledger.outstanding(), 1);
    }

    // ------------------------------------------------------------------------
    // LineSource
    // ------------------------------------------------------------------------

    use crate::clock::SimulatedClock;
    use crate::config::{FlushPolicy, SinkConfig};
    use crate::object_store::{FailingObjectStore, InMemoryObjectStore};
    use flate2::read::GzDecoder;
    use std::io::{ErrorKind, Read};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, BufReader, ReadBuf};

    async fn sink<O: ObjectStore>(
        store: O,
        flush: FlushPolicy,
    ) -> Arc<Orchestrator<O, SimulatedClock>> {
        let config = SinkConfig::test("lines", flush);
        let clock = SimulatedClock::new(1_700_000_000_000);
        Arc::new(Orchestrator::start(config, store, clock).await.unwrap())
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(ErrorKind::BrokenPipe, "producer went away")))
        }
    }

    #[test]
    fn test_trim_line_end() {
        assert_eq!(trim_line_end(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_end(b"abc"), b"abc");
        assert_eq!(trim_line_end(b"\n"), b"");
    }

    #[tokio::test]
    async fn test_failed_upload_stops_line_source() {
        let store = FailingObjectStore::new(InMemoryObjectStore::new());
        store.fail_next(1, ErrorKind::TimedOut);
        let orchestrator = sink(store.clone(), FlushPolicy::messages(2)).await;

        let source = LineSource::new(&b"a\nb\nc\nd\n"[..], DedupKeySource::BrokerId, 1);
        let counters = source.counters();
        let err = source
            .run(orchestrator, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::UploadFatal { .. }));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 2);
        assert_eq!(counters.requeued.load(Ordering::Relaxed), 2);
        assert_eq!(counters.acked.load(Ordering::Relaxed), 0);
        assert!(store.inner().is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_lines_are_archived() {
        let store = InMemoryObjectStore::new();
        let orchestrator = sink(store.clone(), FlushPolicy::messages(100)).await;

        let input: &[u8] = b"one\n\xff\xfe\ntwo\nthree\n";
        let summary = LineSource::new(input, DedupKeySource::BrokerId, 4)
            .run(Arc::clone(&orchestrator), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.delivered, 4);

        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
        let key = store.keys().remove(0);
        let mut archived = Vec::new();
        GzDecoder::new(&store.get(&key).await.unwrap()[..])
            .read_to_end(&mut archived)
            .unwrap();
        assert_eq!(archived, b"one\n\xff\xfe\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let orchestrator = sink(InMemoryObjectStore::new(), FlushPolicy::messages(10)).await;

        let err = LineSource::new(BufReader::new(BrokenPipe), DedupKeySource::BrokerId, 1)
            .run(orchestrator, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::Input(ref e) if e.kind() == ErrorKind::BrokenPipe));
        assert!(err.is_fatal());
    }
}
