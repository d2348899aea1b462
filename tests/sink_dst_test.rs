//! Sink DST Integration Tests
//!
//! Multi-seed simulations of a broker feeding the sink. Each seed drives a
//! random mix of fresh deliveries, redeliveries, clock jumps, transient
//! upload failures and (in disk mode) crashes, then checks the delivery
//! guarantees against everything that reached the object store.

use flate2::read::GzDecoder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read};
use std::time::Duration;
use topic_archiver::broker::AckLedger;
use topic_archiver::object_store::FailingObjectStore;
use topic_archiver::wal::InMemoryLogStore;
use topic_archiver::{
    Clock, Disposition, FlushPolicy, InMemoryObjectStore, Message, ObjectStore, Orchestrator,
    SimulatedClock, SinkConfig, SinkError,
};

type Sink = Orchestrator<FailingObjectStore<InMemoryObjectStore>, SimulatedClock>;

#[derive(Debug, Clone, Copy)]
struct SinkDSTConfig {
    steps: usize,
    flush: FlushPolicy,
    /// Per-step probability of arming one transient upload failure
    failure_rate: f64,
    /// Per-step probability of a crash and restart (disk mode only)
    crash_rate: f64,
    durable: bool,
}

impl SinkDSTConfig {
    fn memory() -> Self {
        SinkDSTConfig {
            steps: 300,
            flush: FlushPolicy {
                max_messages: 8,
                max_seconds: 30,
                max_in_flight: 0,
                max_in_flight_seconds: 0,
            },
            failure_rate: 0.05,
            crash_rate: 0.0,
            durable: false,
        }
    }

    fn durable() -> Self {
        SinkDSTConfig {
            crash_rate: 0.02,
            durable: true,
            ..Self::memory()
        }
    }
}

#[derive(Debug, Default)]
struct SinkDSTResult {
    seed: u64,
    delivered: usize,
    flushes: u64,
    crashes: usize,
    fatal_restarts: usize,
    violations: Vec<String>,
}

impl SinkDSTResult {
    fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

struct Harness {
    config: SinkDSTConfig,
    clock: SimulatedClock,
    ledger: AckLedger,
    objects: InMemoryObjectStore,
    failing: FailingObjectStore<InMemoryObjectStore>,
    logs: InMemoryLogStore,
    sink: Option<Sink>,
    /// Keys acked only because a duplicate delivery was acked
    dup_acked: HashSet<String>,
    keys: Vec<String>,
    fatal_restarts: usize,
}

impl Harness {
    async fn new(config: SinkDSTConfig) -> Self {
        let objects = InMemoryObjectStore::new();
        let mut harness = Harness {
            config,
            clock: SimulatedClock::new(1_700_000_000_000),
            ledger: AckLedger::new(),
            failing: FailingObjectStore::new(objects.clone()),
            objects,
            logs: InMemoryLogStore::new(),
            sink: None,
            dup_acked: HashSet::new(),
            keys: Vec::new(),
            fatal_restarts: 0,
        };
        harness.restart().await;
        harness
    }

    async fn restart(&mut self) {
        let sink_config = SinkConfig::test("dst", self.config.flush);
        let sink = if self.config.durable {
            // Recovery must not be starved by an armed failure
            self.failing.heal();
            Orchestrator::start_durable(
                sink_config,
                self.failing.clone(),
                self.clock.clone(),
                self.logs.clone(),
                "dst.log",
            )
            .await
        } else {
            Orchestrator::start(sink_config, self.failing.clone(), self.clock.clone()).await
        };
        self.sink = Some(sink.unwrap_or_else(|e| panic!("sink failed to start: {}", e)));
    }

    fn sink(&self) -> &Sink {
        self.sink.as_ref().unwrap()
    }

    /// A fatal error ends the process; a supervisor starts it again.
    async fn settle(&mut self, outcome: Result<(), SinkError>) {
        if let Err(e) = outcome {
            if e.is_fatal() {
                self.sink = None;
                self.fatal_restarts += 1;
                self.restart().await;
            }
        }
    }

    async fn deliver(&mut self, key: &str) {
        let message = Message::new(key, key.to_string(), self.clock.now(), self.ledger.handle(key));
        let already_acked = self.ledger.ack_count(key) > 0;
        let received = self.sink().receive(message).await;
        let outcome = match received {
            Ok(Disposition::Acked) => {
                if !already_acked {
                    self.dup_acked.insert(key.to_string());
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        self.settle(outcome).await;
    }

    fn unacked(&self) -> Vec<String> {
        self.keys
            .iter()
            .filter(|k| self.ledger.ack_count(k) == 0)
            .cloned()
            .collect()
    }

    async fn step(&mut self, rng: &mut StdRng, result: &mut SinkDSTResult) {
        let roll: f64 = rng.gen();
        if roll < self.config.crash_rate {
            self.sink = None;
            self.logs.simulate_crash();
            result.crashes += 1;
            self.restart().await;
            return;
        }
        if roll < self.config.crash_rate + self.config.failure_rate {
            self.failing.fail_next(1, ErrorKind::TimedOut);
            return;
        }

        match rng.gen_range(0..10) {
            0..=5 => {
                let key = format!("k{}", self.keys.len());
                self.keys.push(key.clone());
                result.delivered += 1;
                self.deliver(&key).await;
            }
            6..=7 => {
                let pending = self.unacked();
                if !pending.is_empty() {
                    let key = pending[rng.gen_range(0..pending.len())].clone();
                    self.deliver(&key).await;
                }
            }
            _ => {
                self.clock.advance_secs(rng.gen_range(0..20));
                let outcome = self.sink().flush_if_due().await.map(|_| ());
                self.settle(outcome).await;
            }
        }
    }

    /// Heal the store and keep redelivering until every key is acked.
    async fn drain(&mut self) -> Result<(), String> {
        self.failing.heal();
        for _ in 0..5 {
            let pending = self.unacked();
            if pending.is_empty() {
                break;
            }
            for key in pending {
                // A flush earlier in this pass may have archived it already
                if self.ledger.ack_count(&key) > 0 {
                    continue;
                }
                self.deliver(&key).await;
            }
            self.clock.advance_secs(self.config.flush.max_seconds + 1);
            self.sink()
                .flush_if_due()
                .await
                .map_err(|e| format!("flush after heal failed: {}", e))?;
        }
        self.sink()
            .shutdown(Duration::from_secs(5))
            .await
            .map_err(|e| format!("shutdown failed: {}", e))?;
        Ok(())
    }

    async fn stored(&self) -> HashMap<String, usize> {
        let mut seen = HashMap::new();
        for meta in self.objects.list("").await.unwrap() {
            let data = self.objects.get(&meta.key).await.unwrap();
            let mut text = String::new();
            GzDecoder::new(&data[..]).read_to_string(&mut text).unwrap();
            for line in text.lines() {
                *seen.entry(line.to_string()).or_insert(0) += 1;
            }
        }
        seen
    }

    async fn check(&self, result: &mut SinkDSTResult) {
        let stored = self.stored().await;

        for key in &self.keys {
            let acked = self.ledger.ack_count(key) > 0;
            let copies = stored.get(key).copied().unwrap_or(0);
            if !acked {
                result.violations.push(format!("{} never acked", key));
            }
            if acked && copies == 0 && !self.dup_acked.contains(key) {
                result.violations.push(format!("{} acked but not stored", key));
            }
            if !self.config.durable && copies > 1 {
                result
                    .violations
                    .push(format!("{} stored {} times without a crash", key, copies));
            }
        }

        for key in stored.keys() {
            if !self.keys.contains(key) {
                result.violations.push(format!("unknown line {:?} stored", key));
            }
        }
    }
}

async fn run_sink_dst(seed: u64, config: SinkDSTConfig) -> SinkDSTResult {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut harness = Harness::new(config).await;
    let mut result = SinkDSTResult {
        seed,
        ..Default::default()
    };

    for _ in 0..config.steps {
        harness.step(&mut rng, &mut result).await;
    }
    if let Err(e) = harness.drain().await {
        result.violations.push(e);
    }
    result.flushes = harness.sink().stats().flushes;
    result.fatal_restarts = harness.fatal_restarts;
    harness.check(&mut result).await;
    result
}

async fn run_seeds(seeds: std::ops::Range<u64>, config: SinkDSTConfig) -> Vec<SinkDSTResult> {
    let mut results = Vec::new();
    for seed in seeds {
        results.push(run_sink_dst(seed, config).await);
    }
    results
}

fn assert_all_passed(results: &[SinkDSTResult]) {
    for r in results {
        assert!(
            r.passed(),
            "Seed {} failed after {} deliveries, {} crashes, {} fatal restarts: {:?}",
            r.seed,
            r.delivered,
            r.crashes,
            r.fatal_restarts,
            r.violations
        );
    }
}

// =============================================================================
// Memory mode
// =============================================================================

#[tokio::test]
async fn test_sink_dst_50_seeds_memory() {
    // INVARIANT: every message is eventually acked, acked messages are stored,
    // and nothing is stored twice when the process never crashes.
    let results = run_seeds(0..50, SinkDSTConfig::memory()).await;
    assert_all_passed(&results);
    assert!(results.iter().all(|r| r.flushes > 0));
}

#[tokio::test]
async fn test_sink_dst_no_failures_every_batch_within_limit() {
    let config = SinkDSTConfig {
        failure_rate: 0.0,
        ..SinkDSTConfig::memory()
    };
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut harness = Harness::new(config).await;
        let mut result = SinkDSTResult {
            seed,
            ..Default::default()
        };
        for _ in 0..config.steps {
            harness.step(&mut rng, &mut result).await;
        }
        harness.drain().await.unwrap();

        for meta in harness.objects.list("").await.unwrap() {
            let data = harness.objects.get(&meta.key).await.unwrap();
            let mut text = String::new();
            GzDecoder::new(&data[..]).read_to_string(&mut text).unwrap();
            assert!(
                text.lines().count() as u64 <= config.flush.max_messages,
                "Seed {}: {} exceeds the count threshold",
                seed,
                meta.key
            );
        }
        assert_eq!(harness.sink().stats().failed_uploads, 0);
    }
}

// =============================================================================
// Disk mode with crashes
// =============================================================================

#[tokio::test]
async fn test_sink_dst_50_seeds_durable_with_crashes() {
    // INVARIANT: across crashes nothing buffered is lost; duplicates are allowed.
    // A failed upload in disk mode ends the process, and the restart re-uploads it.
    let results = run_seeds(0..50, SinkDSTConfig::durable()).await;
    assert_all_passed(&results);
    assert!(results.iter().any(|r| r.fatal_restarts > 0));
}

#[tokio::test]
async fn test_sink_dst_durable_crash_heavy() {
    let config = SinkDSTConfig {
        crash_rate: 0.1,
        steps: 150,
        ..SinkDSTConfig::durable()
    };
    let results = run_seeds(100..120, config).await;
    assert_all_passed(&results);
    assert!(results.iter().any(|r| r.crashes > 0));
}
