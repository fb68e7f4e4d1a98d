//! 🎬 *[camera pans across a queue of log lines]*
//! 🎬 "In a world where the logging thread must never wait..."
//! 🎬 "One batcher dared to do the waiting for it."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Bulk Batcher, part buffer, part courier, part that one coworker who
//! insists on staying until every ticket is closed before going home.
//!
//! 🧠 Knowledge graph:
//! - State machine: `Created → Running → Stopping → Stopped`. No shortcuts back.
//! - `start()` spawns exactly one worker: an OS thread running a single-threaded tokio
//!   runtime. It owns the index client. Nobody else touches the network.
//! - `enqueue()` is a `try_send` on a bounded channel. Full channel? The document is
//!   shed and counted. The logging thread never waits on us.
//! - `stop()` fixes a drain deadline of `max_attempts × (retry_delay + request_timeout)`,
//!   closes the channel and joins the worker. The worker sends what is left until the
//!   deadline, counts the rest abandoned, then flushes and closes the client.
//!
//! ⚠️ `stop()` blocks the calling thread. Call it from async code via `spawn_blocking`.

mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::app_config::RuntimeConfig;
use crate::backends::ClientBackend;
use crate::common::PendingDocument;
use worker::{BulkWorker, WorkerSettings};

/// 🚦 Where the batcher is in life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// 💀 Why a document was not even let into the queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    #[error("💀 The batcher is {0:?}; documents are only accepted while it is Running")]
    NotRunning(BatcherState),
}

/// 📬 What happened to a document handed to `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Accepted,
    /// 🗑️ Queue was full. Dropped on the floor, counted, reported by the worker.
    Shed,
}

/// 📊 A point-in-time look at the pipeline counters.
///
/// `accepted = indexed + rejected + abandoned + in_flight()`. Shed documents were
/// never accepted, so they sit outside that equation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub accepted: u64,
    pub shed: u64,
    pub indexed: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub attempts: u64,
}

impl SinkStats {
    /// 🧮 Accepted but not yet settled one way or another.
    pub fn in_flight(&self) -> u64 {
        self.accepted
            .saturating_sub(self.indexed + self.rejected + self.abandoned)
    }
}

/// 🏁 The receipt handed back by a completed drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub stats: SinkStats,
    pub elapsed: Duration,
}

/// 🔢 Shared between the enqueuing threads and the worker. Relaxed everywhere:
/// the numbers are for humans and reports, not for synchronization.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    accepted: AtomicU64,
    shed: AtomicU64,
    shed_unreported: AtomicU64,
    indexed: AtomicU64,
    rejected: AtomicU64,
    abandoned: AtomicU64,
    attempts: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn snapshot(&self) -> SinkStats {
        SinkStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_indexed(&self, n: u64) {
        self.indexed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_abandoned(&self, n: u64) {
        self.abandoned.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// 🗑️ How many were shed since the worker last asked. Resets the tally.
    pub(crate) fn take_unreported_shed(&self) -> u64 {
        self.shed_unreported.swap(0, Ordering::Relaxed)
    }
}

/// 📦 The Bulk Batcher. See the module docs for the full soap opera.
#[derive(Debug)]
pub(crate) struct BulkBatcher {
    state: Mutex<BatcherState>,
    tx: Sender<PendingDocument>,
    /// 🔒 The receiver and client wait here until `start()` hands them to the worker.
    parked: Mutex<Option<(Receiver<PendingDocument>, ClientBackend)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<PipelineCounters>,
    settings: WorkerSettings,
    /// 🏁 Written once by `stop()`, read by the worker when it starts draining.
    drain_deadline: Arc<OnceLock<Instant>>,
    started_at: Mutex<Option<Instant>>,
}

// -- 🔓 a poisoned lock here only means some other thread panicked mid-update of a tiny enum
// -- or an Option; the data is still coherent, so take it and keep going
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BulkBatcher {
    /// 🏗️ A batcher in `Created`: queue allocated, client parked, no thread yet.
    pub(crate) fn new(
        client: ClientBackend,
        runtime: RuntimeConfig,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        let runtime = runtime.sanitized();
        let (tx, rx) = async_channel::bounded(runtime.queue_capacity);
        Self {
            state: Mutex::new(BatcherState::Created),
            tx,
            parked: Mutex::new(Some((rx, client))),
            worker: Mutex::new(None),
            counters: Arc::new(PipelineCounters::default()),
            settings: WorkerSettings::new(&runtime, retry_delay, request_timeout),
            drain_deadline: Arc::new(OnceLock::new()),
            started_at: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> BatcherState {
        *lock(&self.state)
    }

    pub(crate) fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }

    /// 🚀 `Created → Running`. Launches the one and only worker thread.
    pub(crate) fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != BatcherState::Created {
            anyhow::bail!("💀 The batcher can only start once, and it is already {:?}", *state);
        }
        let (rx, client) = lock(&self.parked)
            .take()
            .context("💀 The batcher lost its queue before it even started")?;

        let worker = BulkWorker::new(
            rx,
            client,
            self.settings.clone(),
            Arc::clone(&self.counters),
            Arc::clone(&self.drain_deadline),
        );
        let handle = std::thread::Builder::new()
            .name("elastilog-bulk".to_string())
            .spawn(move || run_worker(worker))
            .context("💀 The OS would not give us a thread for the bulk worker")?;

        *lock(&self.worker) = Some(handle);
        *lock(&self.started_at) = Some(Instant::now());
        *state = BatcherState::Running;
        debug!("🧵 Bulk batcher running");
        Ok(())
    }

    /// 📥 Hand a document to the worker. Never blocks, never waits for the network.
    pub(crate) fn enqueue(&self, doc: PendingDocument) -> Result<Enqueued, EnqueueError> {
        let state = self.state();
        if state != BatcherState::Running {
            return Err(EnqueueError::NotRunning(state));
        }

        // -- counted before the send so the worker can never settle a document that
        // -- was not yet accepted
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(doc) {
            Ok(()) => Ok(Enqueued::Accepted),
            Err(TrySendError::Full(_)) => {
                self.counters.accepted.fetch_sub(1, Ordering::Relaxed);
                self.counters.shed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .shed_unreported
                    .fetch_add(1, Ordering::Relaxed);
                Ok(Enqueued::Shed)
            }
            Err(TrySendError::Closed(_)) => {
                // -- 🏁 lost the race with stop(), the door closed as we walked up to it
                self.counters.accepted.fetch_sub(1, Ordering::Relaxed);
                Err(EnqueueError::NotRunning(self.state()))
            }
        }
    }

    /// 🛑 `Running → Stopping → Stopped`. Blocks until the worker has drained everything
    /// or the drain deadline has passed, whichever comes first.
    ///
    /// Returns `None` when someone else already stopped (or is stopping) the batcher.
    /// Stopping a batcher that never started just marks it `Stopped`.
    pub(crate) fn stop(&self) -> Option<DrainReport> {
        {
            let mut state = lock(&self.state);
            match *state {
                BatcherState::Running => *state = BatcherState::Stopping,
                BatcherState::Created => {
                    *state = BatcherState::Stopped;
                    self.tx.close();
                    return Some(DrainReport {
                        stats: self.stats(),
                        elapsed: Duration::ZERO,
                    });
                }
                BatcherState::Stopping | BatcherState::Stopped => return None,
            }
        }

        let began = Instant::now();
        // -- only the Running → Stopping transition gets here, so the cell is still empty
        let deadline = began + self.settings.drain_budget();
        let _ = self.drain_deadline.set(deadline);
        // -- 🚪 no new documents; the worker still sees everything already in the channel
        self.tx.close();

        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                error!("💀 The bulk worker panicked during drain. What it held is gone.");
                let stats = self.stats();
                self.counters.add_abandoned(stats.in_flight());
            }
        }

        *lock(&self.state) = BatcherState::Stopped;
        let stats = self.stats();
        let started_at = *lock(&self.started_at);
        let lifetime = started_at.map(|t| t.elapsed()).unwrap_or_default();
        info!(
            "🏁 Bulk batcher stopped after {:?} (drain took {:?}): {} accepted, {} indexed, \
             {} rejected, {} abandoned, {} shed",
            lifetime,
            began.elapsed(),
            stats.accepted,
            stats.indexed,
            stats.rejected,
            stats.abandoned,
            stats.shed
        );
        Some(DrainReport {
            stats,
            elapsed: began.elapsed(),
        })
    }
}

/// 🧵 Body of the worker thread: one current-thread runtime, one worker, one job.
fn run_worker(worker: BulkWorker) {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(worker.run()),
        Err(err) => {
            // -- 💀 no runtime, no network; whatever was queued can only be counted as lost
            error!("💀 The bulk worker could not build its runtime: {err}");
            worker.abandon_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender_config::AppenderConfig;
    use crate::backends::in_mem::{InMemoryClient, Scripted};
    use crate::backends::{BulkItem, BulkResponse};
    use crate::common::{Level, LogEvent};
    use crate::transforms::ElasticsearchBulk;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// 🧪 Fixed clock, so every `event {n}` with a single digit renders to the same size.
    fn doc(n: usize) -> PendingDocument {
        let config = AppenderConfig::new("logs", "log").expect("valid config");
        let stamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = LogEvent::new(Level::Info, format!("event {n}")).with_timestamp(stamp);
        PendingDocument::from_event(&config, &event).expect("valid doc")
    }

    fn runtime(max_batch_docs: usize, max_attempts: u32) -> RuntimeConfig {
        RuntimeConfig {
            queue_capacity: 1024,
            max_batch_docs,
            max_batch_bytes: 1024 * 1024,
            // -- ⏱️ long interval: only size triggers and stop() ship unless a test overrides it
            flush_interval_ms: 60_000,
            max_attempts,
        }
    }

    fn batcher(client: &InMemoryClient, runtime: RuntimeConfig, retry: Duration) -> BulkBatcher {
        let backend = ClientBackend::InMemory(client.clone());
        BulkBatcher::new(backend, runtime, retry, REQUEST_TIMEOUT)
    }

    fn messages_in(payloads: &[String]) -> Vec<String> {
        payloads
            .iter()
            .flat_map(|p| p.lines().skip(1).step_by(2).map(str::to_string).collect::<Vec<_>>())
            .map(|source| {
                let value: serde_json::Value = serde_json::from_str(&source).expect("json source");
                value["message"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    /// ⏳ Poll until `done` holds. The worker lives on its own thread, so we just wait.
    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let give_up = Instant::now() + Duration::from_secs(3);
        while !done() {
            assert!(Instant::now() < give_up, "gave up waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn the_one_where_every_document_arrives_exactly_once() {
        let client = InMemoryClient::new();
        let batcher = batcher(&client, runtime(4, 3), Duration::ZERO);
        batcher.start().expect("start");
        assert_eq!(batcher.state(), BatcherState::Running);

        for n in 0..10 {
            assert_eq!(batcher.enqueue(doc(n)), Ok(Enqueued::Accepted));
        }
        let report = batcher.stop().expect("first stop reports");

        assert_eq!(batcher.state(), BatcherState::Stopped);
        assert_eq!(report.stats.accepted, 10);
        assert_eq!(report.stats.indexed, 10);
        assert_eq!(report.stats.in_flight(), 0);

        let payloads = client.received.blocking_lock().clone();
        let expected: Vec<String> = (0..10).map(|n| format!("event {n}")).collect();
        assert_eq!(messages_in(&payloads), expected, "in order, once each, nobody left behind");
        assert!(payloads.iter().all(|p| p.lines().count() <= 8), "batches of at most 4 docs");
        assert!(*client.flushed.blocking_lock());
        assert!(*client.closed.blocking_lock());
    }

    #[test]
    fn the_one_where_enqueue_before_start_and_after_stop_is_refused() {
        let batcher = batcher(&InMemoryClient::new(), runtime(4, 3), Duration::ZERO);
        assert_eq!(
            batcher.enqueue(doc(0)),
            Err(EnqueueError::NotRunning(BatcherState::Created))
        );

        batcher.start().expect("start");
        assert!(batcher.start().is_err(), "one worker per batcher, no sequels");
        batcher.stop().expect("stop");
        assert_eq!(
            batcher.enqueue(doc(1)),
            Err(EnqueueError::NotRunning(BatcherState::Stopped))
        );
        assert!(batcher.stop().is_none(), "second stop is a no-op");
    }

    #[test]
    fn the_one_where_a_transient_failure_is_retried_and_recovers() {
        let client = InMemoryClient::scripted([
            Scripted::Fail("connection reset".to_string()),
            Scripted::Fail("connection reset again".to_string()),
        ]);
        let batcher = batcher(&client, runtime(100, 3), Duration::ZERO);
        batcher.start().expect("start");
        for n in 0..5 {
            batcher.enqueue(doc(n)).expect("accepted");
        }
        let report = batcher.stop().expect("stop");

        assert_eq!(report.stats.indexed, 5);
        assert_eq!(report.stats.abandoned, 0);
        assert_eq!(report.stats.attempts, 3);
        assert_eq!(*client.calls.blocking_lock(), 3);
        assert_eq!(client.received.blocking_lock().len(), 1, "delivered once, after two misses");
    }

    #[test]
    fn the_one_where_the_backend_never_answers_and_stop_still_returns() {
        let client =
            InMemoryClient::scripted((0..100).map(|n| Scripted::Fail(format!("still down #{n}"))));
        let batcher = batcher(&client, runtime(100, 2), Duration::from_millis(5));
        batcher.start().expect("start");
        for n in 0..7 {
            batcher.enqueue(doc(n)).expect("accepted");
        }
        let report = batcher.stop().expect("stop");

        assert_eq!(report.stats.indexed, 0);
        assert_eq!(report.stats.abandoned, 7);
        assert_eq!(report.stats.in_flight(), 0, "nothing left in the queue after the drain");
        assert_eq!(*client.calls.blocking_lock(), 2, "exactly max_attempts tries, then give up");
        assert!(*client.closed.blocking_lock());
    }

    #[test]
    fn the_one_where_a_hanging_cluster_cannot_stretch_shutdown_past_its_budget() {
        // -- 🐌 every request hangs for a full timeout; six one-doc batches would take 12 of them
        let hang = Duration::from_millis(150);
        let client = InMemoryClient::scripted((0..50).map(|_| Scripted::Stall(hang)));
        let backend = ClientBackend::InMemory(client.clone());
        let batcher = BulkBatcher::new(backend, runtime(1, 2), Duration::ZERO, hang);
        batcher.start().expect("start");
        for n in 0..6 {
            batcher.enqueue(doc(n)).expect("accepted");
        }

        let began = Instant::now();
        let report = batcher.stop().expect("stop");
        let took = began.elapsed();

        // -- budget is 2 × (0 + 150ms); anything near 12 × 150ms means the drain ignored it
        assert!(took < Duration::from_millis(1_000), "shutdown took {took:?}");
        assert_eq!(report.stats.abandoned, 6);
        assert_eq!(report.stats.in_flight(), 0);
        assert!(report.stats.attempts <= 3, "attempts: {}", report.stats.attempts);
        assert!(client.received.blocking_lock().is_empty());
        assert!(*client.closed.blocking_lock(), "a cut-short drain still closes the client");
    }

    #[test]
    fn the_one_where_only_the_busy_items_go_around_again() {
        let item = |status: u16| {
            let item = BulkItem {
                status,
                error: None,
            };
            HashMap::from([("index".to_string(), item)])
        };
        let partial = BulkResponse {
            errors: true,
            items: vec![item(201), item(400), item(429)],
        };
        let client = InMemoryClient::scripted([Scripted::Respond(partial)]);
        let batcher = batcher(&client, runtime(100, 3), Duration::ZERO);
        batcher.start().expect("start");
        for n in 0..3 {
            batcher.enqueue(doc(n)).expect("accepted");
        }
        let report = batcher.stop().expect("stop");

        assert_eq!(report.stats.indexed, 2);
        assert_eq!(report.stats.rejected, 1, "the malformed one is dropped, not retried");
        assert_eq!(report.stats.abandoned, 0);

        let payloads = client.received.blocking_lock().clone();
        assert_eq!(payloads.len(), 2);
        assert_eq!(messages_in(&payloads[1..]), vec!["event 2".to_string()]);
    }

    #[test]
    fn the_one_where_the_interval_ships_without_anyone_calling_stop() {
        let client = InMemoryClient::new();
        let config = RuntimeConfig {
            flush_interval_ms: 50,
            ..runtime(100, 3)
        };
        let batcher = batcher(&client, config, Duration::ZERO);
        batcher.start().expect("start");
        batcher.enqueue(doc(0)).expect("accepted");

        wait_for("the interval flush", || client.received.blocking_lock().len() == 1);
        assert_eq!(batcher.state(), BatcherState::Running);
        assert_eq!(batcher.stats().indexed, 1);
        assert_eq!(messages_in(&client.received.blocking_lock()), vec!["event 0".to_string()]);
        batcher.stop().expect("stop");
    }

    #[test]
    fn the_one_where_the_byte_limit_cuts_the_batches() -> Result<()> {
        let entry_bytes = ElasticsearchBulk::transform_document(&doc(0))?.len() + 1;
        let client = InMemoryClient::new();
        let config = RuntimeConfig {
            max_batch_bytes: 2 * entry_bytes,
            ..runtime(100, 3)
        };
        let batcher = batcher(&client, config, Duration::ZERO);
        batcher.start().expect("start");
        for n in 0..6 {
            batcher.enqueue(doc(n)).expect("accepted");
        }
        let report = batcher.stop().expect("stop");

        let payloads = client.received.blocking_lock().clone();
        assert_eq!(payloads.len(), 3, "two documents fit per batch, never three");
        assert!(payloads.iter().all(|p| p.len() <= 2 * entry_bytes));
        let expected: Vec<String> = (0..6).map(|n| format!("event {n}")).collect();
        assert_eq!(messages_in(&payloads), expected);
        assert_eq!(report.stats.indexed, 6);
        Ok(())
    }

    #[test]
    fn the_one_where_a_failed_batch_is_retried_while_still_running() {
        let client = InMemoryClient::scripted([Scripted::Fail("blip".to_string())]);
        let config = RuntimeConfig {
            flush_interval_ms: 50,
            ..runtime(100, 3)
        };
        let batcher = batcher(&client, config, Duration::from_millis(100));
        batcher.start().expect("start");
        batcher.enqueue(doc(0)).expect("accepted");

        wait_for("the retry to land", || client.received.blocking_lock().len() == 1);
        assert_eq!(batcher.state(), BatcherState::Running, "retried before any stop()");
        assert_eq!(*client.calls.blocking_lock(), 2);
        let stats = batcher.stats();
        assert_eq!((stats.indexed, stats.attempts), (1, 2));
        batcher.stop().expect("stop");
    }

    #[test]
    fn the_one_where_a_size_flush_restarts_the_interval() {
        let client = InMemoryClient::new();
        let config = RuntimeConfig {
            flush_interval_ms: 600,
            ..runtime(2, 3)
        };
        let batcher = batcher(&client, config, Duration::ZERO);
        batcher.start().expect("start");

        // -- ⏱️ t≈300ms: a size flush, then one straggler. The old tick was due at 600ms;
        // -- after the restart the next one is due at ≈900ms.
        std::thread::sleep(Duration::from_millis(300));
        for n in 0..3 {
            batcher.enqueue(doc(n)).expect("accepted");
        }
        wait_for("the size flush", || client.received.blocking_lock().len() == 1);
        std::thread::sleep(Duration::from_millis(450));
        assert_eq!(
            client.received.blocking_lock().len(),
            1,
            "the straggler waits a full interval after the size flush"
        );

        wait_for("the interval flush", || client.received.blocking_lock().len() == 2);
        assert_eq!(batcher.state(), BatcherState::Running);
        batcher.stop().expect("stop");
    }

    #[test]
    fn the_one_where_a_full_queue_sheds_instead_of_blocking() {
        let config = RuntimeConfig {
            queue_capacity: 2,
            ..runtime(100, 1)
        };
        let batcher = batcher(&InMemoryClient::new(), config, Duration::ZERO);
        batcher.start().expect("start");

        // -- 🧪 the worker may or may not be fast enough to keep up; either way nothing blocks
        let began = Instant::now();
        let outcomes: Vec<Enqueued> = (0..500)
            .map(|n| batcher.enqueue(doc(n)).expect("running batcher never refuses"))
            .collect();
        assert!(began.elapsed() < Duration::from_secs(5));

        let report = batcher.stop().expect("stop");
        let shed = outcomes.iter().filter(|o| **o == Enqueued::Shed).count() as u64;
        assert_eq!(report.stats.shed, shed);
        assert_eq!(report.stats.accepted + report.stats.shed, 500);
        assert_eq!(report.stats.indexed, report.stats.accepted);
    }

    #[test]
    fn the_one_where_a_never_started_batcher_stops_quietly() {
        let batcher = batcher(&InMemoryClient::new(), runtime(4, 3), Duration::ZERO);
        let report = batcher.stop().expect("created → stopped reports empty");
        assert_eq!(report.stats, SinkStats::default());
        assert_eq!(batcher.state(), BatcherState::Stopped);
        assert!(batcher.start().is_err());
    }
}
