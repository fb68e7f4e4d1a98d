//! 🎬 *[a channel fills with log lines. somewhere, a cluster waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🗑️ The BulkWorker, patient, tireless, and deeply unbothered by the chaos
//! happening upstream. It receives documents. It batches documents. It ships
//! batches. When the cluster says no, it waits `retry_seconds` and asks again,
//! up to `max_attempts` times, and then it lets go. It is, in many ways, the most
//! emotionally stable part of this entire codebase.
//!
//! ⚠️ While a failed batch waits for its retry, newer documents keep flowing.
//! Batches can land out of order. Documents inside one batch never do.
//!
//! 🏁 Once `stop()` closes the queue, the worker stops shipping as it goes. Whatever is
//! left (parked retries, the buffer, the queue) becomes one drain stream, sent oldest
//! first under the deadline `stop()` fixed. A drain batch that runs out of attempts, or
//! the deadline passing, ends the drain; everything still unsent is counted abandoned.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_channel::Receiver;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout_at};
use tracing::{debug, error, trace, warn};

use super::PipelineCounters;
use crate::app_config::RuntimeConfig;
use crate::backends::{ClientBackend, IndexClient, ItemOutcome};
use crate::common::PendingDocument;
use crate::transforms::ElasticsearchBulk;

#[derive(Debug, Clone)]
pub(super) struct WorkerSettings {
    max_batch_docs: usize,
    max_batch_bytes: usize,
    flush_interval: Duration,
    retry_delay: Duration,
    request_timeout: Duration,
    max_attempts: u32,
}

impl WorkerSettings {
    pub(super) fn new(
        runtime: &RuntimeConfig,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            max_batch_docs: runtime.max_batch_docs,
            max_batch_bytes: runtime.max_batch_bytes,
            flush_interval: runtime.flush_interval(),
            retry_delay,
            request_timeout,
            max_attempts: runtime.max_attempts,
        }
    }

    /// ⏳ How long a drain may take: every attempt times out, and every retry waits.
    pub(super) fn drain_budget(&self) -> Duration {
        (self.retry_delay + self.request_timeout).saturating_mul(self.max_attempts)
    }
}

/// 📦 Rendered bulk entries (`action\nsource`) in enqueue order.
#[derive(Debug, Default)]
struct Batch {
    entries: Vec<String>,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, entry: String) {
        self.bytes += entry.len() + 1;
        self.entries.push(entry);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 🔄 A batch sitting out its `retry_delay` before the next attempt.
#[derive(Debug)]
struct ParkedBatch {
    batch: Batch,
    attempts: u32,
    due: Instant,
}

/// 🎯 How one send went, from the batch's point of view.
#[derive(Debug)]
enum Attempted {
    /// Every document is indexed or rejected. Nothing left to do.
    Settled,
    /// Some documents deserve another try, after the retry delay.
    Parked(ParkedBatch),
    /// Out of attempts. The leftovers were counted abandoned.
    GaveUp,
}

#[derive(Debug)]
pub(super) struct BulkWorker {
    rx: Receiver<PendingDocument>,
    client: ClientBackend,
    settings: WorkerSettings,
    counters: Arc<PipelineCounters>,
    /// 🏁 Set by `stop()` right before it closes the queue.
    drain_deadline: Arc<OnceLock<std::time::Instant>>,
    buffer: Batch,
    /// Ordered by `due`: every batch parks for the same delay, so push order is due order.
    parked: VecDeque<ParkedBatch>,
}

impl BulkWorker {
    pub(super) fn new(
        rx: Receiver<PendingDocument>,
        client: ClientBackend,
        settings: WorkerSettings,
        counters: Arc<PipelineCounters>,
        drain_deadline: Arc<OnceLock<std::time::Instant>>,
    ) -> Self {
        Self {
            rx,
            client,
            settings,
            counters,
            drain_deadline,
            buffer: Batch::default(),
            parked: VecDeque::new(),
        }
    }

    /// 🚀 Ship as documents come in until `stop()` closes the queue, then drain.
    pub(super) async fn run(mut self) {
        debug!("📥 BulkWorker started draining the queue...");
        let mut ticker = interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // -- the first tick fires immediately, and an immediate flush of nothing helps no one
        ticker.tick().await;

        loop {
            let next_retry = self.parked.front().map(|parked| parked.due);
            let retry_at = next_retry.unwrap_or_else(Instant::now);
            tokio::select! {
                received = self.rx.recv() => match received {
                    // -- 🛑 stop() has begun, from here on every document belongs to the drain
                    Ok(doc) if self.rx.is_closed() => {
                        self.stage(doc);
                        break;
                    }
                    Ok(doc) => {
                        // -- ⏱️ the interval counts from the last flush, whoever triggered it
                        if self.buffer_document(doc).await {
                            ticker.reset();
                        }
                    }
                    Err(_) => break,
                },
                _ = ticker.tick() => {
                    self.report_shed();
                    self.ship_buffer().await;
                }
                _ = sleep_until(retry_at), if next_retry.is_some() => {
                    self.retry_due().await;
                }
            }
        }

        self.drain().await;
    }

    /// 🗑️ No runtime means no network. Close the door and count what was already inside.
    pub(super) fn abandon_all(self) {
        self.rx.close();
        let mut lost = 0u64;
        while self.rx.try_recv().is_ok() {
            lost += 1;
        }
        if lost > 0 {
            error!("💀 {lost} queued documents abandoned, the bulk worker never started");
        }
        self.counters.add_abandoned(lost);
    }

    fn render(&self, doc: &PendingDocument) -> Option<String> {
        match ElasticsearchBulk::transform_document(doc) {
            Ok(entry) => Some(entry),
            Err(err) => {
                // -- 💀 malformed: this one document is out, nobody else is affected
                warn!("💀 Dropping a document that could not be rendered for _bulk: {err:#}");
                self.counters.add_rejected(1);
                None
            }
        }
    }

    /// 📥 Into the buffer with no shipping. The drain decides how to cut it up.
    fn stage(&mut self, doc: PendingDocument) {
        if let Some(entry) = self.render(&doc) {
            self.buffer.push(entry);
        }
    }

    /// 📥 Buffer one document, shipping on the size triggers. Returns whether anything shipped.
    async fn buffer_document(&mut self, doc: PendingDocument) -> bool {
        let Some(entry) = self.render(&doc) else {
            return false;
        };

        let mut shipped = false;
        // -- 📏 a document that would push us over the byte limit goes in the NEXT batch
        if !self.buffer.is_empty()
            && self.buffer.bytes + entry.len() + 1 > self.settings.max_batch_bytes
        {
            shipped |= self.ship_buffer().await;
        }
        self.buffer.push(entry);

        if self.buffer.len() >= self.settings.max_batch_docs
            || self.buffer.bytes >= self.settings.max_batch_bytes
        {
            shipped |= self.ship_buffer().await;
        }
        shipped
    }

    async fn ship_buffer(&mut self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        let batch = std::mem::take(&mut self.buffer);
        if let Attempted::Parked(parked) = self.attempt(batch, 0).await {
            self.parked.push_back(parked);
        }
        true
    }

    async fn retry_due(&mut self) {
        let now = Instant::now();
        while self.parked.front().is_some_and(|parked| parked.due <= now) {
            // -- 🛑 the drain takes it from here, under its own deadline
            if self.rx.is_closed() {
                break;
            }
            let Some(parked) = self.parked.pop_front() else {
                break;
            };
            if let Attempted::Parked(again) = self.attempt(parked.batch, parked.attempts).await {
                self.parked.push_back(again);
            }
        }
    }

    /// 📡 One send, then sort the documents into indexed, rejected, and try-again.
    async fn attempt(&mut self, batch: Batch, previous_attempts: u32) -> Attempted {
        let attempt = previous_attempts + 1;
        let docs = batch.len();
        self.counters.add_attempt();
        let payload = ElasticsearchBulk::compose(&batch.entries);

        match self.client.send_bulk(payload).await {
            Ok(response) => {
                let mut leftover = Batch::default();
                let mut indexed = 0u64;
                let mut last_reason = String::new();
                for (entry, outcome) in batch.entries.into_iter().zip(response.classify(docs)) {
                    match outcome {
                        ItemOutcome::Indexed => indexed += 1,
                        ItemOutcome::Rejected(reason) => {
                            warn!("💀 Elasticsearch rejected a document, dropping it: {reason}");
                            self.counters.add_rejected(1);
                        }
                        ItemOutcome::Retry(reason) => {
                            leftover.push(entry);
                            last_reason = reason;
                        }
                    }
                }
                self.counters.add_indexed(indexed);
                trace!("🚀 attempt {attempt}: {indexed}/{docs} documents indexed");

                if leftover.is_empty() {
                    Attempted::Settled
                } else {
                    self.park_or_abandon(leftover, attempt, &last_reason)
                }
            }
            Err(err) => self.park_or_abandon(batch, attempt, &format!("{err:#}")),
        }
    }

    fn park_or_abandon(&self, batch: Batch, attempts: u32, reason: &str) -> Attempted {
        if attempts >= self.settings.max_attempts {
            error!(
                "💀 Giving up on {} documents after {} attempts. Last words from the cluster: {}",
                batch.len(),
                attempts,
                reason
            );
            self.counters.add_abandoned(batch.len() as u64);
            return Attempted::GaveUp;
        }

        warn!(
            "🔄 Bulk attempt {}/{} failed for {} documents, retrying in {:?}: {}",
            attempts,
            self.settings.max_attempts,
            batch.len(),
            self.settings.retry_delay,
            reason
        );
        Attempted::Parked(ParkedBatch {
            batch,
            attempts,
            due: Instant::now() + self.settings.retry_delay,
        })
    }

    /// ✂️ Cut the buffer into batches that respect both size limits.
    fn split_buffer(&mut self) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut current = Batch::default();
        for entry in std::mem::take(&mut self.buffer).entries {
            let over_bytes = current.bytes + entry.len() + 1 > self.settings.max_batch_bytes;
            if !current.is_empty()
                && (current.len() >= self.settings.max_batch_docs || over_bytes)
            {
                batches.push(std::mem::take(&mut current));
            }
            current.push(entry);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// 🏁 The queue is closed. Send what is left, oldest first, until it is all settled,
    /// a batch runs out of attempts, or the deadline passes. Then flush and close.
    async fn drain(&mut self) {
        let deadline = self
            .drain_deadline
            .get()
            .copied()
            .map(Instant::from_std)
            .unwrap_or_else(|| Instant::now() + self.settings.drain_budget());

        while let Ok(doc) = self.rx.try_recv() {
            self.stage(doc);
        }

        let now = Instant::now();
        let mut stream = std::mem::take(&mut self.parked);
        for batch in self.split_buffer() {
            stream.push_back(ParkedBatch {
                batch,
                attempts: 0,
                due: now,
            });
        }
        debug!(
            "🏁 Queue closed, draining {} batches with {:?} to spare",
            stream.len(),
            deadline.saturating_duration_since(now)
        );

        while let Some(next) = stream.pop_front() {
            if next.due > deadline {
                stream.push_front(next);
                break;
            }
            sleep_until(next.due).await;

            let docs = next.batch.len() as u64;
            match timeout_at(deadline, self.attempt(next.batch, next.attempts)).await {
                Ok(Attempted::Settled) => {}
                // -- 🔄 same batch goes again before anything newer, order holds
                Ok(Attempted::Parked(again)) => stream.push_front(again),
                Ok(Attempted::GaveUp) => break,
                Err(_) => {
                    warn!("⏳ Drain deadline hit mid-request, {docs} documents were on the wire");
                    self.counters.add_abandoned(docs);
                    break;
                }
            }
        }

        let left: u64 = stream.iter().map(|parked| parked.batch.len() as u64).sum();
        if left > 0 {
            error!("💀 Drain budget spent, {left} documents abandoned without another send");
            self.counters.add_abandoned(left);
        }
        self.report_shed();

        if let Err(err) = self.client.flush().await {
            warn!("⚠️ Index client flush failed during shutdown: {err:#}");
        }
        if let Err(err) = self.client.close().await {
            warn!("⚠️ Index client close failed during shutdown: {err:#}");
        }
        debug!("🏁 BulkWorker drained. Shutting down.");
    }

    fn report_shed(&self) {
        let shed = self.counters.take_unreported_shed();
        if shed > 0 {
            warn!("🗑️ Queue was full, {shed} documents were shed instead of blocking the caller");
        }
    }
}
