//! 🪵 The Appender, the only part of elastilog your logging pipeline ever meets.
//!
//! Two methods. That's the whole contract:
//! - `submit(event) -> bool`: non-blocking, never panics, never propagates an error.
//!   `false` means "shut down already" or "that event could not become a document".
//! - `shutdown()`: blocking, idempotent. Drains, flushes, closes. Then it's over.
//!
//! 🧠 Knowledge graph:
//! - No global registry. The composition root calls [`LogSink::new`] (or
//!   [`LogSink::from_params`] / [`LogSink::from_app_config`]) and hands the result to
//!   whatever wires the logging pipeline together.
//! - Errors on the logging path are `Result`s internally and a `bool` at the boundary.
//!   They are logged at `debug`, never raised. The logging thread has enough problems.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::app_config::{AppConfig, ConnectionConfig, RuntimeConfig};
use crate::appender_config::AppenderConfig;
use crate::backends::ClientBackend;
use crate::batcher::{BatcherState, BulkBatcher, DrainReport, Enqueued, SinkStats};
use crate::common::{LogEvent, PendingDocument};

/// 📜 What a logging framework needs from an appender.
pub trait Appender: Send + Sync {
    /// 📥 Hand over one event. Returns whether it made it into the pipeline.
    fn submit(&self, event: &LogEvent) -> bool;
    /// 🛑 Stop accepting, drain what's queued, release the connections. Idempotent.
    fn shutdown(&self);
}

/// 📡 Ships log events to Elasticsearch in bulk, in the background.
///
/// ```no_run
/// use elastilog::{
///     Appender, AppenderConfig, ConnectionConfig, Level, LogEvent, LogSink, RuntimeConfig,
/// };
///
/// # fn main() -> anyhow::Result<()> {
/// let config = AppenderConfig::new("app-logs", "log")?.with_hosts(["es1", "es2"]);
/// let sink = LogSink::new(config, RuntimeConfig::default(), ConnectionConfig::default())?;
/// sink.submit(&LogEvent::new(Level::Info, "hello, index"));
/// sink.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LogSink {
    config: AppenderConfig,
    batcher: BulkBatcher,
    final_report: Mutex<Option<DrainReport>>,
}

impl LogSink {
    /// 🚀 Build the index client, start the batcher, and open for business.
    ///
    /// No network I/O happens here. A cluster that is down at boot only shows up
    /// later, as retries in the worker's logs.
    pub fn new(
        config: AppenderConfig,
        runtime: RuntimeConfig,
        connection: ConnectionConfig,
    ) -> Result<Self> {
        let client = ClientBackend::from_config(&config, &connection)
            .context("💀 Could not build the index client for the log sink")?;
        let request_timeout = Duration::from_secs(connection.request_timeout_secs);
        Self::with_client(config, runtime, client, request_timeout)
    }

    /// 🔧 The string-keyed front door. Configuration errors come back as
    /// [`ConfigError`](crate::ConfigError) inside the `anyhow::Error`, field name included.
    pub fn from_params(
        params: &HashMap<String, String>,
        runtime: RuntimeConfig,
        connection: ConnectionConfig,
    ) -> Result<Self> {
        let config = AppenderConfig::from_params(params)?;
        Self::new(config, runtime, connection)
    }

    /// 📋 Straight from a loaded [`AppConfig`].
    pub fn from_app_config(app_config: &AppConfig) -> Result<Self> {
        let config = app_config.appender_config()?;
        Self::new(config, app_config.runtime.clone(), app_config.connection.clone())
    }

    pub(crate) fn with_client(
        config: AppenderConfig,
        runtime: RuntimeConfig,
        client: ClientBackend,
        request_timeout: Duration,
    ) -> Result<Self> {
        let retry_delay = Duration::from_secs(config.retry_seconds());
        let batcher = BulkBatcher::new(client, runtime, retry_delay, request_timeout);
        batcher
            .start()
            .context("💀 The log sink could not start its bulk worker")?;
        Ok(Self {
            config,
            batcher,
            final_report: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppenderConfig {
        &self.config
    }

    pub fn state(&self) -> BatcherState {
        self.batcher.state()
    }

    /// 📊 Live counters. Cheap, lock-free, slightly stale by nature.
    pub fn stats(&self) -> SinkStats {
        self.batcher.stats()
    }

    /// 🛑 Like [`Appender::shutdown`], but hands back the drain receipt.
    ///
    /// Every call after the first gets the same receipt without doing anything.
    /// Blocks the calling thread; from async code, go through `spawn_blocking`.
    pub fn shutdown_with_report(&self) -> Option<DrainReport> {
        if let Some(report) = self.batcher.stop() {
            *self.final_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
        }
        *self.final_report.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn try_submit(&self, event: &LogEvent) -> Result<Enqueued> {
        let doc = PendingDocument::from_event(&self.config, event)?;
        Ok(self.batcher.enqueue(doc)?)
    }
}

impl Appender for LogSink {
    fn submit(&self, event: &LogEvent) -> bool {
        match self.try_submit(event) {
            Ok(Enqueued::Accepted) => true,
            // -- 🗑️ shed under overload: it reached the pipeline, the pipeline was full
            Ok(Enqueued::Shed) => true,
            Err(err) => {
                debug!("🚫 Log event not submitted: {err:#}");
                false
            }
        }
    }

    fn shutdown(&self) {
        self.shutdown_with_report();
    }
}

impl Drop for LogSink {
    /// 🏁 Forgot to call `shutdown`? We didn't. Queued documents still get their drain.
    fn drop(&mut self) {
        if self.batcher.state() == BatcherState::Running {
            debug!("🏁 LogSink dropped while running, draining before letting go");
            self.batcher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryClient;
    use crate::common::Level;

    fn sink_with(client: &InMemoryClient) -> LogSink {
        let config = AppenderConfig::new("app-logs", "log")
            .expect("valid")
            .with_ttl("1h");
        // -- ⏱️ an interval nobody will live to see, so only shutdown ships in these tests
        let runtime = RuntimeConfig {
            flush_interval_ms: 60_000,
            ..RuntimeConfig::default()
        };
        let backend = ClientBackend::InMemory(client.clone());
        LogSink::with_client(config, runtime, backend, Duration::from_secs(30))
            .expect("sink starts")
    }

    #[test]
    fn the_one_where_events_go_in_and_documents_come_out() {
        let client = InMemoryClient::new();
        let sink = sink_with(&client);
        assert_eq!(sink.state(), BatcherState::Running);

        assert!(sink.submit(&LogEvent::new(Level::Info, "first").with_id("id-1")));
        assert!(sink.submit(&LogEvent::new(Level::Error, "second").with_field("code", 500)));
        let report = sink.shutdown_with_report().expect("report");
        assert_eq!(report.stats.indexed, 2);

        let payloads = client.received.blocking_lock().clone();
        assert_eq!(payloads.len(), 1, "one shutdown flush, one bulk body");
        let lines: Vec<serde_json::Value> = payloads[0]
            .lines()
            .map(|l| serde_json::from_str(l).expect("every line is json"))
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["index"]["_index"], "app-logs");
        assert_eq!(lines[0]["index"]["_type"], "log");
        assert_eq!(lines[0]["index"]["_id"], "id-1");
        assert_eq!(lines[0]["index"]["_ttl"], "1h");
        assert_eq!(lines[1]["message"], "first");
        assert_eq!(lines[3]["level"], "ERROR");
        assert_eq!(lines[3]["code"], 500);
    }

    #[test]
    fn the_one_where_submit_after_shutdown_is_a_polite_no() {
        let client = InMemoryClient::new();
        let sink = sink_with(&client);
        sink.shutdown();
        let calls_after_shutdown = *client.calls.blocking_lock();

        assert!(!sink.submit(&LogEvent::new(Level::Info, "too late")));
        assert_eq!(sink.state(), BatcherState::Stopped);
        let calls = *client.calls.blocking_lock();
        assert_eq!(calls, calls_after_shutdown, "no network I/O after shutdown");
    }

    #[test]
    fn the_one_where_shutdown_twice_is_shutdown_once() {
        let client = InMemoryClient::new();
        let sink = sink_with(&client);
        assert!(sink.submit(&LogEvent::new(Level::Info, "only once")));

        let first = sink.shutdown_with_report().expect("first report");
        let second = sink.shutdown_with_report().expect("same report again");
        sink.shutdown();
        assert_eq!(first, second);
        assert_eq!(client.received.blocking_lock().len(), 1);
    }

    #[test]
    fn the_one_where_a_bad_event_gets_false_not_a_panic() {
        let client = InMemoryClient::new();
        let sink = sink_with(&client);
        assert!(!sink.submit(&LogEvent::new(Level::Info, "who am i").with_id("")));
        assert_eq!(sink.stats().accepted, 0);
        sink.shutdown();
    }

    #[test]
    fn the_one_where_dropping_the_sink_still_drains() {
        let client = InMemoryClient::new();
        {
            let sink = sink_with(&client);
            assert!(sink.submit(&LogEvent::new(Level::Warn, "don't forget me")));
        }
        assert_eq!(client.received.blocking_lock().len(), 1);
        assert!(*client.closed.blocking_lock());
    }

    #[test]
    fn the_one_where_bad_params_name_the_field() {
        let params = HashMap::from([
            ("index".to_string(), "logs".to_string()),
            ("_type".to_string(), "log".to_string()),
            ("retry".to_string(), "99".to_string()),
        ]);
        let err =
            LogSink::from_params(&params, RuntimeConfig::default(), ConnectionConfig::default())
                .expect_err("retry 99 is out of range");
        let config_err = err
            .downcast_ref::<crate::ConfigError>()
            .expect("configuration errors stay typed");
        assert_eq!(config_err.field(), "retry");
    }
}
