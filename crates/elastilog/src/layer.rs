//! 🔔 AppenderLayer, plug any [`Appender`] into a `tracing_subscriber` stack.
//!
//! Every `info!`/`warn!`/... becomes a [`LogEvent`] and gets submitted. Events from
//! elastilog itself and from the HTTP stack underneath it are skipped, otherwise the
//! worker logging "sent a bulk request" would produce a log line, which would produce a
//! bulk request, which would... you see where this goes. Ouroboros, but for bytes. 🐍

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::appender::Appender;
use crate::common::{Level, LogEvent};

// -- 🚫 our own traffic and the HTTP plumbing it rides on
const IGNORED_TARGET_PREFIXES: &[&str] =
    &["elastilog", "reqwest", "hyper", "h2", "rustls", "tokio"];

/// 🔔 A `tracing` layer that feeds events to an [`Appender`].
#[derive(Debug)]
pub struct AppenderLayer<A> {
    appender: Arc<A>,
}

impl<A> AppenderLayer<A> {
    pub fn new(appender: Arc<A>) -> Self {
        Self { appender }
    }
}

fn is_own_traffic(target: &str) -> bool {
    IGNORED_TARGET_PREFIXES.iter().any(|prefix| {
        target == *prefix
            || target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with("::") || rest.starts_with('_'))
    })
}

impl<S, A> Layer<S> for AppenderLayer<A>
where
    S: Subscriber,
    A: Appender + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_own_traffic(metadata.target()) {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let message = collector.message.unwrap_or_default();
        let mut log_event =
            LogEvent::new(Level::from(metadata.level()), message).with_logger(metadata.target());
        log_event.fields = collector.fields;
        if let Some(module) = metadata.module_path() {
            log_event
                .fields
                .entry("module")
                .or_insert_with(|| Value::from(module));
        }

        // -- the bool is the appender's business; a layer has nobody to tell
        let _ = self.appender.submit(&log_event);
    }
}

/// 🧺 Picks the `message` out and keeps the rest as JSON fields.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_f64(&mut self, field: &Field, value: f64) {
        // -- NaN and infinity have no JSON spelling, so they go in as text
        let json = Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.put(field, json);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Debug, Default)]
    struct RecordingAppender {
        events: Mutex<Vec<LogEvent>>,
    }

    impl Appender for RecordingAppender {
        fn submit(&self, event: &LogEvent) -> bool {
            self.events
                .lock()
                .expect("not poisoned")
                .push(event.clone());
            true
        }

        fn shutdown(&self) {}
    }

    #[test]
    fn the_one_where_a_tracing_event_becomes_a_log_event() {
        let appender = Arc::new(RecordingAppender::default());
        let subscriber =
            tracing_subscriber::registry().with(AppenderLayer::new(Arc::clone(&appender)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(
                target: "billing",
                invoice = 42,
                paid = false,
                ratio = 0.5,
                "invoice overdue"
            );
        });

        let events = appender.events.lock().expect("not poisoned");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.level, Level::Warn);
        assert_eq!(event.logger, "billing");
        assert_eq!(event.message, "invoice overdue");
        assert_eq!(event.fields["invoice"], Value::from(42));
        assert_eq!(event.fields["paid"], Value::from(false));
        assert_eq!(event.fields["ratio"], Value::from(0.5));
    }

    #[test]
    fn the_one_where_the_shipper_does_not_ship_itself() {
        let appender = Arc::new(RecordingAppender::default());
        let subscriber =
            tracing_subscriber::registry().with(AppenderLayer::new(Arc::clone(&appender)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "elastilog::batcher", "sent a bulk request");
            tracing::info!(target: "hyper::client", "connection reused");
            tracing::info!(target: "elastilogger_fanclub", "not us, ship it");
        });

        let events = appender.events.lock().expect("not poisoned");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].logger, "elastilogger_fanclub");
    }

    #[test]
    fn the_one_where_prefix_matching_respects_module_boundaries() {
        assert!(is_own_traffic("elastilog"));
        assert!(is_own_traffic("elastilog::backends::elasticsearch"));
        assert!(is_own_traffic("hyper_util::client"));
        assert!(!is_own_traffic("hyperdrive"));
        assert!(!is_own_traffic("app::tokio_stuff"));
    }
}
