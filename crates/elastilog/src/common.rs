// ai
//! 📦 Common data structures, the building blocks of elastilog
//!
//! ---
//!
//! 🎬 COLD OPEN. INT. APPLICATION. SOME REQUEST HANDLER. 3:47 AM
//!
//! Somewhere, a `warn!` fires. It has a message. It has a level. It has a few
//! fields someone added during an incident two years ago and never removed.
//! It does not know it is about to become a document in a search index. It
//! does not know about bulk requests. It just wants to be read by a human.
//!
//! ✅ This module is where that happens. A [`LogEvent`] walks in. A
//! [`PendingDocument`] walks out, wearing an index name and a type like a
//! borrowed suit. 🦆
//!
//! ---
//!
//! 🧠 Knowledge graph:
//! - `LogEvent`: what the logging pipeline hands us. Public. Serde friendly.
//! - `PendingDocument`: what the batcher carries. Crate private. Lives from enqueue
//!   until the backend acknowledges it, rejects it, or the retry budget runs out.
//! - Reserved payload keys (`@timestamp`, `level`, `logger`, `message`) win over
//!   event fields with the same name.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::appender_config::AppenderConfig;

pub(crate) const KEY_TIMESTAMP: &str = "@timestamp";
const KEY_LEVEL: &str = "level";
const KEY_LOGGER: &str = "logger";
const KEY_MESSAGE: &str = "message";

/// 🎚️ How loud the log line is shouting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    /// 🔤 Lenient parse for levels found in the wild: `warn`, `WARNING`, `Err`, you name it.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" | "information" | "notice" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" | "err" | "fatal" | "critical" => Some(Level::Error),
            _ => None,
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// 🪵 One log event, as produced by the host logging pipeline.
///
/// `id` is optional. Leave it `None` and Elasticsearch will mint one, which is
/// what you want 99% of the time. The other 1% is idempotent replays, and those
/// people know who they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    #[serde(default)]
    pub logger: String,
    pub message: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl LogEvent {
    /// 🚀 A fresh event stamped with "right now".
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: String::new(),
            message: message.into(),
            id: None,
            fields: Map::new(),
        }
    }

    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = logger.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// 📜 Turn one raw input line into an event.
    ///
    /// A JSON object gets picked apart: `message`/`msg`, `level`/`severity`,
    /// `logger`/`target`, `@timestamp`/`timestamp`/`time`, `_id`/`id`. Everything
    /// else lands in `fields`. Anything that isn't a JSON object becomes an `Info`
    /// event whose message is the line itself, because a line is still a line.
    pub fn from_line(line: &str) -> Self {
        let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(line) else {
            return LogEvent::new(Level::Info, line.trim_end());
        };

        let message = take_string(&mut object, &["message", "msg"]).unwrap_or_default();
        let level = take_string(&mut object, &["level", "severity"])
            .and_then(|raw| Level::parse_lenient(&raw))
            .unwrap_or_default();
        let mut event = LogEvent::new(level, message);

        if let Some(logger) = take_string(&mut object, &["logger", "target"]) {
            event.logger = logger;
        }
        if let Some(timestamp) = take_string(&mut object, &[KEY_TIMESTAMP, "timestamp", "time"])
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        {
            event.timestamp = timestamp.with_timezone(&Utc);
        }
        event.id = take_string(&mut object, &["_id", "id"]);
        event.fields = object;
        event
    }
}

// -- 🎣 fish the first string-valued key out of the object, removing it so it does not
// -- show up twice in the document
fn take_string(object: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(_)) = object.get(*key) {
            if let Some(Value::String(found)) = object.remove(*key) {
                return Some(found);
            }
        }
    }
    None
}

/// 🎯 A document waiting for its bulk ride.
///
/// Carries everything the action line needs (`_index`, `_type`, `_id`, `_ttl`),
/// the event time, and the payload that becomes the rest of the document source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingDocument {
    pub index: String,
    pub doc_type: String,
    pub id: Option<String>,
    pub ttl: String,
    /// 🕰️ Rendered into the source as `@timestamp` by the bulk transform.
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl PendingDocument {
    /// 🏗️ Dress an event up as a document for the configured index.
    ///
    /// # Errors
    /// 💀 A blank explicit id. Elasticsearch would reject it anyway, we just say so earlier
    /// and on the caller's side of the queue.
    pub(crate) fn from_event(config: &AppenderConfig, event: &LogEvent) -> Result<Self> {
        let id = match &event.id {
            Some(id) if id.trim().is_empty() => {
                anyhow::bail!("💀 Event carries a blank document id. Nothing identifies nothing.")
            }
            other => other.clone(),
        };

        let mut payload = event.fields.clone();
        // -- the event time owns `@timestamp`, a field of the same name would only shadow it
        payload.remove(KEY_TIMESTAMP);
        payload.insert(
            KEY_LEVEL.to_string(),
            serde_json::to_value(event.level).context("💀 A log level refused to become JSON")?,
        );
        if !event.logger.is_empty() {
            payload.insert(KEY_LOGGER.to_string(), Value::String(event.logger.clone()));
        }
        payload.insert(KEY_MESSAGE.to_string(), Value::String(event.message.clone()));

        Ok(Self {
            index: config.index().to_string(),
            doc_type: config.doc_type().to_string(),
            id,
            ttl: config.ttl().to_string(),
            timestamp: event.timestamp,
            payload,
        })
    }
}
