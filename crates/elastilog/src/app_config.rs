//! 🔧 App Configuration, the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 🧠 Knowledge graph:
//! - `[appender]`: the raw string-keyed table (`index`, `_type`, `retry`, `hosts`, `port`, `ttl`).
//!   Kept raw on purpose, `AppenderConfig::from_params` is the one true validator.
//! - `[runtime]`: batcher knobs. Queue size, batch size, flush cadence, retry budget.
//! - `[connection]`: how we talk to the cluster. Scheme, auth, timeouts, gzip, backend kind.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::appender_config::{AppenderConfig, ConfigError};

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// 📜 Raw appender parameters, validated later. Strings, numbers, whatever TOML felt like.
    #[serde(default)]
    pub appender: HashMap<String, RawParam>,
    #[serde(default, alias = "batcher")]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl AppConfig {
    /// 🔤 Flatten the raw table into the strings a logging framework would have handed us.
    pub fn appender_params(&self) -> HashMap<String, String> {
        self.appender
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect()
    }

    /// ✅ Validate the `[appender]` table.
    pub fn appender_config(&self) -> Result<AppenderConfig, ConfigError> {
        AppenderConfig::from_params(&self.appender_params())
    }
}

/// 🎭 A parameter value as it arrived. TOML says `port = 9200`, env says `"9200"`,
/// and the validator only speaks string. This is the interpreter.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum RawParam {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl fmt::Display for RawParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawParam::Text(text) => f.write_str(text),
            RawParam::Integer(n) => write!(f, "{n}"),
            RawParam::Float(n) => write!(f, "{n}"),
            RawParam::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// 🧵 Batcher knobs. Every one of them has a default, because nobody reads docs.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// 📬 Max documents waiting for the worker. Beyond this, new documents are shed.
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 📦 Ship when the buffer holds this many documents.
    #[serde(default = "default_max_batch_docs")]
    pub max_batch_docs: usize,
    /// 📦 Ship when the rendered buffer reaches this many bytes.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// ⏱️ Ship whatever we have at least this often.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// 🔄 Total send attempts per batch, first try included. Must be at least 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_max_batch_docs() -> usize {
    500
}

// 📦 5MB, comfortably under every "http.max_content_length" anyone has ever configured
fn default_max_batch_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_batch_docs: default_max_batch_docs(),
            max_batch_bytes: default_max_batch_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RuntimeConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// 🔒 Zero is not a capacity, a batch size, or a number of attempts.
    pub(crate) fn sanitized(mut self) -> Self {
        self.queue_capacity = self.queue_capacity.max(1);
        self.max_batch_docs = self.max_batch_docs.max(1);
        self.max_batch_bytes = self.max_batch_bytes.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self
    }
}

/// 🔌 Which index client the worker gets.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Elasticsearch,
    /// 🧪 Keeps payloads in RAM. For dry runs and for tests that don't want a cluster.
    InMemory,
}

/// 📡 How we talk to the cluster.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// `http` or `https`. Ignored for hosts that already carry a scheme.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// 🔒 Username. The bouncer at the club. Except the club is a database.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key, wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 🫁 gzip request bodies. ES understands `Content-Encoding: gzip` on `_bulk`.
    #[serde(default)]
    pub compression: bool,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            scheme: default_scheme(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            compression: false,
        }
    }
}

/// 🚀 Load the config, from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (`ELASTILOG_*`, nested with `__`, so
/// `ELASTILOG_APPENDER__INDEX=app-logs`) with an optional TOML file. TOML wins on conflicts.
/// No file? Env only. We don't assume a default file name, that way lies madness.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("ELASTILOG_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and the ELASTILOG_* environment. \
             The file exists in our hearts, but apparently not in valid TOML.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (ELASTILOG_*). \
                 No file was provided, this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}
