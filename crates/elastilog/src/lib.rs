//! 📡 elastilog, a log appender that ships events to Elasticsearch through `_bulk`.
//!
//! 🧠 Knowledge graph:
//! - [`AppenderConfig`] validates the six appender parameters.
//! - [`LogSink`] owns one bulk batcher, which owns one background worker, which owns the
//!   index client. Events go in through [`Appender::submit`] and never wait on the network.
//! - [`AppenderLayer`] bolts a sink onto a `tracing_subscriber` stack.
//! - [`app_config::load_config`] reads the whole thing from TOML plus `ELASTILOG_*` env vars.

pub mod app_config;
mod appender;
mod appender_config;
mod backends;
mod batcher;
mod common;
mod layer;
mod transforms;

pub use app_config::{
    AppConfig, BackendKind, ConnectionConfig, RawParam, RuntimeConfig, load_config,
};
pub use appender::{Appender, LogSink};
pub use appender_config::{
    AppenderConfig, ConfigError, PARAM_HOSTS, PARAM_INDEX, PARAM_PORT, PARAM_RETRY, PARAM_TTL,
    PARAM_TYPE,
};
pub use batcher::{BatcherState, DrainReport, SinkStats};
pub use common::{Level, LogEvent};
pub use layer::AppenderLayer;
