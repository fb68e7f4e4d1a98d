//! 🔌 Backends, where the real I/O happens.
//!
//! 🚰 The batcher decides WHAT to send and WHEN. Backends decide HOW.
//! HTTP POST to `/_bulk`, or a Vec in RAM for tests. That's the whole menu.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait [`IndexClient`] → concrete impls → [`ClientBackend`] enum dispatch
//! - Worker does: buffer → render → compose → `client.send_bulk(payload)` → classify items
//! - Client does: I/O. Just I/O. It never retries; retries are the batcher's problem.
//! - [`BulkResponse::classify`] turns the per-item statuses into indexed / retry / rejected.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::app_config::{BackendKind, ConnectionConfig};
use crate::appender_config::AppenderConfig;

pub(crate) mod elasticsearch;
pub(crate) mod in_mem;

pub(crate) use elasticsearch::ElasticsearchClient;
pub(crate) use in_mem::InMemoryClient;

/// 🕳️ The index client contract.
///
/// # Contract 📜
/// - `send_bulk` performs exactly one bulk round trip with a fully rendered NDJSON body.
///   `Err` means the whole request failed (transport, non-2xx, unreadable reply).
/// - `flush` returns once everything accepted so far is acknowledged.
/// - `close` releases the connections. Sending after close is an error. Call `flush` first.
#[async_trait]
pub(crate) trait IndexClient: std::fmt::Debug + Send {
    async fn send_bulk(&mut self, payload: String) -> Result<BulkResponse>;
    async fn flush(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// 🎭 The many faces of an index client.
#[derive(Debug)]
pub(crate) enum ClientBackend {
    Elasticsearch(ElasticsearchClient),
    InMemory(InMemoryClient),
}

impl ClientBackend {
    /// 🔧 Resolve the client from the connection config. Builds the HTTP pool, opens nothing yet.
    pub(crate) fn from_config(
        appender: &AppenderConfig,
        connection: &ConnectionConfig,
    ) -> Result<Self> {
        Ok(match connection.backend {
            BackendKind::Elasticsearch => {
                ClientBackend::Elasticsearch(ElasticsearchClient::new(appender, connection)?)
            }
            BackendKind::InMemory => ClientBackend::InMemory(InMemoryClient::new()),
        })
    }
}

#[async_trait]
impl IndexClient for ClientBackend {
    async fn send_bulk(&mut self, payload: String) -> Result<BulkResponse> {
        match self {
            ClientBackend::Elasticsearch(client) => client.send_bulk(payload).await,
            ClientBackend::InMemory(client) => client.send_bulk(payload).await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            ClientBackend::Elasticsearch(client) => client.flush().await,
            ClientBackend::InMemory(client) => client.flush().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            ClientBackend::Elasticsearch(client) => client.close().await,
            ClientBackend::InMemory(client) => client.close().await,
        }
    }
}

/// 📬 What `_bulk` says back. Only the parts we act on.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub(crate) struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    /// Each item is `{"index": {...}}` keyed by the action name.
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub(crate) struct BulkItem {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// 🎯 The fate of one document in a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ItemOutcome {
    Indexed,
    /// 🔄 429 or 5xx: the cluster is busy or sad, try again later.
    Retry(String),
    /// 💀 Any other 4xx: the document itself is the problem. Retrying won't fix it.
    Rejected(String),
}

impl BulkResponse {
    /// 🧮 Map the reply onto `expected` documents, in request order.
    ///
    /// `errors: false` means everything landed, item list or not. When ES reports
    /// errors but the item list doesn't line up with what we sent, we can't tell who
    /// failed, so the whole batch goes back for another try.
    pub(crate) fn classify(&self, expected: usize) -> Vec<ItemOutcome> {
        if !self.errors {
            return vec![ItemOutcome::Indexed; expected];
        }
        if self.items.len() != expected {
            let reason = format!(
                "bulk reply listed {} items for {} documents",
                self.items.len(),
                expected
            );
            return vec![ItemOutcome::Retry(reason); expected];
        }

        self.items
            .iter()
            .map(|item| {
                let Some(result) = item.values().next() else {
                    return ItemOutcome::Retry("empty bulk item".to_string());
                };
                let reason = || {
                    result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("status {}", result.status))
                };
                match result.status {
                    200..=299 => ItemOutcome::Indexed,
                    429 | 500..=599 => ItemOutcome::Retry(reason()),
                    _ => ItemOutcome::Rejected(reason()),
                }
            })
            .collect()
    }
}
