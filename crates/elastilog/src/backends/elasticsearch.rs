use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, trace, warn};

use crate::app_config::ConnectionConfig;
use crate::appender_config::AppenderConfig;
use crate::backends::{BulkResponse, IndexClient};

/// 📡 The Elasticsearch index client, pure I/O, zero buffering.
///
/// `ElasticsearchClient` accepts a fully rendered NDJSON payload and POSTs it to
/// `/_bulk` on one of the configured hosts. That's it. No internal buffer. No
/// retry loop. The BulkWorker upstream handles batching, retrying, and giving up.
///
/// Internally holds:
/// - `client`: the HTTP muscle 💪, reused across requests. `None` once closed.
/// - `base_urls`: one `scheme://host:port` per configured host, tried round-robin
/// - `connection`: auth and compression settings
///
/// 🚰 Knock knock. Who's there? HTTP POST. HTTP POST who? HTTP POST your NDJSON
/// and hope the cluster's in a good mood.
#[derive(Debug)]
pub(crate) struct ElasticsearchClient {
    client: Option<reqwest::Client>,
    base_urls: Vec<String>,
    next_host: usize,
    connection: ConnectionConfig,
}

impl ElasticsearchClient {
    /// 🚀 Build the connection pool. No network I/O happens here, the cluster may
    /// well be down while the application boots, and logging must not care.
    pub(crate) fn new(appender: &AppenderConfig, connection: &ConnectionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connection.connect_timeout_secs))
            .timeout(Duration::from_secs(connection.request_timeout_secs))
            .build()
            .context(
                "💀 The HTTP client refused to be born. Probably a missing TLS cert \
                 or a cursed system OpenSSL. Either way: tragic.",
            )?;

        let base_urls = appender
            .hosts()
            .iter()
            .map(|host| base_url(&connection.scheme, host, appender.port()))
            .collect();

        Ok(Self {
            client: Some(client),
            base_urls,
            next_host: 0,
            connection: connection.clone(),
        })
    }

    fn current_base_url(&self) -> &str {
        &self.base_urls[self.next_host % self.base_urls.len()]
    }

    // -- 🔄 next request goes to the next host. One sick node shouldn't hold the logs hostage.
    fn rotate_host(&mut self) {
        self.next_host = (self.next_host + 1) % self.base_urls.len();
    }

    fn encode_body(&self, payload: String) -> Result<Vec<u8>> {
        if !self.connection.compression {
            return Ok(payload.into_bytes());
        }
        let mut encoder =
            GzEncoder::new(Vec::with_capacity(payload.len() / 4), Compression::fast());
        encoder
            .write_all(payload.as_bytes())
            .context("💀 gzip choked on the bulk body")?;
        encoder
            .finish()
            .context("💀 gzip refused to finish the bulk body")
    }
}

/// 🔧 `host` may already carry a scheme (`https://es.internal`); otherwise we bolt one on.
fn base_url(scheme: &str, host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        format!("{host}:{port}")
    } else {
        format!("{scheme}://{host}:{port}")
    }
}

#[async_trait]
impl IndexClient for ElasticsearchClient {
    /// 📡 Fires one `_bulk` POST. Does not retry. Retries are the caller's problem. Good luck.
    async fn send_bulk(&mut self, payload: String) -> Result<BulkResponse> {
        let Some(client) = self.client.as_ref() else {
            anyhow::bail!(
                "💀 The Elasticsearch client is closed. Sending after close is a bug, not a plan."
            );
        };

        let bulk_url = format!("{}/_bulk", self.current_base_url());
        debug!(
            "📡 Sending {} bytes to {}, the payload has left the building, Elvis-style",
            payload.len(),
            bulk_url
        );

        let compressed = self.connection.compression;
        let body = self.encode_body(payload)?;

        // ⚠️ Content-Type: application/x-ndjson, not application/json. VERY important.
        let mut request = client
            .post(&bulk_url)
            .header("Content-Type", "application/x-ndjson");
        if compressed {
            request = request.header("Content-Encoding", "gzip");
        }
        // -- 🔒 api_key beats basic auth in this club
        if let Some(ref api_key) = self.connection.api_key {
            request = request.header("Authorization", format!("ApiKey {}", api_key));
        } else if let Some(ref username) = self.connection.username {
            request = request.basic_auth(username, self.connection.password.as_ref());
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("📡 {} did not answer, rotating to the next host: {}", bulk_url, err);
                self.rotate_host();
                return Err(err).context(
                    "💀 The bulk request never made it to Elasticsearch. The network \
                     responded with what can only be described as 'not vibing with it.'",
                );
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .context("💀 Elasticsearch answered, but the reply body got lost on the way back")?;
        if !status.is_success() {
            if status.is_server_error() {
                self.rotate_host();
            }
            anyhow::bail!(
                "💀 The bulk request arrived, but Elasticsearch looked at our documents \
                 and said '{}'. The body of the response read: '{}'.",
                status,
                body
            );
        }

        trace!("🚀 Bulk request landed, {} answered {}", bulk_url, status);
        serde_json::from_str(&body).with_context(|| {
            format!("💀 Elasticsearch said {status}, the reply was not a bulk response: '{body}'")
        })
    }

    /// 🗑️ Nothing to flush, every request is awaited before the next one leaves.
    async fn flush(&mut self) -> Result<()> {
        debug!("🗑️ Elasticsearch client flush, no buffer, every request was acknowledged");
        Ok(())
    }

    /// 🗑️ Drop the pool. The connections say goodbye. Knock knock. Who's there? Nobody. 🦆
    async fn close(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            let hosts = self.base_urls.len();
            debug!("🗑️ Elasticsearch client closed, {hosts} host(s) released");
        }
        Ok(())
    }
}
