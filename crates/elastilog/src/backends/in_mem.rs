use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backends::{BulkResponse, IndexClient};

/// 🎬 What the next `send_bulk` call should pretend happened.
#[derive(Debug, Clone)]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) enum Scripted {
    /// 💀 The network ate it.
    Fail(String),
    /// 📬 The cluster replied with this exact bulk response.
    Respond(BulkResponse),
    /// 🐌 Hang this long, then fail like a request timeout would.
    Stall(Duration),
}

/// 📦 An index client that never forgets. Unlike my dad, who forgot my soccer game in 1998.
///
/// Hoards every successfully "sent" payload in an `Arc<Mutex<Vec<String>>>` so tests
/// can peek inside after the worker thread has walked off with the client.
/// Failures are scripted: push a few [`Scripted`] outcomes and they are replayed in
/// order, one per call. When the script runs out, every send succeeds.
///
/// Clone-able because tests keep a handle. The `Arc` means everyone shares the same Vec.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemoryClient {
    /// 🔒 The evidence locker. One entry per acknowledged bulk body.
    pub(crate) received: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    /// 📊 Every call, scripted failures included. Tests count retries with it.
    pub(crate) calls: Arc<Mutex<usize>>,
    pub(crate) flushed: Arc<Mutex<bool>>,
    pub(crate) closed: Arc<Mutex<bool>>,
}

impl InMemoryClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🎬 Line up outcomes for the next calls. Sync on purpose, tests set the stage
    /// before any runtime exists.
    #[cfg(test)]
    pub(crate) fn scripted(outcomes: impl IntoIterator<Item = Scripted>) -> Self {
        let client = Self::default();
        client.script.blocking_lock().extend(outcomes);
        client
    }
}

#[async_trait]
impl IndexClient for InMemoryClient {
    async fn send_bulk(&mut self, payload: String) -> Result<BulkResponse> {
        *self.calls.lock().await += 1;
        if *self.closed.lock().await {
            anyhow::bail!("💀 In-memory client is closed. The RAM has moved on.");
        }

        let next = self.script.lock().await.pop_front();
        match next {
            Some(Scripted::Fail(reason)) => anyhow::bail!("💀 scripted failure: {reason}"),
            Some(Scripted::Stall(wait)) => {
                tokio::time::sleep(wait).await;
                anyhow::bail!("💀 scripted stall: no answer after {wait:?}")
            }
            Some(Scripted::Respond(response)) => {
                // -- 🧪 partial failures still "deliver" the body, tests inspect what went out
                self.received.lock().await.push(payload);
                Ok(response)
            }
            None => {
                debug!("🧪 In-memory client stashed {} bytes", payload.len());
                self.received.lock().await.push(payload);
                Ok(BulkResponse::default())
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        *self.flushed.lock().await = true;
        Ok(())
    }

    /// 🗑️ Closes with all the ceremony of closing a browser tab. The payloads stay
    /// in the Arc for whoever still holds a handle.
    async fn close(&mut self) -> Result<()> {
        *self.closed.lock().await = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_the_script_plays_out_then_everything_succeeds() -> Result<()> {
        let mut client = InMemoryClient::default();
        client
            .script
            .lock()
            .await
            .push_back(Scripted::Fail("cable unplugged".to_string()));

        assert!(client.send_bulk("a".to_string()).await.is_err());
        assert_eq!(client.send_bulk("b".to_string()).await?, BulkResponse::default());
        assert_eq!(*client.received.lock().await, vec!["b".to_string()]);
        assert_eq!(*client.calls.lock().await, 2);

        client.flush().await?;
        client.close().await?;
        assert!(*client.flushed.lock().await);
        assert!(client.send_bulk("c".to_string()).await.is_err());
        Ok(())
    }
}
