//! HTTP transport: JSON-RPC over POST, with an optional long-poll loop for
//! server-initiated notifications when the upstream advertises one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{AtraxError, Result};
use crate::transport::{EventStream, MessageStream, Transport, TransportEvent};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct HttpTransport {
    session_name: String,
    url: url::Url,
    headers: HashMap<String, String>,
    /// Optional long-poll endpoint for server-initiated notifications.
    notify_url: Option<url::Url>,
    client: reqwest::Client,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    inbound_tx: mpsc::UnboundedSender<Value>,
    state_tx: mpsc::UnboundedSender<TransportEvent>,
    state_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: AtomicBool,
    /// Cancels the long-poll loop, if one was spawned.
    poll_cancellation: CancellationToken,
}

impl HttpTransport {
    pub fn new(session_name: impl Into<String>, url: impl AsRef<str>, headers: HashMap<String, String>) -> Result<Self> {
        Self::with_notify_url(session_name, url, headers, None)
    }

    pub fn with_notify_url(
        session_name: impl Into<String>,
        url: impl AsRef<str>,
        headers: HashMap<String, String>,
        notify_url: Option<String>,
    ) -> Result<Self> {
        let url = url::Url::parse(url.as_ref())
            .map_err(|e| AtraxError::ConfigInvalid(format!("invalid upstream url: {e}")))?;
        let notify_url = notify_url
            .map(|u| url::Url::parse(&u))
            .transpose()
            .map_err(|e| AtraxError::ConfigInvalid(format!("invalid notification url: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| AtraxError::TransportUnavailable(format!("building http client: {e}")))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = mpsc::unbounded_channel();

        Ok(Self {
            session_name: session_name.into(),
            url,
            headers,
            notify_url,
            client,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            inbound_tx,
            state_tx,
            state_rx: Mutex::new(Some(state_rx)),
            closed: AtomicBool::new(false),
            poll_cancellation: CancellationToken::new(),
        })
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        req
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self) -> Result<()> {
        let req = self.apply_headers(self.client.head(self.url.clone()));
        // A reachability probe; any response (including 4xx/5xx from a peer
        // that simply doesn't implement HEAD) counts as "the URL resolves."
        // Only a connection-level failure is TransportUnavailable.
        if let Err(e) = req.send().await {
            if e.is_connect() || e.is_timeout() {
                return Err(AtraxError::TransportUnavailable(format!(
                    "probing '{}': {e}",
                    self.url
                )));
            }
        }

        if let Some(notify_url) = self.notify_url.clone() {
            let client = self.client.clone();
            let headers = self.headers.clone();
            let inbound_tx = self.inbound_tx.clone();
            let session_name = self.session_name.clone();
            let token = self.poll_cancellation.clone();
            tokio::spawn(async move {
                loop {
                    let mut req = client.get(notify_url.clone());
                    for (k, v) in &headers {
                        req = req.header(k, v);
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        result = req.send() => match result {
                            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                                Ok(value) => {
                                    if inbound_tx.send(value).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(session = %session_name, "long-poll response wasn't JSON: {e}");
                                }
                            },
                            Ok(_) => {}
                            Err(e) => {
                                tracing::debug!(session = %session_name, "long-poll request failed: {e}");
                                tokio::select! {
                                    _ = token.cancelled() => break,
                                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                                }
                            }
                        },
                    }
                }
            });
        }

        let _ = self.state_tx.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AtraxError::TransportClosed);
        }

        let has_id = message.get("id").is_some();
        let req = self.apply_headers(self.client.post(self.url.clone())).json(&message);
        let resp = req
            .send()
            .await
            .map_err(|e| AtraxError::WriteFailed(format!("posting to '{}': {e}", self.url)))?;

        if !has_id {
            // Notification: no reply expected regardless of status body.
            return Ok(());
        }

        if !resp.status().is_success() {
            return Err(AtraxError::WriteFailed(format!(
                "upstream returned status {}",
                resp.status()
            )));
        }

        match resp.json::<Value>().await {
            Ok(value) => {
                let _ = self.inbound_tx.send(value);
                Ok(())
            }
            Err(e) => Err(AtraxError::WriteFailed(format!("parsing upstream response: {e}"))),
        }
    }

    fn receive_stream(&self) -> MessageStream {
        match self.inbound_rx.lock().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }

    fn state_stream(&self) -> EventStream {
        match self.state_rx.lock().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.poll_cancellation.cancel();
        let _ = self.state_tx.send(TransportEvent::Closed("closed by proxy".to_string()));
        Ok(())
    }
}
