//! An in-memory [`Transport`] double driven by a scriptable handler,
//! standing in for a stdio upstream in hermetic tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::Result;
use crate::transport::{EventStream, MessageStream, Transport, TransportEvent};

type Handler = dyn Fn(&Value) -> Option<Value> + Send + Sync;

/// A fake upstream: every outgoing message is handed to `handler`, and
/// whatever it returns (if anything) is pushed back as an inbound message,
/// synchronously, simulating an upstream that replies immediately. Messages
/// with no canned reply (handler returns `None`) simply go unanswered,
/// useful for modeling timeouts.
pub struct FakeTransport {
    handler: Arc<Handler>,
    sent: Arc<Mutex<Vec<Value>>>,
    inbound_tx: mpsc::UnboundedSender<Value>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    state_tx: mpsc::UnboundedSender<TransportEvent>,
    state_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl FakeTransport {
    pub fn new(handler: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handler: Arc::new(handler),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            state_tx,
            state_rx: Mutex::new(Some(state_rx)),
        })
    }

    /// Pushes a message onto the inbound stream as if the fake upstream
    /// spontaneously sent it (used to simulate notifications or crashes).
    pub fn push_inbound(&self, value: Value) {
        let _ = self.inbound_tx.send(value);
    }

    pub fn push_state(&self, event: TransportEvent) {
        let _ = self.state_tx.send(event);
    }

    pub fn sent_messages(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self) -> Result<()> {
        let _ = self.state_tx.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        self.sent.lock().push(message.clone());
        if let Some(reply) = (self.handler)(&message) {
            let _ = self.inbound_tx.send(reply);
        }
        Ok(())
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
        let _ = self.state_tx.send(TransportEvent::Closed("closed by proxy".to_string()));
        Ok(())
    }
}
