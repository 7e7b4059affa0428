//! Transport: a bidirectional JSON-RPC message channel to one upstream.
//!
//! Three substrates implement the same [`Transport`] trait: [`stdio`] (child
//! process over stdin/stdout), [`docker`] (a thin specialization of stdio),
//! and [`http`] (JSON-RPC POST with optional long-poll).

pub mod docker;
pub mod http;
pub mod stdio;

use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use tokio_stream::Stream;

use crate::error::Result;

/// A transport lifecycle event, emitted on the `stateStream`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Closed(String),
    Error(String),
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Value> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Uniform capability surface over stdio, docker, and http substrates.
///
/// `receive_stream` and `state_stream` each hand out their stream exactly
/// once: the Session calls them right after `open()` and owns them for the
/// transport's lifetime. Calling either a second time yields an empty
/// stream, since there is exactly one consumer per transport by design.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn send(&self, message: Value) -> Result<()>;

    fn receive_stream(&self) -> MessageStream;

    fn state_stream(&self) -> EventStream;

    async fn close(&self) -> Result<()>;
}

/// Default per-session send-buffer cap: backpressure fails `send` rather
/// than growing the outbound queue unbounded.
pub const DEFAULT_SEND_BUFFER_LIMIT: usize = 1024 * 1024;
