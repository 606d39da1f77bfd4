//! Transport seam between the connection session and a concrete broker
//! protocol.
//!
//! A `Transport` produces links; a `TransportLink` is one live connection.
//! The session owns at most one link at a time and is the only caller.

use crate::client::error::{LinkError, TransportError};
use crate::shared::Topic;
use async_trait::async_trait;

/// Frame delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Application payload published on a subscribed topic
    Message { topic: Topic, body: String },
    /// Application-level broker error, optionally tied to one subscription
    Error { topic: Option<Topic>, reason: String },
}

/// Factory for broker connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link and complete the protocol handshake.
    async fn connect(&self) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One established broker connection
#[async_trait]
pub trait TransportLink: Send {
    /// Start receiving frames for `topic`.
    async fn subscribe(&mut self, topic: &Topic) -> Result<(), LinkError>;

    /// Stop receiving frames for `topic`.
    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), LinkError>;

    /// Send an application frame to `destination`.
    async fn publish(&mut self, destination: &str, body: &str) -> Result<(), LinkError>;

    /// Next inbound frame. `None` means the peer closed the link cleanly.
    ///
    /// Must be cancel-safe: the session polls it inside `select!`.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>>;

    /// Close the link. Errors are ignored.
    async fn close(&mut self);
}
