/**
 * Engine Error Types
 *
 * One enum per failure class. The propagation rules differ per class:
 *
 * - `TransportError` - absorbed by the connection session and retried with
 *   backoff; never handed to UI code.
 * - `SubscribeError` - application-level broker rejection, surfaced once
 *   to the subscriber and not retried.
 * - `HistoryFetchError` - surfaced to the topic's consumer; the merge for
 *   that topic pauses until the consumer retries.
 * - `MutationError` - triggers a rollback and is surfaced as a transient
 *   notice.
 * - `SendError` - a publish that could not be handed to the broker.
 *
 * A mention that cannot be resolved is not an error at all; see
 * `identity::IdentityResolutionMiss`.
 */
use crate::shared::{ConfigError, SharedError, Topic};
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure (connect, handshake, dropped link)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Failure reported by a transport link for a single operation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Broker refused the request; the link itself is still healthy
    #[error("rejected by broker: {0}")]
    Rejected(String),
    /// The link is gone
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Subscription could not be established
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("broker rejected subscription to {topic}: {reason}")]
    Rejected { topic: Topic, reason: String },
    #[error("connection session is closed")]
    SessionClosed,
}

/// Initial or scroll-back history request failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryFetchError {
    #[error("history request failed: {0}")]
    Network(String),
    #[error("history endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("history page could not be decoded: {0}")]
    Decode(String),
}

/// Optimistic mutation failed on the server side
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("mutation request failed: {0}")]
    Network(String),
    #[error("mutation endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("mutation response could not be decoded: {0}")]
    Decode(String),
}

/// Publish could not be handed to the broker
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("topic {0} does not accept publishes")]
    NotPublishable(Topic),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    #[error("connection session is closed")]
    SessionClosed,
}

/// Facade error returned by `SyncEngine`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    History(#[from] HistoryFetchError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Shared(#[from] SharedError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("topic {0} is not open")]
    TopicNotOpen(Topic),
    #[error("no user id configured")]
    MissingUser,
}

impl SyncError {
    /// Whether the UI should show this as a transient notice rather than an error state
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Mutation(_) | Self::Send(SendError::NotConnected))
    }
}
