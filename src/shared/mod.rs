//! Shared Module
//!
//! Types shared with the server: the payloads carried by the history
//! endpoints and the broker, topic routing, payload errors and the
//! application configuration.

/// Message and notification payloads
pub mod message;

/// Broker topic routing
pub mod topic;

/// Shared error types
pub mod error;

/// Application configuration
pub mod config;

pub use config::{AppConfig, AppConfigBuilder, BackoffKind, ConfigError, ReconnectConfig};
pub use error::SharedError;
pub use message::{EntityId, Message, MessageKind, Notification, OutgoingMessage, StreamItem, UserId};
pub use topic::Topic;
