//! Client Module
//!
//! The real-time synchronization engine.
//!
//! - **`realtime`** - connection session, subscription registry, transports
//! - **`stream`** - history plus live merging per topic
//! - **`identity`** - mention resolution from observed senders
//! - **`optimistic`** - apply/confirm/rollback for likes and read state
//! - **`api`** - REST client for history and mutations
//! - **`engine`** - the facade handed to UI code

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod optimistic;
pub mod realtime;
pub mod stream;
pub mod telemetry;

pub use api::RestApi;
pub use config::Config;
pub use engine::{EngineOptions, SendReceipt, SyncEngine};
pub use error::{HistoryFetchError, MutationError, SendError, SubscribeError, SyncError, TransportError};
pub use identity::{IdentityResolutionMiss, MentionResolution, MentionResolver, TieBreak};
