//! livesync - Real-time Sync Engine
//!
//! Client-side engine behind a chat widget and a notification center. It
//! keeps one live broker connection, merges paginated history with pushed
//! messages per topic, resolves `@name` mentions from observed senders, and
//! applies likes and read state optimistically before the server confirms.
//!
//! # Module Structure
//!
//! - **`shared`** - Types shared with the server
//!   - Message and notification payloads, topic routing
//!   - Application configuration
//!   - Payload errors
//!
//! - **`client`** - The engine
//!   - Connection session with reconnect backoff (STOMP or in-memory transport)
//!   - Stream merging and per-topic feeds
//!   - Optimistic mutation coordinator
//!   - REST client and the `SyncEngine` facade
//!
//! # Usage
//!
//! ```rust,no_run
//! use livesync::client::{Config, SyncEngine};
//!
//! # async fn example() -> Result<(), livesync::client::SyncError> {
//! let config = Config::from_env()?;
//! let engine = SyncEngine::from_config(&config)?;
//!
//! let mut room = engine.open_room("42").await?;
//! engine.send("42", "hello @alice").await?;
//! room.changed().await.ok();
//! println!("{} messages", room.borrow().messages.len());
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! - The connection session runs on one background task; handlers for the
//!   same topic never run concurrently.
//! - Feed and coordinator state sit behind short `std::sync::Mutex` critical
//!   sections that never span an `.await`.
//! - Snapshots reach the UI through `tokio::sync::watch` channels.

/// Shared types and data structures
pub mod shared;

/// Sync engine
pub mod client;
