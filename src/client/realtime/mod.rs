//! Realtime Module
//!
//! Broker connectivity: the connection session, its subscription registry,
//! reconnect backoff and the transports the session can drive.

pub mod backoff;
pub mod memory;
pub mod registry;
pub mod session;
pub mod stomp;
pub mod transport;

pub use backoff::{BackoffStrategy, ReconnectPolicy};
pub use memory::MemoryBroker;
pub use registry::{Handler, SubscriptionHandle, SubscriptionRegistry};
pub use session::{ConnectionSession, SessionConfig, SessionEvent, SessionState};
pub use stomp::{StompFrame, StompTransport};
pub use transport::{InboundFrame, Transport, TransportLink};
