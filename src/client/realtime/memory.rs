//! In-process broker implementing [`Transport`].
//!
//! Used by tests and local demos in place of a real STOMP endpoint. It can
//! be told to fail connects, reject topics and drop every live link, which
//! is enough to drive the session through all of its transitions.

use crate::client::error::{LinkError, TransportError};
use crate::client::realtime::transport::{InboundFrame, Transport, TransportLink};
use crate::shared::Topic;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct BrokerState {
    links: HashMap<u64, LinkEntry>,
    next_link_id: u64,
    fail_connects: u32,
    connect_count: u32,
    rejected: HashSet<Topic>,
    published: Vec<(String, String)>,
}

struct LinkEntry {
    tx: mpsc::UnboundedSender<InboundFrame>,
    topics: HashSet<Topic>,
}

/// Loopback broker; clones share the same state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("links", &state.links.len())
            .field("connect_count", &state.connect_count)
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `body` to every link subscribed to `topic`.
    /// Returns the number of links it was delivered to.
    pub fn publish(&self, topic: &Topic, body: &str) -> usize {
        let state = self.lock();
        state
            .links
            .values()
            .filter(|link| link.topics.contains(topic))
            .filter(|link| {
                link.tx
                    .send(InboundFrame::Message {
                        topic: topic.clone(),
                        body: body.to_string(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Send an ERROR frame scoped to `topic` to every subscribed link.
    pub fn error(&self, topic: &Topic, reason: &str) {
        let state = self.lock();
        for link in state.links.values().filter(|link| link.topics.contains(topic)) {
            let _ = link.tx.send(InboundFrame::Error {
                topic: Some(topic.clone()),
                reason: reason.to_string(),
            });
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().fail_connects = count;
    }

    /// Refuse subscriptions to `topic` from now on.
    pub fn reject_topic(&self, topic: &Topic) {
        self.lock().rejected.insert(topic.clone());
    }

    /// Close every live link, as a network drop would.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.lock().links);
        tracing::debug!(links = dropped.len(), "Dropping all broker links");
    }

    /// Live links subscribed to `topic`
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.lock()
            .links
            .values()
            .filter(|link| link.topics.contains(topic))
            .count()
    }

    /// Connect attempts seen so far, failed ones included
    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    /// Frames published by clients, as `(destination, body)`
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        let mut state = self.lock();
        state.connect_count += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Connect("broker unavailable".to_string()));
        }

        state.next_link_id += 1;
        let id = state.next_link_id;
        let (tx, rx) = mpsc::unbounded_channel();
        state.links.insert(
            id,
            LinkEntry {
                tx,
                topics: HashSet::new(),
            },
        );
        Ok(Box::new(MemoryLink {
            id,
            broker: self.clone(),
            rx,
        }))
    }
}

struct MemoryLink {
    id: u64,
    broker: MemoryBroker,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

impl MemoryLink {
    fn with_entry<R>(&self, f: impl FnOnce(&mut LinkEntry) -> R) -> Result<R, LinkError> {
        let mut state = self.broker.lock();
        state
            .links
            .get_mut(&self.id)
            .map(f)
            .ok_or(LinkError::Transport(TransportError::Closed))
    }
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn subscribe(&mut self, topic: &Topic) -> Result<(), LinkError> {
        if self.broker.lock().rejected.contains(topic) {
            return Err(LinkError::Rejected(format!("access to {topic} denied")));
        }
        self.with_entry(|entry| {
            entry.topics.insert(topic.clone());
        })
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), LinkError> {
        self.with_entry(|entry| {
            entry.topics.remove(topic);
        })
    }

    async fn publish(&mut self, destination: &str, body: &str) -> Result<(), LinkError> {
        self.with_entry(|_| ())?;
        self.broker
            .lock()
            .published
            .push((destination.to_string(), body.to_string()));
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.broker.lock().links.remove(&self.id);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.lock().links.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_only_subscribed_links() {
        let broker = MemoryBroker::new();
        let mut a = broker.connect().await.unwrap();
        let _b = broker.connect().await.unwrap();
        let topic = Topic::room("x");
        a.subscribe(&topic).await.unwrap();

        assert_eq!(broker.publish(&topic, "hi"), 1);
        let frame = a.next_frame().await.unwrap().unwrap();
        assert_eq!(
            frame,
            InboundFrame::Message {
                topic,
                body: "hi".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_drop_connections_ends_links() {
        let broker = MemoryBroker::new();
        let mut link = broker.connect().await.unwrap();
        broker.drop_connections();
        assert!(link.next_frame().await.is_none());
        assert!(matches!(
            link.subscribe(&Topic::room("x")).await,
            Err(LinkError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_fail_next_connects_counts_down() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_topic() {
        let broker = MemoryBroker::new();
        let topic = Topic::notifications(1);
        broker.reject_topic(&topic);
        let mut link = broker.connect().await.unwrap();
        assert!(matches!(link.subscribe(&topic).await, Err(LinkError::Rejected(_))));
    }
}
