//! Scripted collaborators and the engine harness

use async_trait::async_trait;
use livesync::client::error::{HistoryFetchError, MutationError};
use livesync::client::optimistic::MutationApi;
use livesync::client::realtime::{MemoryBroker, ReconnectPolicy, SessionConfig};
use livesync::client::stream::HistorySource;
use livesync::client::{EngineOptions, SyncEngine};
use livesync::shared::{EntityId, Message, Notification, StreamItem, Topic, UserId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// History served from a table of `(topic, page) -> items`.
///
/// A topic can be held so its page-0 requests block until released.
pub struct ScriptedHistory<T> {
    pages: Mutex<HashMap<(Topic, u32), Vec<T>>>,
    gates: Mutex<HashMap<Topic, Arc<Notify>>>,
    failures: Mutex<u32>,
    calls: Mutex<Vec<(Topic, u32)>>,
}

impl<T> Default for ScriptedHistory<T> {
    fn default() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl<T: StreamItem> ScriptedHistory<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Items are given most-recent-first
    pub fn set_page(&self, topic: &Topic, page: u32, items: Vec<T>) {
        self.pages.lock().unwrap().insert((topic.clone(), page), items);
    }

    pub fn hold(&self, topic: &Topic) {
        self.gates.lock().unwrap().insert(topic.clone(), Arc::new(Notify::new()));
    }

    pub fn release(&self, topic: &Topic) {
        if let Some(gate) = self.gates.lock().unwrap().remove(topic) {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn calls(&self) -> Vec<(Topic, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl<T: StreamItem> HistorySource<T> for ScriptedHistory<T> {
    async fn fetch_page(&self, topic: &Topic, page: u32, _size: u32) -> Result<Vec<T>, HistoryFetchError> {
        self.calls.lock().unwrap().push((topic.clone(), page));
        let gate = if page == 0 {
            self.gates.lock().unwrap().get(topic).cloned()
        } else {
            None
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(HistoryFetchError::Status { status: 503 });
            }
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(topic.clone(), page))
            .cloned()
            .unwrap_or_default())
    }
}

/// Mutation endpoint answering from a queue of scripted responses.
///
/// While held, every request waits for `release`.
#[derive(Default)]
pub struct ScriptedMutations {
    counts: Mutex<VecDeque<Result<u64, MutationError>>>,
    read_acks: Mutex<VecDeque<Result<(), MutationError>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<(&'static str, EntityId)>>,
}

impl ScriptedMutations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_count(&self, response: Result<u64, MutationError>) {
        self.counts.lock().unwrap().push_back(response);
    }

    pub fn respond_read(&self, response: Result<(), MutationError>) {
        self.read_acks.lock().unwrap().push_back(response);
    }

    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<(&'static str, EntityId)> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, name: &'static str, entity_id: EntityId) {
        self.calls.lock().unwrap().push((name, entity_id));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn next_count(&self) -> Result<u64, MutationError> {
        self.counts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(MutationError::Network("no scripted response".to_string())))
    }
}

#[async_trait]
impl MutationApi for ScriptedMutations {
    async fn like(&self, entity_id: EntityId) -> Result<u64, MutationError> {
        self.enter("like", entity_id).await;
        self.next_count()
    }

    async fn dislike(&self, entity_id: EntityId) -> Result<u64, MutationError> {
        self.enter("dislike", entity_id).await;
        self.next_count()
    }

    async fn mark_read(&self, notification_id: EntityId) -> Result<(), MutationError> {
        self.enter("mark_read", notification_id).await;
        self.read_acks.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Engine over a `MemoryBroker` with scripted collaborators
pub struct Harness {
    pub broker: MemoryBroker,
    pub messages: Arc<ScriptedHistory<Message>>,
    pub notifications: Arc<ScriptedHistory<Notification>>,
    pub mutations: Arc<ScriptedMutations>,
    pub engine: Arc<SyncEngine>,
}

pub const USER: UserId = 9;

impl Harness {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    pub fn with_options(tweak: impl FnOnce(&mut EngineOptions)) -> Self {
        let broker = MemoryBroker::new();
        let messages = ScriptedHistory::new();
        let notifications = ScriptedHistory::new();
        let mutations = ScriptedMutations::new();
        let mut options = EngineOptions {
            user_id: Some(USER),
            session: SessionConfig {
                policy: ReconnectPolicy::fixed(Duration::from_millis(10)),
                connect_timeout: Duration::from_secs(1),
                disconnect_when_idle: true,
            },
            ..EngineOptions::default()
        };
        tweak(&mut options);

        let engine = Arc::new(SyncEngine::new(
            Arc::new(broker.clone()),
            Arc::clone(&messages) as Arc<dyn HistorySource<Message>>,
            Arc::clone(&notifications) as Arc<dyn HistorySource<Notification>>,
            Arc::clone(&mutations) as Arc<dyn MutationApi>,
            options,
        ));
        Self {
            broker,
            messages,
            notifications,
            mutations,
            engine,
        }
    }
}
