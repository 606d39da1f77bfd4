//! # Sync Engine
//!
//! Facade handed to the UI layer. It wires one [`ConnectionSession`] to a
//! feed set for chat rooms and one for the user's notification queue, and
//! routes like, dislike and mark-read actions through the optimistic
//! coordinators.
//!
//! A background watcher follows session events: feeds are marked not live
//! while the link is down and, when enabled, every loaded feed re-fetches
//! its newest page after a reconnect so messages missed in between are
//! merged through the same id index.
//!
//! The engine must be created inside a Tokio runtime.

use crate::client::api::RestApi;
use crate::client::config::Config;
use crate::client::error::{SendError, SubscribeError, SyncError};
use crate::client::identity::{MentionResolution, MentionResolver, TieBreak};
use crate::client::optimistic::{MutationApi, MutationCoordinator, MutationKey, MutationKind, Reaction};
use crate::client::realtime::{
    ConnectionSession, SessionConfig, SessionEvent, SessionState, StompTransport, Transport,
};
use crate::client::stream::{FeedSet, HistorySource, StreamSnapshot};
use crate::shared::{ConfigError, EntityId, Message, Notification, OutgoingMessage, SharedError, Topic, UserId};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Engine tuning, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub user_id: Option<UserId>,
    pub page_size: u32,
    pub tie_break: TieBreak,
    pub resync_on_reconnect: bool,
    pub session: SessionConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            user_id: None,
            page_size: crate::shared::config::DEFAULT_PAGE_SIZE,
            tie_break: TieBreak::default(),
            resync_on_reconnect: true,
            session: SessionConfig::default(),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            user_id: config.user_id(),
            page_size: config.page_size(),
            tie_break: TieBreak::default(),
            resync_on_reconnect: config.resync_on_reconnect(),
            session: config.session_config(),
        }
    }
}

/// What was published by [`SyncEngine::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message: OutgoingMessage,
    pub mention: MentionResolution,
}

pub struct SyncEngine {
    session: Arc<ConnectionSession>,
    rooms: Arc<FeedSet<Message>>,
    notifications: Arc<FeedSet<Notification>>,
    reactions: MutationCoordinator<Reaction>,
    read_state: MutationCoordinator<bool>,
    mutations: Arc<dyn MutationApi>,
    resolver: MentionResolver,
    user_id: Option<UserId>,
    watcher: JoinHandle<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("session", &self.session)
            .field("rooms", &self.rooms)
            .field("notifications", &self.notifications)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        messages: Arc<dyn HistorySource<Message>>,
        notifications: Arc<dyn HistorySource<Notification>>,
        mutations: Arc<dyn MutationApi>,
        options: EngineOptions,
    ) -> Self {
        let session = Arc::new(ConnectionSession::new(transport, options.session.clone()));
        let rooms = Arc::new(FeedSet::new(Arc::clone(&session), messages, options.page_size));
        let notifications = Arc::new(FeedSet::new(Arc::clone(&session), notifications, options.page_size));
        let watcher = tokio::spawn(watch_session(
            session.events(),
            Arc::clone(&rooms),
            Arc::clone(&notifications),
            options.resync_on_reconnect,
        ));

        Self {
            session,
            rooms,
            notifications,
            reactions: MutationCoordinator::new(),
            read_state: MutationCoordinator::new(),
            mutations,
            resolver: MentionResolver::new(options.tie_break),
            user_id: options.user_id,
            watcher,
        }
    }

    /// STOMP transport plus REST client built from `config`
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let api = Arc::new(RestApi::new(config.clone()).map_err(|e| ConfigError::InvalidValue {
            field: "request_timeout_ms",
            message: format!("HTTP client could not be built: {e}"),
        })?);
        let transport = Arc::new(StompTransport::new(
            config.broker_url(),
            config.get_token().map(str::to_string),
        ));
        Ok(Self::new(
            transport,
            Arc::clone(&api) as Arc<dyn HistorySource<Message>>,
            Arc::clone(&api) as Arc<dyn HistorySource<Notification>>,
            api,
            EngineOptions::from(config),
        ))
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub async fn connect(&self) -> SessionState {
        self.session.connect().await
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events()
    }

    pub async fn open_room(&self, room: &str) -> Result<watch::Receiver<StreamSnapshot<Message>>, SyncError> {
        self.rooms.open(Topic::room(room)).await
    }

    pub async fn close_room(&self, room: &str) -> bool {
        self.rooms.close(&Topic::room(room)).await
    }

    /// Scroll back one page
    pub async fn load_older(&self, room: &str) -> Result<usize, SyncError> {
        self.rooms.load_older(&Topic::room(room)).await
    }

    pub async fn retry_history(&self, room: &str) -> Result<usize, SyncError> {
        self.rooms.retry_history(&Topic::room(room)).await
    }

    pub fn room_snapshot(&self, room: &str) -> Option<StreamSnapshot<Message>> {
        self.rooms.snapshot(&Topic::room(room))
    }

    fn notification_topic(&self) -> Result<Topic, SyncError> {
        self.user_id.map(Topic::notifications).ok_or(SyncError::MissingUser)
    }

    pub async fn open_notifications(&self) -> Result<watch::Receiver<StreamSnapshot<Notification>>, SyncError> {
        self.notifications.open(self.notification_topic()?).await
    }

    pub async fn close_notifications(&self) -> Result<bool, SyncError> {
        Ok(self.notifications.close(&self.notification_topic()?).await)
    }

    pub async fn retry_notifications(&self) -> Result<usize, SyncError> {
        self.notifications.retry_history(&self.notification_topic()?).await
    }

    pub async fn load_older_notifications(&self) -> Result<usize, SyncError> {
        self.notifications.load_older(&self.notification_topic()?).await
    }

    pub fn notifications_snapshot(&self) -> Option<StreamSnapshot<Notification>> {
        self.notification_topic()
            .ok()
            .and_then(|topic| self.notifications.snapshot(&topic))
    }

    /// Resolve the mention, then publish into `room`.
    ///
    /// An unresolved mention never blocks the send; the message goes out
    /// without a target. The stored message comes back on the live feed.
    pub async fn send(&self, room: &str, body: &str) -> Result<SendReceipt, SyncError> {
        if body.trim().is_empty() {
            return Err(SharedError::validation("body", "message body must not be empty").into());
        }
        let topic = Topic::room(room);
        let destination = topic
            .publish_destination()
            .ok_or_else(|| SendError::NotPublishable(topic.clone()))?;

        let observed = self
            .rooms
            .snapshot(&topic)
            .map(|snapshot| snapshot.messages)
            .unwrap_or_default();
        let mention = self.resolver.resolve(body, &observed);

        let message = OutgoingMessage {
            topic_id: room.to_string(),
            sender_id: self.user_id,
            body: body.to_string(),
            target_user_id: mention.target(),
        };
        let payload = serde_json::to_string(&message).map_err(SharedError::from)?;
        self.session.publish(&destination, &payload).await?;
        tracing::debug!(%topic, target = ?message.target_user_id, "Message published");

        Ok(SendReceipt { message, mention })
    }

    /// Record server-known reaction state, e.g. from a post listing.
    pub fn seed_reaction(&self, entity_id: EntityId, kind: MutationKind, reaction: Reaction) -> bool {
        self.reactions.seed(MutationKey::new(entity_id, kind), reaction)
    }

    pub fn reaction(&self, entity_id: EntityId, kind: MutationKind) -> Option<Reaction> {
        self.reactions.value(MutationKey::new(entity_id, kind))
    }

    /// Toggle the like on `entity_id` optimistically.
    ///
    /// `Ok(None)` means a like toggle for this entity is still pending and
    /// this call changed nothing.
    pub async fn toggle_like(&self, entity_id: EntityId) -> Result<Option<Reaction>, SyncError> {
        let api = Arc::clone(&self.mutations);
        let outcome = self
            .reactions
            .run(
                MutationKey::new(entity_id, MutationKind::Like),
                |current| current.copied().unwrap_or_default().toggled(),
                move || async move { api.like(entity_id).await },
                |local, count| local.confirmed(count),
            )
            .await?;
        Ok(outcome)
    }

    /// Toggle a dislike.
    ///
    /// The server answers with the entity's like count, so the count lands
    /// on the settled like slot and the dislike keeps its local value.
    pub async fn toggle_dislike(&self, entity_id: EntityId) -> Result<Option<Reaction>, SyncError> {
        let api = Arc::clone(&self.mutations);
        let mut like_count = None;
        let outcome = self
            .reactions
            .run(
                MutationKey::new(entity_id, MutationKind::Dislike),
                |current| current.copied().unwrap_or_default().toggled(),
                move || async move { api.dislike(entity_id).await },
                |local, count| {
                    like_count = Some(count);
                    local
                },
            )
            .await?;
        if let Some(count) = like_count {
            let updated = self.reactions.amend(MutationKey::new(entity_id, MutationKind::Like), |current| {
                current.copied().unwrap_or_default().confirmed(count)
            });
            tracing::debug!(entity_id, count, updated, "Like count from dislike response");
        }
        Ok(outcome)
    }

    /// Whether a notification counts as read, local state first
    pub fn is_read(&self, notification: &Notification) -> bool {
        self.read_state
            .value(MutationKey::new(notification.id, MutationKind::MarkRead))
            .unwrap_or(notification.read)
    }

    /// Mark a notification read optimistically.
    ///
    /// Returns `Ok(false)` if it was already read or a mark-read for it is
    /// still pending.
    pub async fn mark_read(&self, notification_id: EntityId) -> Result<bool, SyncError> {
        let already_read = self
            .notifications_snapshot()
            .and_then(|snapshot| snapshot.messages.into_iter().find(|n| n.id == notification_id))
            .is_some_and(|notification| self.is_read(&notification));
        let key = MutationKey::new(notification_id, MutationKind::MarkRead);
        if already_read || self.read_state.value(key) == Some(true) {
            return Ok(false);
        }

        let api = Arc::clone(&self.mutations);
        let outcome = self
            .read_state
            .run(
                key,
                |_| true,
                move || async move { api.mark_read(notification_id).await },
                |local, ()| local,
            )
            .await?;
        Ok(outcome.is_some())
    }

    /// Unread notifications in the open queue
    pub fn unread_count(&self) -> usize {
        self.notifications_snapshot()
            .map(|snapshot| snapshot.messages.iter().filter(|n| !self.is_read(n)).count())
            .unwrap_or(0)
    }

    /// Close every feed and the session. No handler runs after this returns.
    pub async fn shutdown(&self) {
        self.rooms.close_all().await;
        self.notifications.close_all().await;
        self.session.disconnect().await;
        self.watcher.abort();
        tracing::info!("Sync engine shut down");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_session(
    mut events: broadcast::Receiver<SessionEvent>,
    rooms: Arc<FeedSet<Message>>,
    notifications: Arc<FeedSet<Notification>>,
    resync_on_reconnect: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event watcher lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SessionEvent::ConnectionLost { .. } => {
                rooms.suspend_all();
                notifications.suspend_all();
            }
            SessionEvent::GaveUp { .. } | SessionEvent::Closed => {
                rooms.suspend_inactive().await;
                notifications.suspend_inactive().await;
            }
            SessionEvent::SubscribeFailed { topic, reason } => {
                let error = SubscribeError::Rejected { topic: topic.clone(), reason };
                if !rooms.detach(&topic, error.clone()) {
                    notifications.detach(&topic, error);
                }
            }
            SessionEvent::Reconnected => {
                if resync_on_reconnect {
                    rooms.resync_all().await;
                    notifications.resync_all().await;
                } else {
                    rooms.restore_live_all().await;
                    notifications.restore_live_all().await;
                }
            }
            _ => {}
        }
    }
}
