//! # Connection Session
//!
//! Owns the single logical broker connection and presents an
//! attach/detach contract to the layers above.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (link lost) -> Reconnecting -> Connected ...
//!                                   \-> Closed (disconnect, idle, or attempt ceiling)
//! ```
//!
//! A background task owns the transport link and the
//! [`SubscriptionRegistry`]. Public calls send commands to that task, so
//! link I/O, handler dispatch and registry changes all happen on one
//! sequential path: two payloads for the same topic are never handled
//! concurrently.
//!
//! Transport failures never leave this module as errors. They are retried
//! according to the [`ReconnectPolicy`] and reported through
//! [`SessionEvent`]s and the observable [`SessionState`]. Broker rejections
//! of a subscribe are surfaced once to the subscriber and not retried.

use crate::client::error::{LinkError, SendError, SubscribeError, TransportError};
use crate::client::realtime::backoff::ReconnectPolicy;
use crate::client::realtime::registry::{Handler, SubscriptionHandle, SubscriptionRegistry};
use crate::client::realtime::transport::{InboundFrame, Transport, TransportLink};
use crate::shared::{AppConfig, Topic};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Lifecycle notifications broadcast by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// First successful connect of this session incarnation
    Connected,
    /// Connected again after a failure; all registrations were replayed
    Reconnected,
    /// An established link went away
    ConnectionLost { reason: String },
    /// Next attempt is scheduled after `delay`
    RetryScheduled { attempt: u32, delay: Duration },
    /// Broker refused a (replayed) subscription; the registration was dropped
    SubscribeFailed { topic: Topic, reason: String },
    /// The attempt ceiling was reached; the session is closed
    GaveUp { attempts: u32 },
    /// The session was torn down
    Closed,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub disconnect_when_idle: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            disconnect_when_idle: true,
        }
    }
}

impl From<&AppConfig> for SessionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            policy: ReconnectPolicy::from(&config.reconnect),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            disconnect_when_idle: config.disconnect_when_idle,
        }
    }
}

enum SessionCmd {
    Subscribe {
        topic: Topic,
        handler: Handler,
        reply: oneshot::Sender<Result<SubscriptionHandle, SubscribeError>>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        /// Remaining registrations, or `None` if the handle was stale
        reply: oneshot::Sender<Option<usize>>,
    },
    Publish {
        destination: String,
        body: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Topics {
        reply: oneshot::Sender<Vec<Topic>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct Running {
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    task: JoinHandle<()>,
}

impl Running {
    fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed() && !self.task.is_finished()
    }
}

/// Handle to the broker connection
pub struct ConnectionSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    running: Mutex<Option<Running>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    retry_count: Arc<AtomicU32>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state())
            .field("retry_count", &self.retry_count())
            .field("config", &self.config)
            .finish()
    }
}

impl ConnectionSession {
    /// Create a session in the `Disconnected` state. Nothing is spawned
    /// until the first `connect` or `subscribe`.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            config,
            running: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            events,
            retry_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Observe lifecycle events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Start connecting and wait for the outcome of the first attempt.
    ///
    /// Returns `Connected` on success. On failure the session keeps retrying
    /// in the background and `Reconnecting` is returned; `Closed` is returned
    /// only if the attempt ceiling was already reached.
    pub async fn connect(&self) -> SessionState {
        let mut state_rx = self.state_tx.subscribe();
        {
            let mut running = self.running.lock().await;
            self.ensure_running(&mut running);
        }
        let settled = state_rx
            .wait_for(|state| !matches!(state, SessionState::Connecting | SessionState::Disconnected))
            .await
            .map(|state| *state);
        settled.unwrap_or(SessionState::Closed)
    }

    /// Register `handler` for `topic`.
    ///
    /// While disconnected the registration is queued and replayed on the next
    /// successful connect. Subscribing again to the same topic replaces the
    /// previous handler.
    pub async fn subscribe(&self, topic: Topic, handler: Handler) -> Result<SubscriptionHandle, SubscribeError> {
        let mut running = self.running.lock().await;
        let cmd_tx = self.ensure_running(&mut running);
        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(SessionCmd::Subscribe { topic, handler, reply })
            .map_err(|_| SubscribeError::SessionClosed)?;
        reply_rx.await.map_err(|_| SubscribeError::SessionClosed)?
    }

    /// Remove a registration. Idempotent; tears the session down when the last
    /// registration goes away and `disconnect_when_idle` is set.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut running = self.running.lock().await;
        let Some(active) = running.as_ref() else {
            return;
        };
        let (reply, reply_rx) = oneshot::channel();
        if active
            .cmd_tx
            .send(SessionCmd::Unsubscribe {
                handle: handle.clone(),
                reply,
            })
            .is_err()
        {
            return;
        }
        let remaining = reply_rx.await.ok().flatten();
        if remaining == Some(0) && self.config.disconnect_when_idle {
            tracing::info!("Last subscription removed, closing session");
            self.shutdown(&mut running).await;
        }
    }

    /// Send an application frame. Not queued: fails with `NotConnected` while
    /// the link is down.
    pub async fn publish(&self, destination: &str, body: &str) -> Result<(), SendError> {
        let cmd_tx = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .filter(|active| active.is_alive())
                .map(|active| active.cmd_tx.clone())
        }
        .ok_or(SendError::NotConnected)?;

        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(SessionCmd::Publish {
                destination: destination.to_string(),
                body: body.to_string(),
                reply,
            })
            .map_err(|_| SendError::SessionClosed)?;
        reply_rx.await.map_err(|_| SendError::SessionClosed)?
    }

    /// Topics with an active registration
    pub async fn active_topics(&self) -> Vec<Topic> {
        let cmd_tx = {
            let running = self.running.lock().await;
            running.as_ref().map(|active| active.cmd_tx.clone())
        };
        let Some(cmd_tx) = cmd_tx else {
            return Vec::new();
        };
        let (reply, reply_rx) = oneshot::channel();
        if cmd_tx.send(SessionCmd::Topics { reply }).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Tear down the link and clear all registrations. No handler runs after
    /// this returns.
    pub async fn disconnect(&self) {
        let mut running = self.running.lock().await;
        self.shutdown(&mut running).await;
    }

    async fn shutdown(&self, running: &mut Option<Running>) {
        if let Some(active) = running.take() {
            let (ack, ack_rx) = oneshot::channel();
            if active.cmd_tx.send(SessionCmd::Shutdown { ack }).is_ok() {
                let _ = ack_rx.await;
            }
            if let Err(e) = active.task.await {
                tracing::error!("Session task ended abnormally: {}", e);
            }
        }
        self.state_tx.send_replace(SessionState::Closed);
    }

    fn ensure_running(&self, running: &mut Option<Running>) -> mpsc::UnboundedSender<SessionCmd> {
        if let Some(active) = running.as_ref().filter(|active| active.is_alive()) {
            return active.cmd_tx.clone();
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        self.retry_count.store(0, Ordering::Relaxed);
        self.state_tx.send_replace(SessionState::Connecting);

        let task = SessionTask {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            state_tx: Arc::clone(&self.state_tx),
            events: self.events.clone(),
            retry_count: Arc::clone(&self.retry_count),
            registry: SubscriptionRegistry::new(),
        };
        let span = tracing::info_span!("session", id = %session_id);
        let handle = tokio::spawn(task.run(cmd_rx).instrument(span));

        *running = Some(Running {
            cmd_tx: cmd_tx.clone(),
            task: handle,
        });
        cmd_tx
    }
}

enum Step {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

enum ConnectOutcome {
    Connected(Box<dyn TransportLink>),
    Failed(TransportError),
    Stop(Option<oneshot::Sender<()>>),
}

enum ServeOutcome {
    Lost(String),
    Stop(Option<oneshot::Sender<()>>),
}

struct SessionTask {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state_tx: Arc<watch::Sender<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    retry_count: Arc<AtomicU32>,
    registry: SubscriptionRegistry,
}

impl SessionTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>) {
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            let outcome = self.connect_servicing(&mut cmd_rx).await;
            match outcome {
                ConnectOutcome::Stop(ack) => return self.finish(ack),
                ConnectOutcome::Failed(e) => {
                    failures += 1;
                    self.retry_count.store(failures, Ordering::Relaxed);
                    tracing::warn!(attempt = failures, "Connect failed: {}", e);
                }
                ConnectOutcome::Connected(mut link) => {
                    let outcome = match self.resubscribe_all(link.as_mut()).await {
                        Ok(()) => {
                            failures = 0;
                            self.retry_count.store(0, Ordering::Relaxed);
                            self.set_state(SessionState::Connected);
                            if connected_before {
                                tracing::info!(topics = self.registry.len(), "Reconnected");
                                self.emit(SessionEvent::Reconnected);
                            } else {
                                tracing::info!("Connected");
                                self.emit(SessionEvent::Connected);
                            }
                            connected_before = true;
                            self.serve(link, &mut cmd_rx).await
                        }
                        Err(e) => {
                            link.close().await;
                            ServeOutcome::Lost(e.to_string())
                        }
                    };

                    match outcome {
                        ServeOutcome::Stop(ack) => return self.finish(ack),
                        ServeOutcome::Lost(reason) => {
                            tracing::warn!("Connection lost: {}", reason);
                            self.emit(SessionEvent::ConnectionLost { reason });
                            failures += 1;
                            self.retry_count.store(failures, Ordering::Relaxed);
                        }
                    }
                }
            }

            if !self.config.policy.allows_retry(failures) {
                tracing::error!(attempts = failures, "Reconnect attempts exhausted, giving up");
                self.emit(SessionEvent::GaveUp { attempts: failures });
                return self.finish(None);
            }

            let delay = self.config.policy.delay_for_attempt(failures);
            self.set_state(SessionState::Reconnecting);
            self.emit(SessionEvent::RetryScheduled {
                attempt: failures,
                delay,
            });
            tracing::debug!(attempt = failures, ?delay, "Retry scheduled");

            if let Step::Stop(ack) = self.wait_servicing(delay, &mut cmd_rx).await {
                return self.finish(ack);
            }
        }
    }

    /// Attempt one connect while still answering commands.
    async fn connect_servicing(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>) -> ConnectOutcome {
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.connect_timeout;
        let connect = async move {
            match tokio::time::timeout(timeout, transport.connect()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        };
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(link) => ConnectOutcome::Connected(link),
                        Err(e) => ConnectOutcome::Failed(e),
                    };
                }
                cmd = cmd_rx.recv() => {
                    if let Step::Stop(ack) = self.handle_offline(cmd) {
                        return ConnectOutcome::Stop(ack);
                    }
                }
            }
        }
    }

    /// Sleep out the backoff delay while still answering commands.
    async fn wait_servicing(&mut self, delay: Duration, cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>) -> Step {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Step::Continue,
                cmd = cmd_rx.recv() => {
                    if let Step::Stop(ack) = self.handle_offline(cmd) {
                        return Step::Stop(ack);
                    }
                }
            }
        }
    }

    fn handle_offline(&mut self, cmd: Option<SessionCmd>) -> Step {
        let Some(cmd) = cmd else {
            return Step::Stop(None);
        };
        match cmd {
            SessionCmd::Subscribe { topic, handler, reply } => {
                tracing::debug!(%topic, "Queued subscription until connected");
                let (handle, _) = self.registry.register(topic, handler);
                let _ = reply.send(Ok(handle));
            }
            SessionCmd::Unsubscribe { handle, reply } => {
                let removed = self.registry.remove(&handle);
                let _ = reply.send(removed.then(|| self.registry.len()));
            }
            SessionCmd::Publish { reply, .. } => {
                let _ = reply.send(Err(SendError::NotConnected));
            }
            SessionCmd::Topics { reply } => {
                let _ = reply.send(self.registry.topics());
            }
            SessionCmd::Shutdown { ack } => return Step::Stop(Some(ack)),
        }
        Step::Continue
    }

    /// Replay every registration onto a fresh link.
    async fn resubscribe_all(&mut self, link: &mut dyn TransportLink) -> Result<(), TransportError> {
        for topic in self.registry.topics() {
            match link.subscribe(&topic).await {
                Ok(()) => tracing::debug!(%topic, "Subscribed"),
                Err(LinkError::Rejected(reason)) => self.reject(&topic, reason),
                Err(LinkError::Transport(e)) => return Err(e),
            }
        }
        Ok(())
    }

    async fn serve(
        &mut self,
        mut link: Box<dyn TransportLink>,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
    ) -> ServeOutcome {
        loop {
            tokio::select! {
                frame = link.next_frame() => match frame {
                    Some(Ok(InboundFrame::Message { topic, body })) => {
                        tracing::debug!(%topic, "Dispatching message");
                        self.registry.dispatch(&topic, &body);
                    }
                    Some(Ok(InboundFrame::Error { topic: Some(topic), reason })) => {
                        self.reject(&topic, reason);
                    }
                    Some(Ok(InboundFrame::Error { topic: None, reason })) => {
                        tracing::warn!("Broker error: {}", reason);
                    }
                    Some(Err(e)) => {
                        link.close().await;
                        return ServeOutcome::Lost(e.to_string());
                    }
                    None => return ServeOutcome::Lost(TransportError::Closed.to_string()),
                },
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        link.close().await;
                        return ServeOutcome::Stop(None);
                    };
                    if let Some(outcome) = self.handle_online(cmd, link.as_mut()).await {
                        if matches!(outcome, ServeOutcome::Lost(_)) {
                            link.close().await;
                        }
                        return outcome;
                    }
                }
            }
        }
    }

    async fn handle_online(&mut self, cmd: SessionCmd, link: &mut dyn TransportLink) -> Option<ServeOutcome> {
        match cmd {
            SessionCmd::Subscribe { topic, handler, reply } => {
                let (handle, previous) = self.registry.register(topic.clone(), handler);
                if previous.is_some() {
                    let _ = reply.send(Ok(handle));
                    return None;
                }
                match link.subscribe(&topic).await {
                    Ok(()) => {
                        tracing::debug!(%topic, "Subscribed");
                        let _ = reply.send(Ok(handle));
                    }
                    Err(LinkError::Rejected(reason)) => {
                        tracing::warn!(%topic, "Subscription rejected: {}", reason);
                        self.registry.remove(&handle);
                        let _ = reply.send(Err(SubscribeError::Rejected { topic, reason }));
                    }
                    Err(LinkError::Transport(e)) => {
                        // kept registered; replayed after reconnect
                        let _ = reply.send(Ok(handle));
                        return Some(ServeOutcome::Lost(e.to_string()));
                    }
                }
            }
            SessionCmd::Unsubscribe { handle, reply } => {
                let removed = self.registry.remove(&handle);
                let mut lost = None;
                if removed {
                    if let Err(LinkError::Transport(e)) = link.unsubscribe(handle.topic()).await {
                        lost = Some(ServeOutcome::Lost(e.to_string()));
                    }
                }
                let _ = reply.send(removed.then(|| self.registry.len()));
                return lost;
            }
            SessionCmd::Publish { destination, body, reply } => match link.publish(&destination, &body).await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                }
                Err(LinkError::Rejected(reason)) => {
                    let _ = reply.send(Err(SendError::Rejected(reason)));
                }
                Err(LinkError::Transport(e)) => {
                    let _ = reply.send(Err(SendError::NotConnected));
                    return Some(ServeOutcome::Lost(e.to_string()));
                }
            },
            SessionCmd::Topics { reply } => {
                let _ = reply.send(self.registry.topics());
            }
            SessionCmd::Shutdown { ack } => {
                link.close().await;
                return Some(ServeOutcome::Stop(Some(ack)));
            }
        }
        None
    }

    fn reject(&mut self, topic: &Topic, reason: String) {
        if self.registry.remove_topic(topic).is_some() {
            tracing::warn!(%topic, "Broker rejected subscription: {}", reason);
            self.emit(SessionEvent::SubscribeFailed {
                topic: topic.clone(),
                reason,
            });
        }
    }

    fn finish(mut self, ack: Option<oneshot::Sender<()>>) {
        self.registry.clear();
        self.set_state(SessionState::Closed);
        self.emit(SessionEvent::Closed);
        tracing::info!("Session closed");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
