//! # Topic Feeds
//!
//! Drives one [`MergedStream`] per open topic and publishes a
//! [`StreamSnapshot`] through a `watch` channel after every change.
//!
//! ## Open sequence
//!
//! 1. A fresh generation is allocated and the live handler is registered.
//!    Live items that arrive before history resolves are queued, not
//!    dropped and not merged.
//! 2. The newest history page is fetched and merged (reversed to ascending
//!    order).
//! 3. Queued live items are replayed through the same id index, then the
//!    feed is marked live. From here on live items merge directly.
//!
//! Closing a topic marks its feed closed. Late history responses and late
//! live payloads for a closed feed, or for an older generation of a
//! reopened topic, are discarded.
//!
//! ## Detached feeds
//!
//! A feed whose registration the broker rejected, or whose session gave up,
//! is no longer live. Opening its topic again starts a fresh generation
//! from step 1.
//!
//! ## Gap fill
//!
//! After a reconnect, [`FeedSet::resync_all`] walks pages from the newest
//! backwards until it reaches an item that was already merged before the
//! link dropped. Only then is the feed marked live again.

use crate::client::error::{HistoryFetchError, SubscribeError, SyncError};
use crate::client::realtime::{ConnectionSession, Handler, SubscriptionHandle};
use crate::client::stream::history::HistorySource;
use crate::client::stream::merger::MergedStream;
use crate::shared::{StreamItem, Topic};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

/// Read-only view of one topic handed to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot<T> {
    pub topic: Topic,
    /// Ascending by `(created_at, id)`, no duplicate ids
    pub messages: Vec<T>,
    /// Highest history page merged so far
    pub loaded_history_cursor: Option<u32>,
    /// Live items are being merged directly
    pub is_live: bool,
    /// Live items waiting for the initial history page
    pub queued_live: usize,
    /// A history request is in flight
    pub loading: bool,
    /// Last history failure; cleared by the next successful fetch
    pub history_error: Option<HistoryFetchError>,
    /// Set when the broker dropped the registration; reopen to recover
    pub subscription_error: Option<SubscribeError>,
    pub generation: u64,
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FeedState<T: StreamItem> {
    stream: MergedStream<T>,
    queue: Vec<T>,
    history_ready: bool,
    loading: bool,
    history_error: Option<HistoryFetchError>,
    subscription_error: Option<SubscribeError>,
    handle: Option<SubscriptionHandle>,
    detached: bool,
    closed: bool,
}

struct Feed<T: StreamItem> {
    topic: Topic,
    generation: u64,
    state: Mutex<FeedState<T>>,
    snapshot_tx: watch::Sender<StreamSnapshot<T>>,
}

impl<T: StreamItem> Feed<T> {
    fn new(topic: Topic, generation: u64) -> Self {
        let (snapshot_tx, _) = watch::channel(StreamSnapshot {
            topic: topic.clone(),
            messages: Vec::new(),
            loaded_history_cursor: None,
            is_live: false,
            queued_live: 0,
            loading: true,
            history_error: None,
            subscription_error: None,
            generation,
        });
        Self {
            topic,
            generation,
            state: Mutex::new(FeedState {
                stream: MergedStream::new(),
                queue: Vec::new(),
                history_ready: false,
                loading: true,
                history_error: None,
                subscription_error: None,
                handle: None,
                detached: false,
                closed: false,
            }),
            snapshot_tx,
        }
    }

    fn publish(&self, state: &FeedState<T>) {
        self.snapshot_tx.send_replace(StreamSnapshot {
            topic: self.topic.clone(),
            messages: state.stream.items().to_vec(),
            loaded_history_cursor: state.stream.cursor(),
            is_live: state.stream.is_live(),
            queued_live: state.queue.len(),
            loading: state.loading,
            history_error: state.history_error.clone(),
            subscription_error: state.subscription_error.clone(),
            generation: self.generation,
        });
    }

    fn on_live(&self, item: T) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        if !state.history_ready {
            tracing::debug!(topic = %self.topic, generation = self.generation, "Queued live item until history resolves");
            state.queue.push(item);
            self.publish(&state);
            return;
        }
        if state.stream.insert(item).is_new() {
            self.publish(&state);
        }
    }

    /// Merge the first history page and replay queued live items.
    /// Returns `false` if the feed was closed meanwhile.
    fn complete_initial(&self, page: Vec<T>) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        let merged = state.stream.merge_page(page);
        state.stream.mark_page_loaded(0);

        let queued = std::mem::take(&mut state.queue);
        let replayed = queued
            .into_iter()
            .filter(|item| state.stream.insert(item.clone()).is_new())
            .count();

        state.history_ready = true;
        state.loading = false;
        state.history_error = None;
        let live = !state.detached;
        state.stream.set_live(live);
        tracing::info!(
            topic = %self.topic,
            generation = self.generation,
            merged,
            replayed,
            "Initial history merged"
        );
        self.publish(&state);
        true
    }

    fn fail_history(&self, error: &HistoryFetchError) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        tracing::warn!(topic = %self.topic, generation = self.generation, "History fetch failed: {}", error);
        state.loading = false;
        state.history_error = Some(error.clone());
        self.publish(&state);
    }

    fn detach(&self, error: SubscribeError) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        tracing::warn!(topic = %self.topic, generation = self.generation, "Feed detached: {}", error);
        state.detached = true;
        state.handle = None;
        state.queue.clear();
        state.stream.set_live(false);
        state.subscription_error = Some(error);
        self.publish(&state);
        true
    }

    fn close(&self) -> Option<SubscriptionHandle> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.queue.clear();
        state.stream.set_live(false);
        state.handle.take()
    }
}

/// Set of open topics sharing one connection session and history source
pub struct FeedSet<T: StreamItem> {
    session: Arc<ConnectionSession>,
    history: Arc<dyn HistorySource<T>>,
    page_size: u32,
    generations: AtomicU64,
    feeds: Mutex<HashMap<Topic, Arc<Feed<T>>>>,
}

impl<T: StreamItem> std::fmt::Debug for FeedSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSet")
            .field("topics", &self.topics())
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<T: StreamItem + DeserializeOwned> FeedSet<T> {
    pub fn new(session: Arc<ConnectionSession>, history: Arc<dyn HistorySource<T>>, page_size: u32) -> Self {
        Self {
            session,
            history,
            page_size: page_size.max(1),
            generations: AtomicU64::new(0),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    fn feed(&self, topic: &Topic) -> Result<Arc<Feed<T>>, SyncError> {
        lock(&self.feeds)
            .get(topic)
            .cloned()
            .ok_or_else(|| SyncError::TopicNotOpen(topic.clone()))
    }

    fn live_handler(feed: Weak<Feed<T>>) -> Handler {
        Box::new(move |raw: &str| {
            let Some(feed) = feed.upgrade() else {
                return;
            };
            match serde_json::from_str::<T>(raw) {
                Ok(item) => feed.on_live(item),
                Err(e) => tracing::warn!(topic = %feed.topic, "Dropping undecodable payload: {}", e),
            }
        })
    }

    /// Open `topic`: attach the live feed, merge the newest history page,
    /// then replay everything that arrived meanwhile.
    ///
    /// Opening an already open topic returns its existing receiver. If the
    /// history request fails the topic stays open with the error recorded in
    /// its snapshot; call [`FeedSet::retry_history`] to resume.
    pub async fn open(&self, topic: Topic) -> Result<watch::Receiver<StreamSnapshot<T>>, SyncError> {
        let existing = lock(&self.feeds).get(&topic).cloned();
        if let Some(existing) = existing {
            if !self.is_stale(&existing).await {
                return Ok(existing.snapshot_tx.subscribe());
            }
            tracing::info!(%topic, generation = existing.generation, "Restarting stale topic");
            self.forget(&existing);
            existing.publish(&lock(&existing.state));
        }

        let feed = {
            let mut feeds = lock(&self.feeds);
            if let Some(existing) = feeds.get(&topic) {
                return Ok(existing.snapshot_tx.subscribe());
            }
            let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
            let feed = Arc::new(Feed::new(topic.clone(), generation));
            feeds.insert(topic.clone(), Arc::clone(&feed));
            feed
        };
        let receiver = feed.snapshot_tx.subscribe();
        tracing::info!(%topic, generation = feed.generation, "Opening topic");

        let handle = match self
            .session
            .subscribe(topic.clone(), Self::live_handler(Arc::downgrade(&feed)))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.forget(&feed);
                return Err(e.into());
            }
        };

        let closed = {
            let mut state = lock(&feed.state);
            if !state.closed {
                state.handle = Some(handle.clone());
            }
            state.closed
        };
        if closed {
            self.session.unsubscribe(&handle).await;
            return Err(SyncError::TopicNotOpen(topic));
        }

        self.load_initial(&feed).await?;
        Ok(receiver)
    }

    /// Detached, or subscribed on a session that no longer holds the
    /// registration (it gave up or was torn down).
    async fn is_stale(&self, feed: &Feed<T>) -> bool {
        let (detached, subscribed) = {
            let state = lock(&feed.state);
            (state.detached, state.handle.is_some())
        };
        if detached {
            return true;
        }
        subscribed && !self.session.active_topics().await.contains(&feed.topic)
    }

    async fn load_initial(&self, feed: &Arc<Feed<T>>) -> Result<usize, SyncError> {
        match self.history.fetch_page(&feed.topic, 0, self.page_size).await {
            Ok(page) => {
                let count = page.len();
                if feed.complete_initial(page) {
                    Ok(count)
                } else {
                    tracing::debug!(topic = %feed.topic, generation = feed.generation, "Discarded history for closed feed");
                    Err(SyncError::TopicNotOpen(feed.topic.clone()))
                }
            }
            Err(e) => {
                feed.fail_history(&e);
                Err(e.into())
            }
        }
    }

    /// Re-run a failed initial history fetch, or a failed gap fill. No-op
    /// once history is loaded and the feed is live.
    pub async fn retry_history(&self, topic: &Topic) -> Result<usize, SyncError> {
        let feed = self.feed(topic)?;
        let gap = {
            let mut state = lock(&feed.state);
            if state.detached {
                return Ok(0);
            }
            if state.history_ready {
                if state.stream.is_live() || state.history_error.is_none() {
                    return Ok(0);
                }
                true
            } else {
                if state.loading && state.history_error.is_none() {
                    return Ok(0);
                }
                state.loading = true;
                feed.publish(&state);
                false
            }
        };
        if gap {
            self.fill_gap(&feed).await
        } else {
            self.load_initial(&feed).await
        }
    }

    /// Fetch the next older page and merge it. Returns how many items were new.
    pub async fn load_older(&self, topic: &Topic) -> Result<usize, SyncError> {
        let feed = self.feed(topic)?;
        let page = {
            let mut state = lock(&feed.state);
            if !state.history_ready || state.loading {
                return Ok(0);
            }
            state.loading = true;
            feed.publish(&state);
            state.stream.next_page()
        };

        let result = self.history.fetch_page(topic, page, self.page_size).await;
        let mut state = lock(&feed.state);
        if state.closed {
            return Err(SyncError::TopicNotOpen(topic.clone()));
        }
        state.loading = false;
        match result {
            Ok(items) => {
                let added = state.stream.merge_page(items);
                state.stream.mark_page_loaded(page);
                state.history_error = None;
                tracing::debug!(%topic, page, added, "Merged older page");
                feed.publish(&state);
                Ok(added)
            }
            Err(e) => {
                tracing::warn!(%topic, page, "Older page fetch failed: {}", e);
                state.history_error = Some(e.clone());
                feed.publish(&state);
                Err(e.into())
            }
        }
    }

    /// Fill the gap left by a dropped connection on every feed whose
    /// registration survived the reconnect.
    pub async fn resync_all(&self) {
        for feed in self.attached_feeds().await {
            if let Err(e) = self.fill_gap(&feed).await {
                tracing::warn!(topic = %feed.topic, "Resync failed: {}", e);
            }
        }
    }

    /// Walk history from the newest page back until it meets an item merged
    /// before the gap, then mark the feed live. Returns how many items were
    /// new.
    async fn fill_gap(&self, feed: &Arc<Feed<T>>) -> Result<usize, SyncError> {
        let anchor = lock(&feed.state).stream.items().last().map(StreamItem::order_key);
        let mut page_index = 0;
        let mut added_total = 0;
        loop {
            let result = self.history.fetch_page(&feed.topic, page_index, self.page_size).await;
            let mut state = lock(&feed.state);
            if state.closed || state.detached {
                return Err(SyncError::TopicNotOpen(feed.topic.clone()));
            }
            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    state.history_error = Some(e.clone());
                    feed.publish(&state);
                    return Err(e.into());
                }
            };
            let fetched = page.len();
            let reached_anchor = match &anchor {
                Some(anchor) => page.iter().any(|item| item.order_key() <= *anchor),
                None => true,
            };
            added_total += state.stream.merge_page(page);

            if reached_anchor || fetched < self.page_size as usize {
                state.history_error = None;
                state.stream.set_live(true);
                tracing::info!(topic = %feed.topic, pages = page_index + 1, added = added_total, "Resynced after reconnect");
                feed.publish(&state);
                return Ok(added_total);
            }
            tracing::debug!(topic = %feed.topic, page = page_index, "Gap extends past page, fetching older");
            feed.publish(&state);
            page_index += 1;
        }
    }

    /// Loaded, open feeds whose topic is still registered with the session
    async fn attached_feeds(&self) -> Vec<Arc<Feed<T>>> {
        let active = self.session.active_topics().await;
        lock(&self.feeds)
            .values()
            .filter(|feed| active.contains(&feed.topic))
            .filter(|feed| {
                let state = lock(&feed.state);
                state.history_ready && !state.closed && !state.detached
            })
            .cloned()
            .collect()
    }

    /// Mark every loaded feed not live, e.g. while the link is down.
    pub fn suspend_all(&self) {
        let feeds: Vec<Arc<Feed<T>>> = lock(&self.feeds).values().cloned().collect();
        for feed in feeds {
            let mut state = lock(&feed.state);
            if state.closed || !state.history_ready || !state.stream.is_live() {
                continue;
            }
            state.stream.set_live(false);
            feed.publish(&state);
        }
    }

    /// Mark feeds not live once their session is gone. Feeds already
    /// registered with a newer session are left alone.
    pub async fn suspend_inactive(&self) {
        // Collected before reading the registrations, so a feed subscribing
        // meanwhile is never a candidate.
        let subscribed: Vec<Arc<Feed<T>>> = lock(&self.feeds)
            .values()
            .filter(|feed| lock(&feed.state).handle.is_some())
            .cloned()
            .collect();
        let active = self.session.active_topics().await;
        for feed in subscribed.into_iter().filter(|feed| !active.contains(&feed.topic)) {
            let mut state = lock(&feed.state);
            if !state.closed && state.stream.is_live() {
                state.stream.set_live(false);
                feed.publish(&state);
            }
        }
    }

    /// Mark feeds live again without a gap fill, skipping feeds that lost
    /// their registration.
    pub async fn restore_live_all(&self) {
        for feed in self.attached_feeds().await {
            let mut state = lock(&feed.state);
            if !state.stream.is_live() {
                state.stream.set_live(true);
                feed.publish(&state);
            }
        }
    }

    /// Detach `topic` after the broker dropped its registration.
    pub fn detach(&self, topic: &Topic, error: SubscribeError) -> bool {
        let feed = lock(&self.feeds).get(topic).cloned();
        feed.is_some_and(|feed| feed.detach(error))
    }

    /// Close `topic`. Late results for it are discarded from now on.
    pub async fn close(&self, topic: &Topic) -> bool {
        let Some(feed) = lock(&self.feeds).remove(topic) else {
            return false;
        };
        let handle = feed.close();
        feed.publish(&lock(&feed.state));
        tracing::info!(%topic, generation = feed.generation, "Closed topic");
        if let Some(handle) = handle {
            self.session.unsubscribe(&handle).await;
        }
        true
    }

    /// Close every open topic.
    pub async fn close_all(&self) {
        for topic in self.topics() {
            self.close(&topic).await;
        }
    }

    fn forget(&self, feed: &Arc<Feed<T>>) {
        feed.close();
        let mut feeds = lock(&self.feeds);
        if feeds.get(&feed.topic).is_some_and(|current| Arc::ptr_eq(current, feed)) {
            feeds.remove(&feed.topic);
        }
    }

    pub fn snapshot(&self, topic: &Topic) -> Option<StreamSnapshot<T>> {
        lock(&self.feeds)
            .get(topic)
            .map(|feed| feed.snapshot_tx.borrow().clone())
    }

    pub fn watch(&self, topic: &Topic) -> Option<watch::Receiver<StreamSnapshot<T>>> {
        lock(&self.feeds).get(topic).map(|feed| feed.snapshot_tx.subscribe())
    }

    pub fn is_open(&self, topic: &Topic) -> bool {
        lock(&self.feeds).contains_key(topic)
    }
}

impl<T: StreamItem> FeedSet<T> {
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = lock(&self.feeds).keys().cloned().collect();
        topics.sort();
        topics
    }
}
