//! End-to-end behavior of the sync engine over the in-memory broker

mod common;

use assert_matches::assert_matches;
use common::*;
use livesync::client::error::{MutationError, SubscribeError, SyncError};
use livesync::client::optimistic::{MutationKind, Reaction, Trust};
use livesync::client::realtime::{ReconnectPolicy, SessionEvent, SessionState};
use livesync::client::MentionResolution;
use livesync::shared::{OutgoingMessage, Topic};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn wait_for_event(events: &mut broadcast::Receiver<SessionEvent>, wanted: SessionEvent) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed before {wanted:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

fn ids(h: &Harness, room: &str) -> Vec<u64> {
    h.engine
        .room_snapshot(room)
        .map(|s| s.messages.iter().map(|m| m.id).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_history_then_live_message() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=20));

    let rx = assert_ok!(h.engine.open_room("lobby").await);
    assert_ids!(rx.borrow(), 1..=20);
    assert!(rx.borrow().is_live);
    assert_eq!(rx.borrow().loaded_history_cursor, Some(0));

    assert_eq!(h.broker.publish(&room, &json(&message("lobby", 21))), 1);
    eventually!(ids(&h, "lobby") == (1..=21).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_live_before_history_is_queued_and_deduplicated() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=20));
    h.messages.hold(&room);

    let engine = Arc::clone(&h.engine);
    let opening = tokio::spawn(async move { engine.open_room("lobby").await });
    eventually!(h.broker.subscriber_count(&room) == 1);

    h.broker.publish(&room, &json(&message("lobby", 15)));
    h.broker.publish(&room, &json(&message("lobby", 21)));
    eventually!(h.engine.room_snapshot("lobby").is_some_and(|s| s.queued_live == 2));

    let pending = h.engine.room_snapshot("lobby").unwrap();
    assert!(!pending.is_live);
    assert!(pending.loading);
    assert!(pending.messages.is_empty());

    h.messages.release(&room);
    let rx = opening.await.unwrap().unwrap();
    let snapshot = rx.borrow().clone();
    assert_ids!(snapshot, 1..=21);
    assert_eq!(snapshot.queued_live, 0);
    assert!(snapshot.is_live);
}

#[tokio::test]
async fn test_out_of_order_live_message_is_inserted_in_place() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", [1, 2, 4].into_iter()));
    assert_ok!(h.engine.open_room("lobby").await);

    h.broker.publish(&room, &json(&message("lobby", 3)));
    eventually!(ids(&h, "lobby") == vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_undecodable_payload_is_dropped() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=2));
    assert_ok!(h.engine.open_room("lobby").await);

    h.broker.publish(&room, "{not json");
    h.broker.publish(&room, &json(&message("lobby", 3)));
    eventually!(ids(&h, "lobby") == vec![1, 2, 3]);
}

#[tokio::test]
async fn test_load_older_prepends_page() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 21..=40));
    h.messages.set_page(&room, 1, page("lobby", 1..=20));
    assert_ok!(h.engine.open_room("lobby").await);

    assert_eq!(assert_ok!(h.engine.load_older("lobby").await), 20);
    let snapshot = h.engine.room_snapshot("lobby").unwrap();
    assert_ids!(snapshot, 1..=40);
    assert_eq!(snapshot.loaded_history_cursor, Some(1));

    // Past the end of history
    assert_eq!(assert_ok!(h.engine.load_older("lobby").await), 0);
    assert_eq!(h.messages.calls().last(), Some(&(room, 2)));
}

#[tokio::test]
async fn test_history_failure_keeps_topic_open_for_retry() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=3));
    h.messages.fail_next(1);

    let err = h.engine.open_room("lobby").await.unwrap_err();
    assert_matches!(err, SyncError::History(_));
    let failed = h.engine.room_snapshot("lobby").unwrap();
    assert!(failed.history_error.is_some());
    assert!(!failed.is_live);

    assert_eq!(assert_ok!(h.engine.retry_history("lobby").await), 3);
    let snapshot = h.engine.room_snapshot("lobby").unwrap();
    assert_ids!(snapshot, 1..=3);
    assert!(snapshot.history_error.is_none());
    assert!(snapshot.is_live);
}

#[tokio::test]
async fn test_open_twice_keeps_one_subscription() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=5));

    let first = assert_ok!(h.engine.open_room("lobby").await);
    let second = assert_ok!(h.engine.open_room("lobby").await);
    assert_eq!(first.borrow().generation, second.borrow().generation);
    assert_eq!(h.broker.subscriber_count(&room), 1);
    assert_eq!(h.engine.session().active_topics().await, vec![room.clone()]);
    assert_eq!(h.messages.calls().len(), 1);

    h.broker.publish(&room, &json(&message("lobby", 6)));
    eventually!(ids(&h, "lobby") == (1..=6).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_close_then_reopen_starts_fresh_generation() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=5));

    let first = assert_ok!(h.engine.open_room("lobby").await);
    let first_generation = first.borrow().generation;
    assert!(h.engine.close_room("lobby").await);
    assert!(!h.engine.close_room("lobby").await);
    assert!(h.engine.room_snapshot("lobby").is_none());

    // Last registration gone, so the idle session closed
    eventually!(h.engine.state() == SessionState::Closed);
    assert_eq!(h.broker.subscriber_count(&room), 0);

    let second = assert_ok!(h.engine.open_room("lobby").await);
    assert!(second.borrow().generation > first_generation);
    assert_ids!(second.borrow(), 1..=5);
    assert_eq!(h.broker.connect_count(), 2);
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_fills_gap() {
    let h = Harness::new();
    let lobby = Topic::room("lobby");
    let dev = Topic::room("dev");
    h.messages.set_page(&lobby, 0, page("lobby", 1..=20));
    h.messages.set_page(&dev, 0, page("dev", 1..=3));
    assert_ok!(h.engine.open_room("lobby").await);
    assert_ok!(h.engine.open_room("dev").await);

    // Missed while the link was down; only history knows about it
    h.messages.set_page(&lobby, 0, page("lobby", 2..=21));
    let mut events = h.engine.events();
    h.broker.drop_connections();

    wait_for_event(&mut events, SessionEvent::Reconnected).await;
    assert_eq!(h.broker.subscriber_count(&lobby), 1);
    assert_eq!(h.broker.subscriber_count(&dev), 1);
    assert_eq!(h.broker.connect_count(), 2);

    eventually!(ids(&h, "lobby") == (1..=21).collect::<Vec<_>>());
    h.broker.publish(&lobby, &json(&message("lobby", 21)));
    h.broker.publish(&lobby, &json(&message("lobby", 22)));
    eventually!(ids(&h, "lobby") == (1..=22).collect::<Vec<_>>());
    assert!(h.engine.room_snapshot("lobby").unwrap().is_live);
    assert_ids!(h.engine.room_snapshot("dev").unwrap(), 1..=3);
}

#[tokio::test]
async fn test_gap_longer_than_a_page_is_filled() {
    let h = Harness::new();
    let lobby = Topic::room("lobby");
    h.messages.set_page(&lobby, 0, page("lobby", 1..=20));
    assert_ok!(h.engine.open_room("lobby").await);

    // Thirty messages missed while offline
    h.messages.set_page(&lobby, 0, page("lobby", 31..=50));
    h.messages.set_page(&lobby, 1, page("lobby", 11..=30));
    let mut events = h.engine.events();
    h.broker.drop_connections();

    wait_for_event(&mut events, SessionEvent::Reconnected).await;
    eventually!(ids(&h, "lobby") == (1..=50).collect::<Vec<_>>());
    eventually!(h.engine.room_snapshot("lobby").is_some_and(|s| s.is_live));
    assert!(!h.messages.calls().contains(&(lobby, 2)));
}

#[tokio::test]
async fn test_rejected_replay_detaches_only_that_topic() {
    let h = Harness::new();
    let lobby = Topic::room("lobby");
    let dev = Topic::room("dev");
    h.messages.set_page(&lobby, 0, page("lobby", 1..=3));
    h.messages.set_page(&dev, 0, page("dev", 1..=3));
    assert_ok!(h.engine.open_room("lobby").await);
    assert_ok!(h.engine.open_room("dev").await);

    h.broker.reject_topic(&lobby);
    let mut events = h.engine.events();
    h.broker.drop_connections();
    wait_for_event(&mut events, SessionEvent::Reconnected).await;

    eventually!(h.engine.room_snapshot("lobby").is_some_and(|s| s.subscription_error.is_some()));
    eventually!(h.engine.room_snapshot("dev").is_some_and(|s| s.is_live));
    let detached = h.engine.room_snapshot("lobby").unwrap();
    assert!(!detached.is_live);
    assert_matches!(detached.subscription_error, Some(SubscribeError::Rejected { ref topic, .. }) if *topic == lobby);
    assert_ids!(detached, 1..=3);
    assert_eq!(h.engine.session().active_topics().await, vec![dev.clone()]);

    // Still refused, so reopening reports it
    let err = h.engine.open_room("lobby").await.unwrap_err();
    assert_matches!(err, SyncError::Subscribe(SubscribeError::Rejected { .. }));
    assert!(h.engine.room_snapshot("lobby").is_none());
}

#[tokio::test]
async fn test_broker_error_detaches_topic_until_reopened() {
    let h = Harness::new();
    let lobby = Topic::room("lobby");
    h.messages.set_page(&lobby, 0, page("lobby", 1..=5));
    let first = assert_ok!(h.engine.open_room("lobby").await);
    let first_generation = first.borrow().generation;

    h.broker.error(&lobby, "access revoked");
    eventually!(h.engine.room_snapshot("lobby").is_some_and(|s| s.subscription_error.is_some()));
    assert!(!h.engine.room_snapshot("lobby").unwrap().is_live);

    let second = assert_ok!(h.engine.open_room("lobby").await);
    let snapshot = second.borrow().clone();
    assert!(snapshot.generation > first_generation);
    assert!(snapshot.is_live);
    assert!(snapshot.subscription_error.is_none());
    assert!(!first.borrow().is_live);

    h.broker.publish(&lobby, &json(&message("lobby", 6)));
    eventually!(ids(&h, "lobby") == (1..=6).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_attempt_ceiling_closes_session() {
    let h = Harness::with_options(|options| {
        options.session.policy = ReconnectPolicy::fixed(Duration::from_millis(20)).with_max_attempts(2);
    });
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=2));
    h.broker.fail_next_connects(10);

    let mut events = h.engine.events();
    assert_ok!(h.engine.open_room("lobby").await);
    wait_for_event(&mut events, SessionEvent::GaveUp { attempts: 2 }).await;

    eventually!(h.engine.state() == SessionState::Closed);
    eventually!(h.engine.room_snapshot("lobby").is_some_and(|s| !s.is_live));
    assert_eq!(h.broker.connect_count(), 2);
}

#[tokio::test]
async fn test_reopen_after_give_up_starts_new_session() {
    let h = Harness::with_options(|options| {
        options.session.policy = ReconnectPolicy::fixed(Duration::from_millis(20)).with_max_attempts(2);
    });
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=2));
    h.broker.fail_next_connects(2);

    let mut events = h.engine.events();
    let first = assert_ok!(h.engine.open_room("lobby").await);
    wait_for_event(&mut events, SessionEvent::GaveUp { attempts: 2 }).await;
    eventually!(h.engine.state() == SessionState::Closed);
    eventually!(h.engine.room_snapshot("lobby").is_some_and(|s| !s.is_live));

    let second = assert_ok!(h.engine.open_room("lobby").await);
    assert!(second.borrow().generation > first.borrow().generation);
    eventually!(h.broker.subscriber_count(&room) == 1);
    eventually!(h.engine.state() == SessionState::Connected);
    assert!(h.engine.room_snapshot("lobby").unwrap().is_live);
    assert_eq!(h.engine.session().active_topics().await, vec![room.clone()]);

    h.broker.publish(&room, &json(&message("lobby", 3)));
    eventually!(ids(&h, "lobby") == vec![1, 2, 3]);
}

#[tokio::test]
async fn test_send_resolves_mention_from_observed_senders() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(
        &room,
        0,
        vec![message_from("lobby", 2, 7, "bob"), message_from("lobby", 1, 42, "alice")],
    );
    assert_ok!(h.engine.open_room("lobby").await);

    let receipt = assert_ok!(h.engine.send("lobby", "hi @alice").await);
    assert_eq!(
        receipt.mention,
        MentionResolution::Resolved {
            name: "alice".to_string(),
            user_id: 42
        }
    );

    let published = h.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, room.publish_destination().unwrap());
    let sent: OutgoingMessage = serde_json::from_str(&published[0].1).unwrap();
    assert_eq!(sent.target_user_id, Some(42));
    assert_eq!(sent.sender_id, Some(USER));
    assert_eq!(sent.body, "hi @alice");
}

#[tokio::test]
async fn test_unresolved_mention_still_sends() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, vec![message_from("lobby", 1, 42, "alice")]);
    assert_ok!(h.engine.open_room("lobby").await);

    let receipt = assert_ok!(h.engine.send("lobby", "@ghost are you there").await);
    assert_matches!(receipt.mention, MentionResolution::Unresolved(ref miss) if miss.name == "ghost");

    let sent: OutgoingMessage = serde_json::from_str(&h.broker.published()[0].1).unwrap();
    assert_eq!(sent.target_user_id, None);
}

#[tokio::test]
async fn test_like_is_visible_while_pending_then_confirmed() {
    let h = Harness::new();
    h.engine.seed_reaction(5, MutationKind::Like, Reaction::new(false, 5));
    h.mutations.respond_count(Ok(9));
    h.mutations.hold();

    let engine = Arc::clone(&h.engine);
    let toggling = tokio::spawn(async move { engine.toggle_like(5).await });
    eventually!(h.mutations.calls().len() == 1);

    let pending = h.engine.reaction(5, MutationKind::Like).unwrap();
    assert!(pending.active);
    assert_eq!(pending.count, 6);
    assert_eq!(pending.count_trust, Trust::Advisory);

    // Same key while in flight: ignored, no second request
    assert_eq!(assert_ok!(h.engine.toggle_like(5).await), None);
    assert_eq!(h.mutations.calls().len(), 1);

    h.mutations.release();
    let confirmed = toggling.await.unwrap().unwrap();
    assert_eq!(confirmed, Some(Reaction::new(true, 9)));
    assert_eq!(h.engine.reaction(5, MutationKind::Like), Some(Reaction::new(true, 9)));
}

#[tokio::test]
async fn test_failed_like_rolls_back() {
    let h = Harness::new();
    h.engine.seed_reaction(5, MutationKind::Like, Reaction::new(false, 5));
    h.mutations.respond_count(Err(MutationError::Status { status: 500 }));

    let err = h.engine.toggle_like(5).await.unwrap_err();
    assert_eq!(err, SyncError::Mutation(MutationError::Status { status: 500 }));
    assert_eq!(h.engine.reaction(5, MutationKind::Like), Some(Reaction::new(false, 5)));

    // A later toggle is accepted again
    h.mutations.respond_count(Ok(6));
    assert_eq!(assert_ok!(h.engine.toggle_like(5).await), Some(Reaction::new(true, 6)));
}

#[tokio::test]
async fn test_like_and_dislike_are_independent() {
    let h = Harness::new();
    h.mutations.respond_count(Ok(1));
    h.mutations.respond_count(Ok(1));

    assert_eq!(assert_ok!(h.engine.toggle_like(8).await), Some(Reaction::new(true, 1)));
    assert_eq!(
        assert_ok!(h.engine.toggle_dislike(8).await),
        Some(Reaction::default().toggled())
    );
    assert_eq!(h.engine.reaction(8, MutationKind::Like), Some(Reaction::new(true, 1)));
    assert_eq!(h.mutations.calls(), vec![("like", 8), ("dislike", 8)]);
}

#[tokio::test]
async fn test_dislike_response_updates_like_count() {
    let h = Harness::new();
    h.engine.seed_reaction(8, MutationKind::Like, Reaction::new(false, 3));
    h.engine.seed_reaction(8, MutationKind::Dislike, Reaction::new(false, 4));
    h.mutations.respond_count(Ok(2));

    let dislike = assert_ok!(h.engine.toggle_dislike(8).await).unwrap();
    assert!(dislike.active);
    assert_eq!(dislike.count, 5);
    assert_eq!(dislike.count_trust, Trust::Advisory);
    assert_eq!(h.engine.reaction(8, MutationKind::Dislike), Some(dislike));
    assert_eq!(h.engine.reaction(8, MutationKind::Like), Some(Reaction::new(false, 2)));
}

#[tokio::test]
async fn test_cancelled_like_rolls_back() {
    let h = Harness::new();
    h.engine.seed_reaction(5, MutationKind::Like, Reaction::new(false, 5));
    h.mutations.respond_count(Ok(9));
    h.mutations.hold();

    let engine = Arc::clone(&h.engine);
    let toggling = tokio::spawn(async move { engine.toggle_like(5).await });
    eventually!(h.mutations.calls().len() == 1);
    assert!(h.engine.reaction(5, MutationKind::Like).unwrap().active);

    toggling.abort();
    assert!(toggling.await.unwrap_err().is_cancelled());
    assert_eq!(h.engine.reaction(5, MutationKind::Like), Some(Reaction::new(false, 5)));

    // The key is free again
    h.mutations.release();
    assert_eq!(assert_ok!(h.engine.toggle_like(5).await), Some(Reaction::new(true, 9)));
}

#[tokio::test]
async fn test_notifications_unread_and_mark_read() {
    let h = Harness::new();
    let queue = Topic::notifications(USER);
    h.notifications.set_page(
        &queue,
        0,
        vec![notification(USER, 3, false), notification(USER, 2, true), notification(USER, 1, false)],
    );

    assert_ok!(h.engine.open_notifications().await);
    assert_eq!(h.engine.unread_count(), 2);

    assert!(assert_ok!(h.engine.mark_read(1).await));
    assert_eq!(h.engine.unread_count(), 1);
    // Already read locally
    assert!(!assert_ok!(h.engine.mark_read(1).await));
    assert!(!assert_ok!(h.engine.mark_read(2).await));

    h.mutations.respond_read(Err(MutationError::Network("reset".to_string())));
    assert!(h.engine.mark_read(3).await.is_err());
    assert_eq!(h.engine.unread_count(), 1);
    assert_eq!(h.mutations.calls(), vec![("mark_read", 1), ("mark_read", 3)]);

    h.broker.publish(&queue, &json(&notification(USER, 4, false)));
    eventually!(h.engine.unread_count() == 2);
}

#[tokio::test]
async fn test_shutdown_stops_delivery() {
    let h = Harness::new();
    let room = Topic::room("lobby");
    h.messages.set_page(&room, 0, page("lobby", 1..=2));
    let rx = assert_ok!(h.engine.open_room("lobby").await);

    h.engine.shutdown().await;
    assert_eq!(h.engine.state(), SessionState::Closed);
    assert_eq!(h.broker.publish(&room, &json(&message("lobby", 3))), 0);
    assert_ids!(rx.borrow(), 1..=2);
}
