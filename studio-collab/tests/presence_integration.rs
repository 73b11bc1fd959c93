//! Integration tests for cursor and selection presence.
//!
//! These start a real server and connect clients, verifying that presence
//! is relayed, attributed to the sender, shipped in the join snapshot and
//! cleared when a user leaves.

use std::sync::Arc;

use studio_collab::client::SyncClient;
use studio_collab::controller::SyncEvent;
use studio_collab::presence::{CursorPosition, Position};
use studio_collab::protocol::UserInfo;
use studio_collab::registry::SessionRegistry;
use studio_collab::server::{ServerConfig, SyncServer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn start_test_server() -> (String, Arc<SessionRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    let server = SyncServer::with_registry(ServerConfig::default(), registry.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), registry)
}

/// Connect a client to the test server, draining up to the Connected event.
async fn connect_client(
    name: &str,
    room_id: &str,
    url: &str,
) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(UserInfo::new(name), room_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::Connected)).await;
    (client, events)
}

async fn next_matching<F>(events: &mut mpsc::Receiver<SyncEvent>, mut matches: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ─── Cursor Relay ────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_relayed_to_others() {
    let (url, _) = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "r1", &url).await;
    let (_bob, mut bob_events) = connect_client("Bob", "r1", &url).await;

    alice.update_cursor(2, 7).await.unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::CursorChanged(_))).await;
    assert_eq!(
        event,
        SyncEvent::CursorChanged(CursorPosition::new(alice.user().user_id.clone(), 2, 7))
    );
}

#[tokio::test]
async fn test_cursor_not_echoed_to_sender() {
    let (url, _) = start_test_server().await;
    let (alice, mut alice_events) = connect_client("Alice", "r1", &url).await;
    let (_bob, _bob_events) = connect_client("Bob", "r1", &url).await;

    alice.update_cursor(0, 1).await.unwrap();
    alice.send_ping().await.unwrap();

    // Pong arrives after anything the cursor could have triggered.
    let mut saw_cursor = false;
    timeout(Duration::from_secs(2), async {
        while let Some(event) = alice_events.recv().await {
            match event {
                SyncEvent::CursorChanged(_) => saw_cursor = true,
                SyncEvent::Pong => break,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(!saw_cursor);
    assert!(alice.cursors().await.is_empty());
}

#[tokio::test]
async fn test_selection_relayed_to_others() {
    let (url, registry) = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "r1", &url).await;
    let (bob, mut bob_events) = connect_client("Bob", "r1", &url).await;

    alice
        .update_selection(Position::new(0, 0), Position::new(1, 3))
        .await
        .unwrap();

    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::SelectionChanged(_))).await;
    let selections = bob.selections().await;
    let selection = &selections[&alice.user().user_id];
    assert_eq!(selection.start, Position::new(0, 0));
    assert_eq!(selection.end, Position::new(1, 3));

    let room = registry.get_or_create_room("r1").await;
    let presence = room.presence().await;
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0].user_id, alice.user().user_id);
}

// ─── Join Snapshot ───────────────────────────────────────────────

#[tokio::test]
async fn test_late_joiner_receives_existing_presence() {
    let (url, registry) = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "r1", &url).await;

    alice.update_cursor(4, 2).await.unwrap();
    timeout(Duration::from_secs(2), async {
        loop {
            let room = registry.get_or_create_room("r1").await;
            if !room.presence().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (bob, _bob_events) = connect_client("Bob", "r1", &url).await;
    let cursors = bob.cursors().await;
    assert_eq!(
        cursors.get(&alice.user().user_id),
        Some(&CursorPosition::new(alice.user().user_id.clone(), 4, 2))
    );
}

// ─── Departure ───────────────────────────────────────────────────

#[tokio::test]
async fn test_presence_cleared_on_leave() {
    let (url, registry) = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "r1", &url).await;
    let (bob, mut bob_events) = connect_client("Bob", "r1", &url).await;

    alice
        .update_selection(Position::new(0, 0), Position::new(0, 4))
        .await
        .unwrap();
    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::SelectionChanged(_))).await;

    alice.disconnect().await;
    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::UserLeft { .. })).await;

    assert!(bob.selections().await.is_empty());
    let room = registry.get_or_create_room("r1").await;
    assert!(room.presence().await.is_empty());
}

#[tokio::test]
async fn test_presence_while_offline_is_dropped() {
    let (_, registry) = start_test_server().await;
    let client = SyncClient::new(UserInfo::new("Offline"), "r1", "ws://127.0.0.1:1");

    client.update_cursor(1, 1).await.unwrap();
    client
        .update_selection(Position::new(0, 0), Position::new(0, 1))
        .await
        .unwrap();

    assert!(!registry.contains_room("r1").await);
}
