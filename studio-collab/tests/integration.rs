//! End-to-end tests: real server, real WebSocket clients.

use std::future::Future;
use std::sync::Arc;

use studio_collab::controller::{ConnectionState, SyncEvent};
use studio_collab::error::CollabError;
use studio_collab::protocol::UserInfo;
use studio_collab::registry::SessionRegistry;
use studio_collab::server::{ServerConfig, SyncServer};
use studio_collab::client::SyncClient;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Start a server on an ephemeral port; returns its URL and registry.
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

/// Connect a client and wait until the room state has arrived.
async fn connect_client(
    name: &str,
    room_id: &str,
    url: &str,
) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(UserInfo::new(name), room_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected)).await;
    (client, events)
}

/// Receive events until one matches, failing after two seconds.
async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut matches: F) -> SyncEvent
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

/// Poll `check` until it returns true, failing after two seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_client_connects_and_receives_state() {
    let (url, _) = start_test_server().await;
    let mut client = SyncClient::new(UserInfo::new("Alice"), "r1", &url);
    let mut events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();

    assert_eq!(events.recv().await, Some(SyncEvent::Connected));
    assert_eq!(
        events.recv().await,
        Some(SyncEvent::StateSynced { text: String::new() })
    );
    assert_eq!(events.recv().await, Some(SyncEvent::UsersList(Vec::new())));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (url, registry) = start_test_server().await;

    let (alice, mut alice_events) = connect_client("Alice", "r1", &url).await;
    alice.insert_text(0, "hello").await.unwrap();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.content("r1").await == "hello" }
    })
    .await;

    let (bob, _bob_events) = connect_client("Bob", "r1", &url).await;
    assert_eq!(bob.text().await, "hello");
    assert_eq!(bob.users().await, vec![alice.user().clone()]);

    bob.insert_text(5, " world").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SyncEvent::RemoteUpdate { .. })).await;

    assert_eq!(alice.text().await, "hello world");
    assert_eq!(bob.text().await, "hello world");
    assert_eq!(registry.content("r1").await, "hello world");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (url, registry) = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "r1", &url).await;
    let (bob, _bob_events) = connect_client("Bob", "r1", &url).await;

    let (a, b) = tokio::join!(alice.insert_text(0, "AAA"), bob.insert_text(0, "BBB"));
    a.unwrap();
    b.unwrap();

    eventually(|| {
        let registry = registry.clone();
        async move { registry.content("r1").await.len() == 6 }
    })
    .await;
    let server_text = registry.content("r1").await;
    timeout(Duration::from_secs(2), async {
        while alice.text().await != server_text || bob.text().await != server_text {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replicas did not converge");
    assert!(server_text.contains("AAA") && server_text.contains("BBB"));
}

#[tokio::test]
async fn test_user_joined_and_left() {
    let (url, _) = start_test_server().await;
    let (alice, mut alice_events) = connect_client("Alice", "r1", &url).await;
    let (bob, _bob_events) = connect_client("Bob", "r1", &url).await;

    let joined = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::UserJoined(_))).await;
    assert_eq!(joined, SyncEvent::UserJoined(bob.user().clone()));
    assert_eq!(alice.users().await.len(), 1);

    bob.disconnect().await;
    let left = wait_for(&mut alice_events, |e| matches!(e, SyncEvent::UserLeft { .. })).await;
    assert_eq!(
        left,
        SyncEvent::UserLeft {
            user_id: bob.user().user_id.clone(),
            user_name: "Bob".to_string(),
        }
    );
    assert!(alice.users().await.is_empty());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, registry) = start_test_server().await;
    let (alice, _alice_events) = connect_client("Alice", "r1", &url).await;
    let (bob, _bob_events) = connect_client("Bob", "r2", &url).await;

    alice.insert_text(0, "only in r1").await.unwrap();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.content("r1").await == "only in r1" }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.text().await, "");
    assert_eq!(registry.content("r2").await, "");
}

#[tokio::test]
async fn test_offline_edits_replayed_after_sync() {
    let (url, registry) = start_test_server().await;
    let mut client = SyncClient::new(UserInfo::new("Offline"), "r1", &url);
    let mut events = client.take_event_rx().unwrap();

    client.insert_text(0, "draft").await.unwrap();
    assert_eq!(client.pending_len().await, 1);

    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected)).await;

    eventually(|| {
        let registry = registry.clone();
        async move { registry.content("r1").await == "draft" }
    })
    .await;
    assert_eq!(client.pending_len().await, 0);
}

#[tokio::test]
async fn test_disconnect_releases_room() {
    let (url, registry) = start_test_server().await;
    let (client, mut events) = connect_client("Alice", "r1", &url).await;
    assert_eq!(registry.stats("r1").await.connection_count, 1);

    client.disconnect().await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(client.text().await, "");

    eventually(|| {
        let registry = registry.clone();
        async move { registry.stats("r1").await.connection_count == 0 }
    })
    .await;
    assert_eq!(registry.reap_idle_rooms().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let (url, registry) = start_test_server().await;
    let (client, mut events) = connect_client("Alice", "r1", &url).await;
    client.insert_text(0, "kept on server").await.unwrap();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.content("r1").await == "kept on server" }
    })
    .await;

    client.disconnect().await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await;
    client.connect().await.unwrap();
    let synced = wait_for(&mut events, |e| matches!(e, SyncEvent::StateSynced { .. })).await;
    assert_eq!(
        synced,
        SyncEvent::StateSynced {
            text: "kept on server".to_string()
        }
    );
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _) = start_test_server().await;
    let (client, mut events) = connect_client("PingUser", "r1", &url).await;

    client.send_ping().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pong)).await;
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let (url, _) = start_test_server().await;
    let (client, _events) = connect_client("Alice", "r1", &url).await;
    assert!(matches!(
        client.connect().await,
        Err(CollabError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    // Accepts at the TCP level (backlog) but never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let client = Arc::new(SyncClient::new(UserInfo::new("Stuck"), "r1", url));
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connecting);
    client.disconnect().await;

    let result = timeout(Duration::from_secs(2), connecting)
        .await
        .expect("connect should abort")
        .unwrap();
    assert!(matches!(result, Err(CollabError::Cancelled)));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    drop(listener);
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::with_defaults());
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await.unwrap() });
    }

    let (client, _events) = connect_client("Alice", "r1", &url).await;
    client.insert_text(0, "x").await.unwrap();

    eventually(|| {
        let server = server.clone();
        async move {
            let stats = server.stats().await;
            stats.total_connections == 1 && stats.total_messages >= 2
        }
    })
    .await;
    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
}
