//! End-to-end replication through a real relay.
//!
//! These tests start a relay on an ephemeral port and connect real sync
//! clients, each driving its own replica store.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use todo_collab::{
    ClientConfig, ConnectionState, HostConfig, MessageType, PeerInfo, RelayConfig, RelayServer,
    ReplicationHost, SessionValidator, SyncClient, SyncEvent, SyncMessage, TokenAllowList,
};
use todo_core::{ItemUpdate, Replica, StoreConfig, TodoStore, UpdateFeed};

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay(validator: Option<Arc<dyn SessionValidator>>) -> (Arc<RelayServer>, String) {
    start_relay_with(RelayConfig::for_testing(), validator).await
}

async fn start_relay_with(
    config: RelayConfig,
    validator: Option<Arc<dyn SessionValidator>>,
) -> (Arc<RelayServer>, String) {
    let host = Arc::new(ReplicationHost::new(HostConfig::for_testing()).unwrap());
    let mut relay = RelayServer::new(config, host);
    if let Some(validator) = validator {
        relay = relay.with_validator(validator);
    }
    let relay = Arc::new(relay);
    let listener = relay.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(relay.clone().serve(listener));
    (relay, url)
}

/// Texts currently in the host's authoritative document.
async fn host_texts(relay: &RelayServer) -> Vec<String> {
    let replica = Replica::new();
    replica
        .apply_remote_update(&relay.host().encode_state().await)
        .unwrap();
    let store = TodoStore::open(replica, &StoreConfig::default()).unwrap();
    let mut texts: Vec<String> = store.get_all().into_iter().map(|t| t.text).collect();
    texts.sort();
    texts
}

async fn wait_for_host(relay: &RelayServer, expected: &[&str]) {
    let deadline = Instant::now() + WAIT;
    while host_texts(relay).await != expected {
        assert!(Instant::now() < deadline, "host never reached {expected:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_peers(relay: &RelayServer, count: usize) {
    let deadline = Instant::now() + WAIT;
    while relay.host().peer_count().await < count {
        assert!(Instant::now() < deadline, "peers never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A client process: replica store + sync client.
struct Peer {
    store: TodoStore,
    feed: UpdateFeed,
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
}

impl Peer {
    async fn join(url: &str, name: &str) -> Self {
        let store = TodoStore::open(Replica::new(), &StoreConfig::default()).unwrap();
        let feed = store.replica().update_feed().unwrap();
        let mut client = SyncClient::new(PeerInfo::new(name), ClientConfig::for_testing(url));
        let events = client.take_event_rx().unwrap();
        client.connect(store.replica().state_vector()).await.unwrap();
        Self {
            store,
            feed,
            client,
            events,
        }
    }

    /// Ship local updates to the host.
    async fn push(&mut self) {
        for update in self.feed.drain() {
            self.client.send_update(update).await.unwrap();
        }
    }

    async fn apply(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::RemoteUpdate { update, .. } | SyncEvent::Synced(update) => {
                self.store.replica().apply_remote_update(&update).unwrap();
            }
            SyncEvent::DiffRequested(sv) => {
                let diff = self.store.replica().encode_diff(&sv).unwrap();
                self.client.send_sync_step2(diff).await.unwrap();
            }
            _ => {}
        }
        self.store.flush_deliveries();
    }

    /// Process events until `done` holds for the store.
    async fn until(&mut self, done: impl Fn(&TodoStore) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done(&self.store) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = timeout(remaining, self.events.recv())
                .await
                .expect("timed out waiting for sync")
                .expect("event channel closed");
            self.apply(event).await;
        }
    }

    fn texts(&self) -> Vec<String> {
        let mut texts: Vec<String> = self.store.get_all().into_iter().map(|t| t.text).collect();
        texts.sort();
        texts
    }
}

fn has_texts(expected: &'static [&'static str]) -> impl Fn(&TodoStore) -> bool {
    move |store| {
        let mut texts: Vec<String> = store.get_all().into_iter().map(|t| t.text).collect();
        texts.sort();
        texts == expected
    }
}

#[tokio::test]
async fn test_two_peers_converge() {
    let (relay, url) = start_relay(None).await;
    let mut alice = Peer::join(&url, "alice").await;
    let mut bob = Peer::join(&url, "bob").await;

    alice.store.create("Buy milk").unwrap();
    alice.push().await;
    bob.until(has_texts(&["Buy milk"])).await;

    let id = bob.store.get_all()[0].id.clone();
    bob.store.update(&id, &ItemUpdate::complete(true)).unwrap();
    bob.store.create("Walk the dog").unwrap();
    bob.push().await;

    alice
        .until(|store| store.get_all().len() == 2 && store.get_all()[0].complete)
        .await;
    assert_eq!(alice.store.get_all(), bob.store.get_all());
    wait_for_host(&relay, &["Buy milk", "Walk the dog"]).await;
}

#[tokio::test]
async fn test_concurrent_edits_merge() {
    let (relay, url) = start_relay(None).await;
    let mut alice = Peer::join(&url, "alice").await;
    let mut bob = Peer::join(&url, "bob").await;

    alice.store.create("from alice").unwrap();
    bob.store.create("from bob").unwrap();
    alice.push().await;
    bob.push().await;

    alice.until(has_texts(&["from alice", "from bob"])).await;
    bob.until(has_texts(&["from alice", "from bob"])).await;
    assert_eq!(alice.store.get_all(), bob.store.get_all());
    wait_for_host(&relay, &["from alice", "from bob"]).await;
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let (relay, url) = start_relay(None).await;
    let mut alice = Peer::join(&url, "alice").await;
    for text in ["one", "three", "two"] {
        alice.store.create(text).unwrap();
    }
    alice.push().await;
    wait_for_host(&relay, &["one", "three", "two"]).await;

    let mut carol = Peer::join(&url, "carol").await;
    carol.until(has_texts(&["one", "three", "two"])).await;
    assert_eq!(carol.texts(), alice.texts());
}

#[tokio::test]
async fn test_offline_updates_replayed_on_connect() {
    let (relay, url) = start_relay(None).await;

    let mut store = TodoStore::open(Replica::new(), &StoreConfig::default()).unwrap();
    let mut feed = store.replica().update_feed().unwrap();
    let mut client = SyncClient::new(PeerInfo::new("anon9"), ClientConfig::for_testing(&url));

    store.create("written offline").unwrap();
    for update in feed.drain() {
        client.send_update(update).await.unwrap();
    }
    assert_eq!(client.offline_queue_len().await, 1);

    client.connect(store.replica().state_vector()).await.unwrap();
    assert_eq!(client.offline_queue_len().await, 0);
    wait_for_host(&relay, &["written offline"]).await;
}

#[tokio::test]
async fn test_peer_join_and_leave_events() {
    let (relay, url) = start_relay(None).await;
    let mut alice = Peer::join(&url, "alice").await;
    wait_for_peers(&relay, 1).await;
    let mut bob = Peer::join(&url, "bob").await;
    let bob_id = bob.client.peer_info().peer_id;

    let mut saw_join = false;
    let deadline = Instant::now() + WAIT;
    while !saw_join {
        let event = timeout(deadline - Instant::now(), alice.events.recv())
            .await
            .unwrap()
            .unwrap();
        if let SyncEvent::PeerJoined(info) = &event {
            saw_join = info.peer_id == bob_id && info.name == "bob";
        }
        alice.apply(event).await;
    }

    bob.client.disconnect().await;
    assert_eq!(bob.client.connection_state().await, ConnectionState::Disconnected);
    loop {
        let event = timeout(deadline - Instant::now(), alice.events.recv())
            .await
            .unwrap()
            .unwrap();
        if event == SyncEvent::PeerLeft(bob_id) {
            break;
        }
        alice.apply(event).await;
    }
}

#[tokio::test]
async fn test_connection_count_returns_to_zero() {
    let (relay, url) = start_relay(None).await;
    let mut alice = Peer::join(&url, "alice").await;
    let mut bob = Peer::join(&url, "bob").await;
    wait_for_peers(&relay, 2).await;
    assert_eq!(relay.connection_count().await, 2);

    alice.client.disconnect().await;
    bob.client.disconnect().await;
    let deadline = Instant::now() + WAIT;
    while relay.connection_count().await > 0 {
        assert!(Instant::now() < deadline, "connections never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = relay.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.closed_connections, 2);
    assert_eq!(relay.host().peer_count().await, 0);
}

#[tokio::test]
async fn test_rejected_session_is_closed() {
    let allow: Arc<dyn SessionValidator> = Arc::new(TokenAllowList::new(["anon1"]));
    let (relay, url) = start_relay(Some(allow)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/?session=intruder"))
        .await
        .unwrap();
    let close = timeout(WAIT, ws.next()).await.unwrap();
    match close {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason.as_str(), "unknown session");
        }
        other => panic!("expected policy close, got {other:?}"),
    }

    // The allowed session still works end to end.
    let mut peer = Peer::join(&url, "anon1").await;
    peer.store.create("allowed").unwrap();
    peer.push().await;
    wait_for_host(&relay, &["allowed"]).await;
    assert_eq!(relay.stats().rejected_sessions, 1);
}

#[tokio::test]
async fn test_oversize_frame_closes_only_that_connection() {
    let (relay, url) = start_relay(None).await;
    let limit = relay.config().max_frame_bytes;

    let mut good = Peer::join(&url, "good").await;

    let (mut bad, _) = tokio_tungstenite::connect_async(format!("{url}/?session=bad"))
        .await
        .unwrap();
    let hello = SyncMessage::hello(&PeerInfo::new("bad"))
        .unwrap()
        .encode()
        .unwrap();
    bad.send(Message::Binary(hello.into())).await.unwrap();
    bad.send(Message::Binary(vec![0u8; limit + 1].into()))
        .await
        .unwrap();

    let deadline = Instant::now() + WAIT;
    let code = loop {
        match timeout(deadline - Instant::now(), bad.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame.map(|f| f.code),
            Some(Ok(_)) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    };
    assert_eq!(code, Some(CloseCode::Size));
    assert_eq!(relay.stats().oversize_frames, 1);

    good.store.create("still here").unwrap();
    good.push().await;
    wait_for_host(&relay, &["still here"]).await;
    assert_eq!(
        good.client.connection_state().await,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_raw_handshake_over_relay() {
    let (_relay, url) = start_relay(None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/?session=raw"))
        .await
        .unwrap();

    let info = PeerInfo::new("raw");
    let sv = Replica::new().state_vector();
    for msg in [SyncMessage::hello(&info).unwrap(), SyncMessage::sync_step1(info.peer_id, sv)] {
        ws.send(Message::Binary(msg.encode().unwrap().into()))
            .await
            .unwrap();
    }

    let mut types = Vec::new();
    while types.len() < 2 {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => {
                types.push(SyncMessage::decode(&data).unwrap().msg_type);
            }
            Some(Ok(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(types, vec![MessageType::SyncStep2, MessageType::SyncStep1]);
}

#[tokio::test]
async fn test_reconnect_keeps_new_connection_alive() {
    let (relay, url) = start_relay(None).await;
    let mut alice = Peer::join(&url, "alice").await;
    wait_for_peers(&relay, 1).await;

    alice
        .client
        .connect(alice.store.replica().state_vector())
        .await
        .unwrap();

    // The first socket winds down in the background; it must not report.
    let deadline = Instant::now() + WAIT;
    while relay.stats().closed_connections < 1 {
        assert!(Instant::now() < deadline, "first connection never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        alice.client.connection_state().await,
        ConnectionState::Connected
    );
    while let Ok(event) = alice.events.try_recv() {
        assert_ne!(event, SyncEvent::Disconnected);
    }

    alice.store.create("after reconnect").unwrap();
    alice.push().await;
    assert_eq!(alice.client.offline_queue_len().await, 0);
    wait_for_host(&relay, &["after reconnect"]).await;
    assert_eq!(relay.connection_count().await, 1);
}

#[tokio::test]
async fn test_heartbeat_outlives_idle_timeout() {
    let config = RelayConfig {
        read_idle_timeout: Duration::from_millis(300),
        ..RelayConfig::for_testing()
    };
    let (relay, url) = start_relay_with(config, None).await;

    let beating = ClientConfig {
        heartbeat_interval: Some(Duration::from_millis(100)),
        ..ClientConfig::for_testing(&url)
    };
    let mut alive = SyncClient::new(PeerInfo::new("alive"), beating);
    alive.connect(Replica::new().state_vector()).await.unwrap();

    let silent = ClientConfig {
        heartbeat_interval: None,
        ..ClientConfig::for_testing(&url)
    };
    let mut quiet = SyncClient::new(PeerInfo::new("quiet"), silent);
    quiet.connect(Replica::new().state_vector()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(alive.connection_state().await, ConnectionState::Connected);
    assert_eq!(quiet.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(relay.stats().timeouts, 1);
    assert_eq!(relay.connection_count().await, 1);
}
