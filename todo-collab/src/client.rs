//! WebSocket sync client: a replica's connection to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - The sync handshake and update send/receive
//! - Offline queue for updates produced while disconnected
//! - Heartbeat pings so an idle connection outlives the relay's read timeout
//!
//! The client never touches a document itself. The application feeds it
//! local updates and applies the [`SyncEvent`]s it emits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL; the session query is appended
    pub server_url: String,
    /// Updates kept while offline before new ones are refused
    pub offline_queue_size: usize,
    /// Capacity of the outgoing and event channels
    pub channel_capacity: usize,
    /// Ping period while connected (None = never). Keep it below the
    /// relay's read idle timeout.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000".to_string(),
            offline_queue_size: 10_000,
            channel_capacity: 256,
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            offline_queue_size: 100,
            channel_capacity: 64,
            heartbeat_interval: Some(Duration::from_secs(1)),
        }
    }
}

/// Socket state as seen by [`SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the reader task reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Update produced by another peer
    RemoteUpdate {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// Host's diff for our state vector (or a full resync)
    Synced(Vec<u8>),
    /// Host's state vector; answer with `send_sync_step2(diff)`
    DiffRequested(Vec<u8>),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// Updates produced while disconnected, replayed on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, payload)| payload.len()).sum()
    }
}

/// One peer's connection to the relay.
///
/// Local updates go out through [`send_update`](Self::send_update), or into
/// the offline queue while disconnected. Everything received arrives as a
/// [`SyncEvent`] on the receiver from [`take_event_rx`](Self::take_event_rx).
pub struct SyncClient {
    peer_info: PeerInfo,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    /// Bumped on every connect; a reader only reports for its own connection
    generation: Arc<AtomicU64>,
    reader: Option<JoinHandle<()>>,
    clock: AtomicU64,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Feeds the socket writer task while connected
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            peer_info,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            reader: None,
            clock: AtomicU64::new(0),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(config.offline_queue_size))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            config,
        }
    }

    /// Take the event receiver (only once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// URL including the session query, e.g. `ws://localhost:3000/?session=anon3f`.
    pub fn session_url(&self) -> String {
        format!(
            "{}/?session={}",
            self.config.server_url.trim_end_matches('/'),
            self.peer_info.name
        )
    }

    /// Connect, start the handshake with `state_vector`, and replay the
    /// offline queue. Any previous connection is dropped first.
    pub async fn connect(&mut self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.outgoing_tx = None;
        let generation = {
            let mut state = self.state.write().await;
            *state = ConnectionState::Connecting;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let url = self.session_url();
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let peer_id = self.peer_info.peer_id;
        let ping = SyncMessage::ping(peer_id).encode()?;
        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity.max(1));
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    _ = next_beat(&mut heartbeat) => ping.clone(),
                };
                if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        out_tx
            .send(SyncMessage::hello(&self.peer_info)?.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        out_tx
            .send(SyncMessage::sync_step1(peer_id, state_vector).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let queued = {
            let mut queue = self.offline_queue.lock().await;
            if !queue.is_empty() {
                log::info!(
                    "replaying {} queued updates ({} bytes)",
                    queue.len(),
                    queue.total_bytes()
                );
            }
            queue.drain()
        };
        for (clock, payload) in queued {
            out_tx
                .send(SyncMessage::update(peer_id, clock, payload).encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("connected to {url} as {} ({peer_id})", self.peer_info.name);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current = self.generation.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) if sync_msg.peer_id != peer_id => {
                                if let Some(event) = to_event(sync_msg) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("dropping malformed frame: {e}"),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            log::info!(
                                "server closed connection: {} ({})",
                                frame.reason.as_str(),
                                u16::from(frame.code)
                            );
                        }
                        break;
                    }
                    Err(e) => {
                        log::debug!("read error: {e}");
                        break;
                    }
                    Ok(_) => {}
                }
            }

            {
                let mut state = state.write().await;
                if current.load(Ordering::SeqCst) != generation {
                    log::debug!("connection {generation} ended after a reconnect");
                    return;
                }
                *state = ConnectionState::Disconnected;
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Send a local update, or queue it while disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;

        if *self.state.read().await == ConnectionState::Connected {
            if let Some(tx) = &self.outgoing_tx {
                let frame = SyncMessage::update(self.peer_info.peer_id, clock, update.clone()).encode()?;
                if tx.send(frame).await.is_ok() {
                    return Ok(());
                }
            }
        }

        if self.offline_queue.lock().await.enqueue(clock, update) {
            Ok(())
        } else {
            log::warn!("offline queue full, dropping update {clock}");
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Answer the host's `SyncStep1` with our diff.
    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step2(self.peer_info.peer_id, diff)).await
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the socket. A `Disconnected` event follows once the reader ends.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    /// Updates sent or queued so far.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

/// Next heartbeat tick; never resolves when heartbeats are off.
async fn next_beat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
    match msg.msg_type {
        MessageType::Update => Some(SyncEvent::RemoteUpdate {
            peer_id: msg.peer_id,
            clock: msg.clock,
            update: msg.payload,
        }),
        MessageType::SyncStep2 => Some(SyncEvent::Synced(msg.payload)),
        MessageType::SyncStep1 => Some(SyncEvent::DiffRequested(msg.payload)),
        MessageType::Hello => msg.peer_info().ok().map(SyncEvent::PeerJoined),
        MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
        MessageType::Ping | MessageType::Pong => None,
    }
}
