//! WebSocket relay: bridges transport connections to the replication host.
//!
//! ```text
//! TCP ──► WS handshake ──► SessionValidator ──► PeerStream ──► host.accept
//!                                                  ▲  │
//!                                   reader pump ───┘  └──► writer pump
//! ```
//!
//! Per connection: `Connecting → Accepted → Streaming → Closed`. Both pump
//! directions are bounded. A slow handshake, an idle reader, a stalled writer
//! or an oversize frame closes that connection and nothing else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::host::{HostError, ReplicationHost};
use crate::protocol::ProtocolError;
use crate::session::{AcceptAllSessions, SessionRequest, SessionValidator};
use crate::stream::duplex;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Listener address plus the per-connection limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per direction per connection
    pub queue_capacity: usize,
    /// Drop a TCP connection that has not finished the WebSocket upgrade
    pub handshake_timeout: Duration,
    /// Close a connection that sends nothing for this long
    pub read_idle_timeout: Duration,
    /// Close a connection whose socket write stalls this long
    pub write_timeout: Duration,
    /// Largest accepted binary frame
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            queue_capacity: 64,
            handshake_timeout: Duration::from_secs(10),
            read_idle_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, short timeouts, small frames.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            queue_capacity: 16,
            handshake_timeout: Duration::from_secs(2),
            read_idle_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: 64 * 1024,
        }
    }

    /// Socket limits matching `max_frame_bytes`, so tungstenite refuses an
    /// oversize frame before buffering it.
    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_frame_bytes))
            .max_frame_size(Some(self.max_frame_bytes))
    }
}

/// Where a connection is in its lifecycle. Closed connections are
/// forgotten, so [`RelayServer::phase`] reports them as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Accepted,
    Streaming,
    Closed,
}

/// Counters since the relay started. `timeouts` covers handshakes, idle
/// readers and stalled writers.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_sessions: u64,
    pub closed_connections: u64,
    pub oversize_frames: u64,
    pub timeouts: u64,
    pub frames_in: u64,
    pub frames_out: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_sessions: AtomicU64,
    closed_connections: AtomicU64,
    oversize_frames: AtomicU64,
    timeouts: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

/// Failure of one connection (or of the listener, from `serve`).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Why the reader pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    /// Peer closed or the socket failed
    Closed,
    Idle,
    Oversize,
    /// Host side went away first
    HostGone,
}

impl ReadEnd {
    fn close_frame(self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            ReadEnd::Closed => return None,
            ReadEnd::Idle => (CloseCode::Away, "idle timeout"),
            ReadEnd::Oversize => (CloseCode::Size, "frame too large"),
            ReadEnd::HostGone => (CloseCode::Normal, "session ended"),
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// Accepts WebSocket connections and hands each validated one to the host.
pub struct RelayServer {
    config: RelayConfig,
    host: Arc<ReplicationHost>,
    validator: Arc<dyn SessionValidator>,
    connections: RwLock<HashMap<u64, ConnectionPhase>>,
    next_connection: AtomicU64,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, host: Arc<ReplicationHost>) -> Self {
        Self {
            config,
            host,
            validator: Arc::new(AcceptAllSessions),
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SessionValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until it fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            log::debug!("connection {id}: tcp from {addr}");

            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(id, stream, addr).await {
                    log::warn!("connection {id} from {addr}: {e}");
                }
                relay.set_phase(id, ConnectionPhase::Closed).await;
            });
        }
    }

    async fn handle_connection(
        &self,
        id: u64,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        self.set_phase(id, ConnectionPhase::Connecting).await;

        let mut target = String::new();
        let record_target = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            target = req.uri().to_string();
            Ok(resp)
        };
        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            record_target,
            Some(self.config.websocket_config()),
        );
        let mut ws = match timeout(self.config.handshake_timeout, handshake).await {
            Ok(ws) => ws?,
            Err(_) => {
                log::debug!(
                    "connection {id}: no websocket upgrade within {:?}",
                    self.config.handshake_timeout
                );
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ProtocolError::Timeout.into());
            }
        };

        let request = SessionRequest::from_uri(&target, Some(addr));
        if let Err(reason) = self.validator.validate(&request) {
            log::info!("connection {id}: session rejected ({reason})");
            self.stats.rejected_sessions.fetch_add(1, Ordering::Relaxed);
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: reason.into(),
            };
            ws.close(Some(frame)).await?;
            return Ok(());
        }
        self.set_phase(id, ConnectionPhase::Accepted).await;

        let (ws_tx, ws_rx) = ws.split();
        let (peer_stream, transport) = duplex(self.config.queue_capacity, addr.to_string());

        let reader = tokio::spawn(read_pump(
            ws_rx,
            transport.inbound,
            self.config.clone(),
            self.stats.clone(),
        ));
        let writer = tokio::spawn(write_pump(
            ws_tx,
            transport.outbound,
            self.config.write_timeout,
            self.stats.clone(),
        ));
        self.set_phase(id, ConnectionPhase::Streaming).await;

        if let Err(e) = self.host.accept(peer_stream).await {
            log::debug!("connection {id}: host ended session: {e}");
        }

        // The host dropped its stream end, so the writer drains and returns.
        reader.abort();
        let read_end = reader.await.unwrap_or(ReadEnd::HostGone);
        if let Ok(Some(mut sink)) = writer.await {
            if let Some(frame) = read_end.close_frame() {
                let _ = sink.send(Message::Close(Some(frame))).await;
            }
            let _ = sink.close().await;
        }
        Ok(())
    }

    async fn set_phase(&self, id: u64, phase: ConnectionPhase) {
        let mut connections = self.connections.write().await;
        let previous = match phase {
            ConnectionPhase::Closed => connections.remove(&id),
            _ => connections.insert(id, phase),
        };
        drop(connections);

        match (previous, phase) {
            (None, ConnectionPhase::Connecting) => {
                self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
            }
            (Some(_), ConnectionPhase::Closed) => {
                self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                self.stats.closed_connections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        log::trace!("connection {id}: {previous:?} -> {phase:?}");
    }

    pub async fn phase(&self, id: u64) -> Option<ConnectionPhase> {
        self.connections.read().await.get(&id).copied()
    }

    /// Connections not yet closed.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn host(&self) -> &Arc<ReplicationHost> {
        &self.host
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        let s = &self.stats;
        RelayStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            rejected_sessions: s.rejected_sessions.load(Ordering::Relaxed),
            closed_connections: s.closed_connections.load(Ordering::Relaxed),
            oversize_frames: s.oversize_frames.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            frames_in: s.frames_in.load(Ordering::Relaxed),
            frames_out: s.frames_out.load(Ordering::Relaxed),
        }
    }
}

/// Socket → host. Dropping `inbound` on return ends the host's session.
async fn read_pump(
    mut ws_rx: WsSource,
    inbound: mpsc::Sender<Vec<u8>>,
    config: RelayConfig,
    stats: Arc<AtomicRelayStats>,
) -> ReadEnd {
    loop {
        let next = match timeout(config.read_idle_timeout, ws_rx.next()).await {
            Ok(next) => next,
            Err(_) => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return ReadEnd::Idle;
            }
        };

        match next {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > config.max_frame_bytes {
                    let err = ProtocolError::FrameTooLarge {
                        size: data.len(),
                        limit: config.max_frame_bytes,
                    };
                    return oversize(err, &stats);
                }
                stats.frames_in.fetch_add(1, Ordering::Relaxed);
                if inbound.send(data.into()).await.is_err() {
                    return ReadEnd::HostGone;
                }
            }
            Some(Ok(Message::Close(_))) | None => return ReadEnd::Closed,
            // Control frames are answered by tungstenite; text is not part of the protocol.
            Some(Ok(_)) => {}
            Some(Err(tungstenite::Error::Capacity(CapacityError::MessageTooLong {
                size,
                max_size,
            }))) => {
                let err = ProtocolError::FrameTooLarge {
                    size,
                    limit: max_size,
                };
                return oversize(err, &stats);
            }
            Some(Err(e)) => {
                log::debug!("read error: {e}");
                return ReadEnd::Closed;
            }
        }
    }
}

fn oversize(err: ProtocolError, stats: &AtomicRelayStats) -> ReadEnd {
    log::warn!("closing connection: {err}");
    stats.oversize_frames.fetch_add(1, Ordering::Relaxed);
    ReadEnd::Oversize
}

/// Host → socket. Returns the sink once the host side is done, or `None`
/// if the socket failed or stalled.
async fn write_pump(
    mut ws_tx: WsSink,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
    stats: Arc<AtomicRelayStats>,
) -> Option<WsSink> {
    while let Some(frame) = outbound.recv().await {
        match timeout(write_timeout, ws_tx.send(Message::Binary(frame.into()))).await {
            Ok(Ok(())) => {
                stats.frames_out.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                log::debug!("write error: {e}");
                return None;
            }
            Err(_) => {
                log::warn!("closing connection: write stalled for {write_timeout:?}");
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
    }
    Some(ws_tx)
}
