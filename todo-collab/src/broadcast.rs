//! Fan-out of host frames to every connected peer.
//!
//! One tokio broadcast channel feeds every peer's connection task. Each
//! receiver buffers up to `capacity` frames; a receiver that falls further
//! behind observes `Lagged` and is resynchronised by the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// A pre-encoded frame plus the peer it came from, so the sender can skip
/// its own frames without decoding them.
#[derive(Debug)]
pub struct Relayed {
    pub from: Uuid,
    pub frame: Vec<u8>,
}

pub type RelayedFrame = Arc<Relayed>;

/// Fan-out counters. `messages_dropped` counts frames lagging receivers
/// skipped before their resync.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Registry of connected peers plus the channel that fans host frames out
/// to them.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RelayedFrame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<RelayedFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode `msg` once and send it to every receiver. Filtering out the
    /// originating peer is the receiver's job.
    pub fn broadcast(&self, from: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = msg.encode()?;
        let count = self.sender.send(Arc::new(Relayed { from, frame })).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }
}
