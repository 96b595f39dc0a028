//! Replication host: the server's authoritative replica.
//!
//! ```text
//! PeerStream A ──┐                         ┌──► PeerStream A
//!                ├── accept ── Replica ────┤
//! PeerStream B ──┘     │    (Mutex)        └──► PeerStream B
//!                      │        │
//!                      │        └── BroadcastGroup
//!                      ▼
//!               DocumentStore (optional)
//! ```
//!
//! Every update is applied under the replica lock, persisted, and then
//! broadcast while still holding the lock, so all peers observe updates in
//! the order the host applied them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use todo_core::{Replica, ReplicaError};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RelayedFrame};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, HOST_PEER_ID};
use crate::storage::{DocumentMetadata, DocumentStore, StorageConfig, StorageError};
use crate::stream::PeerStream;

/// Fan-out and persistence settings for a [`ReplicationHost`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Frames buffered per peer before it counts as lagging
    pub broadcast_capacity: usize,
    /// Write a snapshot every N persisted deltas (0 = only on last leave)
    pub snapshot_every: u64,
    /// Persistence (None = in-memory only)
    pub storage: Option<StorageConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            snapshot_every: 100,
            storage: None,
        }
    }
}

impl HostConfig {
    pub fn with_storage(storage: StorageConfig) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    /// In-memory, small buffers.
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 32,
            snapshot_every: 10,
            storage: None,
        }
    }
}

/// Point-in-time copy of the host counters, taken by
/// [`ReplicationHost::stats`].
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub total_peers: u64,
    pub active_peers: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub resyncs: u64,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    /// Snapshot + deltas replayed at startup
    pub recovered_updates: u64,
}

#[derive(Default)]
struct AtomicHostStats {
    total_peers: AtomicU64,
    active_peers: AtomicU64,
    updates_applied: AtomicU64,
    updates_rejected: AtomicU64,
    resyncs: AtomicU64,
    persisted_deltas: AtomicU64,
    persisted_snapshots: AtomicU64,
    recovered_updates: AtomicU64,
}

/// Why a peer session or a storage operation failed. A session error
/// ends that peer's session only.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What woke up a peer's loop.
enum PeerEvent {
    Frame(Option<Vec<u8>>),
    Relayed(Result<RelayedFrame, RecvError>),
}

/// The authoritative replica shared by every connected peer.
///
/// Each peer session runs [`accept`](Self::accept) on its own task. Updates
/// are applied, persisted and fanned out under one lock, so all peers see
/// them in the same order. With storage configured, the document survives
/// restarts: `new` replays the latest snapshot and the deltas after it.
pub struct ReplicationHost {
    replica: Mutex<Replica>,
    broadcast: BroadcastGroup,
    store: Option<Arc<DocumentStore>>,
    /// Version the next persisted delta gets
    delta_version: AtomicU64,
    stats: AtomicHostStats,
    config: HostConfig,
}

impl ReplicationHost {
    /// Create the host, opening storage and replaying persisted state.
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        let replica = Replica::new();
        let stats = AtomicHostStats::default();
        let mut next_version = 1;

        let store = match &config.storage {
            Some(storage) => {
                let store = DocumentStore::open(storage.clone())?;
                let recovered = Self::recover(&replica, &store)?;
                stats.recovered_updates.store(recovered, Ordering::Relaxed);
                next_version = store.last_version()? + 1;
                Some(Arc::new(store))
            }
            None => None,
        };

        Ok(Self {
            replica: Mutex::new(replica),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            store,
            delta_version: AtomicU64::new(next_version),
            stats,
            config,
        })
    }

    /// Replay the latest snapshot and every delta written after it.
    fn recover(replica: &Replica, store: &DocumentStore) -> Result<u64, HostError> {
        let mut applied = 0;
        let mut since = 1;

        if let Some((version, state)) = store.load_snapshot()? {
            replica.apply_remote_update(&state)?;
            applied += 1;
            since = version + 1;
        }

        for (version, delta) in store.load_deltas_since(since)? {
            match replica.apply_remote_update(&delta) {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("skipping unreadable delta {version}: {e}"),
            }
        }

        if applied > 0 {
            log::info!(
                "recovered {applied} updates from {} ({} objects)",
                store.path().display(),
                replica.object_count()
            );
        }
        Ok(applied)
    }

    /// Serve one peer until its stream closes.
    ///
    /// The first frame must be a `Hello`; anything else fails the handshake.
    pub async fn accept(&self, mut stream: PeerStream) -> Result<(), HostError> {
        let Some(first) = stream.recv().await else {
            return Ok(());
        };
        let info = SyncMessage::decode(&first)
            .and_then(|hello| hello.peer_info())
            .map_err(|e| HostError::Handshake(e.to_string()))?;

        let joined = SyncMessage::hello(&info)?;

        let mut rx = self.broadcast.add_peer(info.clone()).await;
        self.stats.total_peers.fetch_add(1, Ordering::Relaxed);
        self.stats.active_peers.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.broadcast.broadcast(info.peer_id, &joined) {
            log::warn!("failed to announce {}: {e}", info.peer_id);
        }
        log::info!("peer {} ({}) joined from {}", info.name, info.peer_id, stream.remote());

        let result = self.serve(&mut stream, info.peer_id, &mut rx).await;
        self.leave(&info).await;
        result
    }

    async fn serve(
        &self,
        stream: &mut PeerStream,
        peer_id: Uuid,
        rx: &mut broadcast::Receiver<RelayedFrame>,
    ) -> Result<(), HostError> {
        loop {
            let event = tokio::select! {
                frame = stream.recv() => PeerEvent::Frame(frame),
                relayed = rx.recv() => PeerEvent::Relayed(relayed),
            };

            match event {
                PeerEvent::Frame(None) => return Ok(()),
                PeerEvent::Frame(Some(frame)) => match SyncMessage::decode(&frame) {
                    Ok(msg) => self.handle(stream, peer_id, msg).await?,
                    Err(e) => log::warn!("dropping malformed frame from {peer_id}: {e}"),
                },
                PeerEvent::Relayed(Ok(relayed)) => {
                    if relayed.from != peer_id {
                        stream.send(relayed.frame.clone()).await?;
                    }
                }
                PeerEvent::Relayed(Err(RecvError::Lagged(skipped))) => {
                    log::warn!("peer {peer_id} lagged by {skipped} frames, resending full state");
                    self.broadcast.record_dropped(skipped);
                    self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
                    let state = self.replica.lock().await.encode_state();
                    stream
                        .send(SyncMessage::sync_step2(HOST_PEER_ID, state).encode()?)
                        .await?;
                }
                PeerEvent::Relayed(Err(RecvError::Closed)) => return Ok(()),
            }
        }
    }

    async fn handle(
        &self,
        stream: &PeerStream,
        peer_id: Uuid,
        msg: SyncMessage,
    ) -> Result<(), HostError> {
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let reply = {
                    let replica = self.replica.lock().await;
                    match replica.encode_diff(&msg.payload) {
                        Ok(diff) => Some((diff, replica.state_vector())),
                        Err(e) => {
                            log::warn!("bad state vector from {peer_id}: {e}");
                            None
                        }
                    }
                };
                if let Some((diff, sv)) = reply {
                    stream.send(SyncMessage::sync_step2(HOST_PEER_ID, diff).encode()?).await?;
                    stream.send(SyncMessage::sync_step1(HOST_PEER_ID, sv).encode()?).await?;
                }
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let replica = self.replica.lock().await;
                if let Err(e) = replica.apply_remote_update(&msg.payload) {
                    log::warn!("rejected update from {peer_id}: {e}");
                    self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);

                if let Some(delta) = self.next_delta(&replica) {
                    if let Err(e) = self.persist(delta, msg.payload.clone()).await {
                        log::error!("failed to persist update from {peer_id}: {e}");
                    }
                }
                let update = SyncMessage::update(peer_id, msg.clock, msg.payload);
                let receivers = self.broadcast.broadcast(peer_id, &update)?;
                log::trace!("update from {peer_id} fanned out to {receivers} receivers");
            }
            MessageType::Ping => {
                stream.send(SyncMessage::pong(HOST_PEER_ID).encode()?).await?;
            }
            MessageType::Hello | MessageType::PeerLeft | MessageType::Pong => {
                log::trace!("ignoring {:?} from {peer_id}", msg.msg_type);
            }
        }
        Ok(())
    }

    /// Claim the next delta version, with the full state when this version
    /// is due a snapshot. `None` without storage.
    fn next_delta(&self, replica: &Replica) -> Option<PendingDelta> {
        let store = self.store.clone()?;
        let version = self.delta_version.fetch_add(1, Ordering::SeqCst);
        let every = self.config.snapshot_every;
        let state = (every > 0 && version % every == 0).then(|| replica.encode_state());
        Some(PendingDelta {
            store,
            version,
            state,
        })
    }

    /// Write one applied update on the blocking pool. Caller holds the
    /// replica lock, so writes land in apply order.
    async fn persist(&self, delta: PendingDelta, update: Vec<u8>) -> Result<(), HostError> {
        let PendingDelta {
            store,
            version,
            state,
        } = delta;
        let snapshot = tokio::task::spawn_blocking(move || {
            store.store_delta(version, &update)?;
            state
                .map(|state| write_snapshot(&store, version, &state))
                .transpose()
        })
        .await??;

        self.stats.persisted_deltas.fetch_add(1, Ordering::Relaxed);
        if let Some((meta, compacted)) = snapshot {
            self.record_snapshot(&meta, compacted);
        }
        Ok(())
    }

    fn record_snapshot(&self, meta: &DocumentMetadata, compacted: u64) {
        self.stats.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "snapshot at version {}: {} bytes ({} compressed), {compacted} deltas compacted",
            meta.snapshot_version,
            meta.snapshot_size,
            meta.compressed_size
        );
    }

    /// Snapshot the document now. `None` without storage.
    pub async fn snapshot(&self) -> Result<Option<DocumentMetadata>, HostError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        // Held until the write lands so a concurrent delta cannot slip under it.
        let replica = self.replica.lock().await;
        let covers = self.delta_version.load(Ordering::SeqCst).saturating_sub(1);
        let state = replica.encode_state();

        let store = store.clone();
        let (meta, compacted) =
            tokio::task::spawn_blocking(move || write_snapshot(&store, covers, &state)).await??;
        drop(replica);

        self.record_snapshot(&meta, compacted);
        Ok(Some(meta))
    }

    async fn leave(&self, info: &PeerInfo) {
        self.broadcast.remove_peer(&info.peer_id).await;
        self.stats.active_peers.fetch_sub(1, Ordering::Relaxed);
        if let Err(e) = self
            .broadcast
            .broadcast(info.peer_id, &SyncMessage::peer_left(info.peer_id))
        {
            log::warn!("failed to announce departure of {}: {e}", info.peer_id);
        }
        log::info!("peer {} ({}) left", info.name, info.peer_id);

        if self.broadcast.peer_count().await == 0 {
            if let Err(e) = self.snapshot().await {
                log::error!("failed to snapshot after last peer left: {e}");
            }
        }
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.replica.lock().await.state_vector()
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.replica.lock().await.encode_state()
    }

    /// Objects in the authoritative document.
    pub async fn object_count(&self) -> u32 {
        self.replica.lock().await.object_count()
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub fn broadcast_group(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn stats(&self) -> HostStats {
        let s = &self.stats;
        HostStats {
            total_peers: s.total_peers.load(Ordering::Relaxed),
            active_peers: s.active_peers.load(Ordering::Relaxed),
            updates_applied: s.updates_applied.load(Ordering::Relaxed),
            updates_rejected: s.updates_rejected.load(Ordering::Relaxed),
            resyncs: s.resyncs.load(Ordering::Relaxed),
            persisted_deltas: s.persisted_deltas.load(Ordering::Relaxed),
            persisted_snapshots: s.persisted_snapshots.load(Ordering::Relaxed),
            recovered_updates: s.recovered_updates.load(Ordering::Relaxed),
        }
    }
}

struct PendingDelta {
    store: Arc<DocumentStore>,
    version: u64,
    state: Option<Vec<u8>>,
}

/// Save `state` as the snapshot covering `covers` and drop the deltas it
/// replaces. Blocking; runs on the blocking pool.
fn write_snapshot(
    store: &DocumentStore,
    covers: u64,
    state: &[u8],
) -> Result<(DocumentMetadata, u64), StorageError> {
    let meta = store.save_snapshot(covers, state)?;
    let compacted = store.compact_deltas(covers)?;
    Ok((meta, compacted))
}
