//! # todo-collab: replication host and relay for the to-do list
//!
//! Server half of the demo plus the client-side connection to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐  PeerStream  ┌─────────────────┐
//! │ SyncClient  │ ◄────────────────► │ RelayServer │ ◄──────────► │ ReplicationHost │
//! │ (per user)  │   ?session=<id>    │ (transport) │              │ (authority)     │
//! └──────┬──────┘                    └─────────────┘              └───────┬─────────┘
//!        │                                                                │
//!        ▼                                                        ┌───────┴────────┐
//! ┌─────────────┐                                                 │ BroadcastGroup │
//! │ TodoStore   │                                                 │ DocumentStore  │
//! │ (replica)   │                                                 └────────────────┘
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary sync protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: fan-out to connected peers
//! - [`stream`]: bounded duplex between relay and host
//! - [`host`]: authoritative replica, handshake, persistence
//! - [`relay`]: WebSocket server with per-connection limits
//! - [`session`]: session validation hook
//! - [`storage`]: RocksDB snapshots and deltas
//! - [`client`]: sync client with offline queue
//! - [`identity`]: local storage and the persistent user id

pub mod protocol;
pub mod broadcast;
pub mod stream;
pub mod host;
pub mod relay;
pub mod session;
pub mod storage;
pub mod client;
pub mod identity;

pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, HOST_PEER_ID};
pub use broadcast::{BroadcastGroup, BroadcastStats, Relayed, RelayedFrame};
pub use stream::{duplex, PeerStream, TransportEnd};
pub use host::{HostConfig, HostError, HostStats, ReplicationHost};
pub use relay::{ConnectionPhase, RelayConfig, RelayError, RelayServer, RelayStats};
pub use session::{AcceptAllSessions, SessionRequest, SessionValidator, TokenAllowList};
pub use storage::{
    CompressedDelta, DocumentMetadata, DocumentStore, StorageConfig, StorageError,
    DEFAULT_STORAGE_DIR,
};
pub use client::{ClientConfig, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use identity::{generate_id, user_id, IdentityError, LocalStorage, USER_KEY};
