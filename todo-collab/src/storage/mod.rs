//! Persistent storage for the host's authoritative document.
//!
//! ```text
//! ReplicationHost
//!     │
//!     ▼
//! DocumentStore (RocksDB)
//!     ├── snapshots  (LZ4 compressed full state)
//!     ├── deltas     (LZ4 compressed updates, keyed by version)
//!     └── metadata   (bincode)
//! ```

pub mod delta;
pub mod rocks;

pub use delta::CompressedDelta;
pub use rocks::{DocumentMetadata, DocumentStore, StorageConfig, StorageError, DEFAULT_STORAGE_DIR};
