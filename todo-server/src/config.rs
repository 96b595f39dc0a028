//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use todo_collab::{ClientConfig, HostConfig, RelayConfig, StorageConfig, DEFAULT_STORAGE_DIR};
use todo_core::StoreConfig;

/// Replicated to-do list: relay server and terminal client
#[derive(Parser, Debug)]
#[command(name = "todo-sync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay and replication host
    Serve(ServeArgs),
    /// Interactive client editing the shared list
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Interface to listen on
    #[arg(long, env = "TODO_SYNC_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, env = "TODO_SYNC_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Storage directory for the shared document
    #[arg(long, env = "TODO_SYNC_STORAGE", default_value = DEFAULT_STORAGE_DIR)]
    pub storage: PathBuf,

    /// Keep the document in memory only
    #[arg(long)]
    pub in_memory: bool,

    /// Accept only these session tokens (comma separated); default accepts all
    #[arg(long, env = "TODO_SYNC_SESSIONS", value_delimiter = ',')]
    pub sessions: Vec<String>,

    /// Frames buffered per connection and direction
    #[arg(long, env = "TODO_SYNC_QUEUE", default_value_t = 64)]
    pub queue_capacity: usize,

    /// Seconds allowed for the WebSocket upgrade
    #[arg(long, env = "TODO_SYNC_HANDSHAKE_SECS", default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Seconds a connection may stay silent
    #[arg(long, env = "TODO_SYNC_IDLE_SECS", default_value_t = 120)]
    pub idle_timeout: u64,

    /// Seconds a socket write may stall
    #[arg(long, env = "TODO_SYNC_WRITE_SECS", default_value_t = 10)]
    pub write_timeout: u64,

    /// Largest accepted frame in bytes
    #[arg(long, env = "TODO_SYNC_MAX_FRAME", default_value_t = 1024 * 1024)]
    pub max_frame: usize,

    /// Frames a peer may fall behind before it is resynchronised
    #[arg(long, default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Snapshot after this many persisted updates
    #[arg(long, default_value_t = 100)]
    pub snapshot_every: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Relay URL
    #[arg(long, env = "TODO_SYNC_SERVER", default_value = "ws://localhost:3000")]
    pub server: String,

    /// Local storage file holding the user id
    #[arg(long, env = "TODO_SYNC_LOCAL", default_value = ".todomvc-local.json")]
    pub local_storage: PathBuf,

    /// List to edit
    #[arg(long, default_value = todo_core::ids::DEFAULT_LIST_TOKEN)]
    pub list: String,

    /// Start without connecting
    #[arg(long)]
    pub offline: bool,

    /// Seconds between heartbeat pings (0 disables them)
    #[arg(long, env = "TODO_SYNC_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat: u64,
}

/// Everything `serve` needs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub relay: RelayConfig,
    pub host: HostConfig,
    /// Empty means every session is accepted
    pub session_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            host: HostConfig::with_storage(StorageConfig::default()),
            session_tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory host.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            relay: RelayConfig::for_testing(),
            host: HostConfig::for_testing(),
            session_tokens: Vec::new(),
        }
    }
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        let relay = RelayConfig {
            bind_addr: format!("{}:{}", args.bind, args.port),
            queue_capacity: args.queue_capacity,
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            read_idle_timeout: Duration::from_secs(args.idle_timeout),
            write_timeout: Duration::from_secs(args.write_timeout),
            max_frame_bytes: args.max_frame,
        };
        let host = HostConfig {
            broadcast_capacity: args.broadcast_capacity,
            snapshot_every: args.snapshot_every,
            storage: (!args.in_memory).then(|| StorageConfig::at(&args.storage)),
        };
        Self {
            relay,
            host,
            session_tokens: args.sessions.iter().filter(|s| !s.is_empty()).cloned().collect(),
        }
    }
}

impl ClientArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server.clone(),
            heartbeat_interval: (self.heartbeat > 0).then(|| Duration::from_secs(self.heartbeat)),
            ..ClientConfig::default()
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            list_token: self.list.clone(),
        }
    }
}
