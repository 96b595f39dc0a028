//! `todo-sync`: relay server and terminal client for the shared to-do list.
//!
//! ```text
//! todo-sync serve  [--port 3000] [--storage .swarm]
//! todo-sync client [--server ws://localhost:3000]
//! ```
//!
//! Logging goes through `env_logger`; set `RUST_LOG=info` (or `debug`).

mod client;
mod config;

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use todo_collab::{RelayServer, ReplicationHost, TokenAllowList};

use crate::config::{Cli, Commands, ServerConfig};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(ServerConfig::from(&args)))
        }
        Commands::Client(args) => {
            // The store is single-threaded; keep everything on this thread.
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(client::run(args))
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let host = Arc::new(ReplicationHost::new(config.host.clone())?);
    match &config.host.storage {
        Some(storage) => log::info!(
            "document stored in {} ({} updates recovered)",
            storage.path.display(),
            host.stats().recovered_updates
        ),
        None => log::warn!("running in memory, the list is lost on exit"),
    }

    let mut relay = RelayServer::new(config.relay.clone(), host.clone());
    if config.session_tokens.is_empty() {
        log::warn!("session validation is not enforced, every connection is accepted");
    } else {
        log::info!("accepting {} session tokens", config.session_tokens.len());
        relay = relay.with_validator(Arc::new(TokenAllowList::new(config.session_tokens)));
    }
    let relay = Arc::new(relay);

    tokio::select! {
        result = relay.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
        }
    }

    if let Some(meta) = host.snapshot().await? {
        log::info!(
            "final snapshot: {} bytes ({} compressed) at version {}",
            meta.snapshot_size,
            meta.compressed_size,
            meta.snapshot_version
        );
    }
    let stats = relay.stats();
    log::info!(
        "served {} connections ({} rejected), {} frames in, {} frames out",
        stats.total_connections,
        stats.rejected_sessions,
        stats.frames_in,
        stats.frames_out
    );
    let fanout = host.broadcast_group().stats().await;
    log::info!(
        "fanned out {} frames, {} skipped by lagging peers",
        fanout.messages_sent,
        fanout.messages_dropped
    );
    Ok(())
}
