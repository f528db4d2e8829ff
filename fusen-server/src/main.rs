//! Standalone board server binary.
//!
//! Configuration via environment:
//! - `FUSEN_BIND` — listen address (default `127.0.0.1:9090`)
//! - `FUSEN_DATA` — RocksDB path; unset runs memory-only
//! - `FUSEN_REQUIRE_STORAGE` — `1`/`true` refuses to start when the
//!   storage path cannot be opened
//! - `FUSEN_CHANNEL` — fanout channel name (default `earth`)

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use fusen_collab::{BoardServer, LocalBus, ServerConfig, DEFAULT_CHANNEL};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = env::var("FUSEN_BIND").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let channel = env::var("FUSEN_CHANNEL").unwrap_or_else(|_| DEFAULT_CHANNEL.to_string());
    let storage_path = env::var("FUSEN_DATA").ok().map(PathBuf::from);
    let require_storage = env::var("FUSEN_REQUIRE_STORAGE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let config = ServerConfig {
        bind_addr,
        channel,
        storage_path,
        require_storage,
    };

    info!("Starting fusen board server on {}", config.bind_addr);
    match config.storage_path {
        Some(ref path) => info!("Persisting notes to {}", path.display()),
        None => info!("Running memory-only; notes are lost on restart"),
    }

    let server = BoardServer::new(config, Arc::new(LocalBus::default()))?;
    server.run().await
}
