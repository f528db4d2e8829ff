//! WebSocket board server with authoritative note state.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session tasks ── NoteStore (authoritative, LWW)
//! Client B ──┘        │                │
//!                     │                └── KvBackend (RocksDB mirror)
//!                     ▼
//!              ConnectionRegistry          FanoutBus ◄──► other replicas
//!                     │                        ▲
//!          ┌──────────┼──────────┐             │
//!          ▼          ▼          ▼      FanoutPublisher
//!       Client A   Client B   Client C
//! ```
//!
//! Each connection runs its own session task:
//! - On open, the current board replays to that session as one canonical
//!   `update` frame per note
//! - Inbound mutations apply to the store, then rebroadcast canonically to
//!   every session, the originator included
//! - Malformed frames are dropped with a debug log; the connection stays up
//! - Remote replica deltas arrive over the bus and are deduplicated by
//!   origin and sequence before applying
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use uuid::Uuid;

use crate::fanout::{
    FanoutBus, FanoutEvent, FanoutPublisher, LocalBus, NoteChange, OriginTracker, DEFAULT_CHANNEL,
};
use crate::protocol::{BoardMessage, ProtocolError};
use crate::registry::ConnectionRegistry;
use crate::storage::{KvError, RocksKv, StoreConfig};
use crate::store::NoteStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fanout channel shared by replicas of this board
    pub channel: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Refuse to start when the storage path cannot be opened
    pub require_storage: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            storage_path: None,
            require_storage: false,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Frames parsed and applied to the store
    pub total_messages: u64,
    /// Frames dropped as malformed or non-text
    pub frames_dropped: u64,
    /// Remote deltas applied from the fanout bus
    pub fanout_applied: u64,
    /// Remote deltas dropped as replays
    pub fanout_duplicates: u64,
}

/// The board sync server.
pub struct BoardServer {
    config: ServerConfig,
    /// Authoritative note state, optionally mirrored to storage
    store: Arc<NoteStore>,
    /// Live sessions for frame fan-out
    registry: Arc<ConnectionRegistry>,
    /// Stamps and publishes this replica's deltas
    publisher: Arc<FanoutPublisher>,
    /// Backplane the fanout listener subscribes on
    bus: Arc<dyn FanoutBus>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// This replica's identity on the bus
    instance_id: Uuid,
    /// Running fanout listener, aborted on drop
    fanout_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BoardServer {
    /// Create a new board server on the given bus.
    ///
    /// When a storage path is configured but cannot be opened, the server
    /// either refuses to start (`require_storage`) or logs a warning and
    /// runs memory-only.
    pub fn new(config: ServerConfig, bus: Arc<dyn FanoutBus>) -> Result<Self, KvError> {
        let instance_id = Uuid::new_v4();

        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                match RocksKv::open(store_config) {
                    Ok(kv) => NoteStore::with_backend(Arc::new(kv)),
                    Err(e) if config.require_storage => return Err(e),
                    Err(e) => {
                        log::warn!(
                            "Storage unavailable at {}: {}; continuing memory-only",
                            path.display(),
                            e
                        );
                        NoteStore::new()
                    }
                }
            }
            None => NoteStore::new(),
        };

        let publisher = Arc::new(FanoutPublisher::new(
            bus.clone(),
            config.channel.clone(),
            instance_id,
        ));

        Ok(Self {
            config,
            store: Arc::new(store),
            registry: Arc::new(ConnectionRegistry::new()),
            publisher,
            bus,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            instance_id,
            fanout_task: std::sync::Mutex::new(None),
        })
    }

    /// Create with default configuration (in-memory, local bus only).
    pub fn with_defaults() -> Result<Self, KvError> {
        Self::new(ServerConfig::default(), Arc::new(LocalBus::default()))
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, KvError> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config, Arc::new(LocalBus::default()))
    }

    /// Load persisted notes from storage on startup.
    ///
    /// Restores the board so it is immediately served to reconnecting
    /// clients. Returns how many notes were restored.
    pub async fn recover(&self) -> Result<usize, KvError> {
        let recovered = self.store.load_from_backend().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} notes from storage");
        }
        Ok(recovered)
    }

    /// Start serving WebSocket connections.
    ///
    /// Recovers persisted state, subscribes to the fanout channel, then
    /// runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.recover().await?;
        self.spawn_fanout_listener();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let store = self.store.clone();
            let registry = self.registry.clone();
            let publisher = self.publisher.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, store, registry, publisher, stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Subscribe to the fanout channel and apply remote deltas.
    ///
    /// Own echoes are skipped by origin id; replays are dropped by the
    /// per-origin sequence tracker. Applied upserts rebroadcast to local
    /// sessions as `update` frames, tombstones as `delete` frames.
    fn spawn_fanout_listener(&self) {
        let mut fanout_rx = self.bus.subscribe(&self.config.channel);
        let own_origin = self.instance_id;
        let store = self.store.clone();
        let registry = self.registry.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            let mut tracker = OriginTracker::new();
            loop {
                let payload = match fanout_rx.recv().await {
                    Ok(p) => p,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Fanout listener lagged by {n} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let event = match FanoutEvent::decode(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        log::warn!("Ignoring undecodable fanout payload: {e}");
                        continue;
                    }
                };

                if event.origin == own_origin {
                    continue;
                }
                if !tracker.observe(event.origin, event.seq) {
                    let mut s = stats.write().await;
                    s.fanout_duplicates += 1;
                    continue;
                }

                match event.change {
                    NoteChange::Upsert(note) => {
                        let frame = BoardMessage::update(&note).encode();
                        store.apply_upsert(note).await;
                        match frame {
                            Ok(f) => {
                                registry.broadcast(Utf8Bytes::from(f)).await;
                            }
                            Err(e) => log::warn!("Skipping rebroadcast of remote upsert: {e}"),
                        }
                    }
                    NoteChange::Tombstone { id } => {
                        let frame = BoardMessage::delete(id.clone()).encode();
                        store.apply_tombstone(&id).await;
                        match frame {
                            Ok(f) => {
                                registry.broadcast(Utf8Bytes::from(f)).await;
                            }
                            Err(e) => log::warn!("Skipping rebroadcast of remote delete: {e}"),
                        }
                    }
                }

                let mut s = stats.write().await;
                s.fanout_applied += 1;
            }
        });

        let mut task = self.fanout_task.lock().unwrap_or_else(PoisonError::into_inner);
        *task = Some(handle);
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<NoteStore>,
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<FanoutPublisher>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        let session_id = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Utf8Bytes>();

        // Register before snapshotting so no mutation frame can slip
        // between the two.
        registry.register(session_id, out_tx.clone()).await;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Board snapshot replays to this session only, one canonical
        // update frame per note.
        for note in store.snapshot().await {
            match BoardMessage::update(&note).encode() {
                Ok(frame) => {
                    if out_tx.send(Utf8Bytes::from(frame)).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Skipping snapshot frame for '{}': {e}", note.id),
            }
        }

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => {
                            match BoardMessage::parse(raw.as_str()) {
                                Ok(board_msg) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.total_messages += 1;
                                    }
                                    if let Err(e) =
                                        Self::apply_message(board_msg, &store, &registry, &publisher).await
                                    {
                                        log::warn!("Failed to apply frame from {addr}: {e}");
                                    }
                                }
                                Err(e) => {
                                    // Lenient protocol: bad frames are dropped,
                                    // the connection stays open.
                                    let mut s = stats.write().await;
                                    s.frames_dropped += 1;
                                    log::debug!("Dropping malformed frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            let mut s = stats.write().await;
                            s.frames_dropped += 1;
                            log::debug!("Dropping binary frame from {addr}; protocol is text");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::error!("Pong failed for {addr}: {e}");
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing frame queued by a broadcast or the snapshot
                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                                log::error!("Send failed for {addr}: {e}");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup always runs: a session that died mid-send must still
        // leave the registry.
        registry.unregister(&session_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::debug!("Session {session_id} from {addr} unregistered");

        Ok(())
    }

    /// Apply one parsed mutation: store first, then canonical rebroadcast
    /// and fanout publish.
    async fn apply_message(
        msg: BoardMessage,
        store: &NoteStore,
        registry: &ConnectionRegistry,
        publisher: &FanoutPublisher,
    ) -> Result<(), ProtocolError> {
        match msg {
            BoardMessage::Insert { id, patch } => {
                let note = store.insert(&id, &patch).await;
                let frame = BoardMessage::insert(&note).encode()?;
                registry.broadcast(Utf8Bytes::from(frame)).await;
                publisher.publish_upsert(&note);
            }

            BoardMessage::Update { id, patch } => {
                match store.update(&id, &patch).await {
                    Some(note) => {
                        let frame = BoardMessage::update(&note).encode()?;
                        registry.broadcast(Utf8Bytes::from(frame)).await;
                        publisher.publish_upsert(&note);
                    }
                    None => {
                        // Unknown target: silently ignored, nothing broadcast.
                        log::debug!("Update for unknown note '{id}' ignored");
                    }
                }
            }

            BoardMessage::Delete { id } => {
                // Deletes broadcast whether or not the note was present;
                // a concurrent remote delete must not swallow the frame.
                if !store.delete(&id).await {
                    log::debug!("Delete for already-absent note '{id}'");
                }
                let frame = BoardMessage::delete(id.clone()).encode()?;
                registry.broadcast(Utf8Bytes::from(frame)).await;
                publisher.publish_tombstone(id);
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The authoritative note store.
    pub fn store(&self) -> &Arc<NoteStore> {
        &self.store
    }

    /// This replica's identity on the fanout bus.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl Drop for BoardServer {
    fn drop(&mut self) {
        // The listener task holds store and registry clones; left running
        // it would pin the storage backend open past the server's life.
        let mut task = self.fanout_task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}
