//! WebSocket board client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed insert/update/delete mutations
//! - An event stream of canonical frames from the server
//!
//! On connect the server replays the whole board as `update` frames, so a
//! reconnecting client rebuilds its state from the replay; there is no
//! offline edit queue. The server also echoes a session's own mutations
//! back in canonical form; applying them by id is idempotent.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{BoardMessage, Note, NotePatch, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the board client.
#[derive(Debug, Clone)]
pub enum BoardEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A note was inserted (or arrived in the snapshot replay)
    Inserted(Note),
    /// A note changed; carries the full merged note
    Updated(Note),
    /// A note was removed
    Deleted(String),
}

/// The board client.
///
/// Manages a WebSocket connection to the board server, sends mutations
/// and surfaces the canonical frame stream as typed events.
pub struct BoardClient {
    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<BoardEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<BoardEvent>,
}

impl BoardClient {
    /// Create a new client for the given server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BoardEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    /// The snapshot replay starts arriving as `Updated` events immediately.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => {
                let (mut ws_writer, mut ws_reader) = ws_stream.split();

                let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
                self.outgoing_tx = Some(out_tx);

                // Writer task: forward queued frames to the socket
                tokio::spawn(async move {
                    while let Some(frame) = out_rx.recv().await {
                        if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                    // Channel dropped: close the socket so the server's
                    // session can unregister.
                    let _ = ws_writer.send(Message::Close(None)).await;
                });

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(BoardEvent::Connected).await;

                // Reader task: surface canonical frames as typed events
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(Message::Text(raw)) => match BoardMessage::parse(raw.as_str()) {
                                Ok(board_msg) => {
                                    if let Some(event) = Self::event_for(board_msg) {
                                        let _ = event_tx.send(event).await;
                                    }
                                }
                                Err(e) => {
                                    log::debug!("Ignoring unparseable frame: {e}");
                                }
                            },
                            Ok(Message::Close(_)) | Err(_) => break,
                            _ => {}
                        }
                    }

                    // Connection lost
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(BoardEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Disconnect by dropping the writer channel; the reader task notices
    /// the close and emits `Disconnected`.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Map a canonical server frame to a client event.
    ///
    /// Server frames always carry `createdAt`; a frame without it cannot
    /// form a full note and is skipped.
    fn event_for(msg: BoardMessage) -> Option<BoardEvent> {
        match msg {
            BoardMessage::Insert { id, patch } => match patch.into_note(id) {
                Some(note) => Some(BoardEvent::Inserted(note)),
                None => {
                    log::debug!("Skipping insert frame without createdAt");
                    None
                }
            },
            BoardMessage::Update { id, patch } => match patch.into_note(id) {
                Some(note) => Some(BoardEvent::Updated(note)),
                None => {
                    log::debug!("Skipping update frame without createdAt");
                    None
                }
            },
            BoardMessage::Delete { id } => Some(BoardEvent::Deleted(id)),
        }
    }

    /// Send an insert for a new note. Unset fields take server defaults.
    pub async fn insert(&self, id: impl Into<String>, patch: NotePatch) -> Result<(), ProtocolError> {
        let msg = BoardMessage::Insert {
            id: id.into(),
            patch,
        };
        self.send_message(&msg).await
    }

    /// Send a partial update for an existing note.
    pub async fn update(&self, id: impl Into<String>, patch: NotePatch) -> Result<(), ProtocolError> {
        let msg = BoardMessage::Update {
            id: id.into(),
            patch,
        };
        self.send_message(&msg).await
    }

    /// Send a delete for a note.
    pub async fn delete(&self, id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_message(&BoardMessage::delete(id)).await
    }

    async fn send_message(&self, msg: &BoardMessage) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
