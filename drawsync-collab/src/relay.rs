//! Room relay: a WebSocket server that forwards frames between the peers
//! of a room without ever decrypting them.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──► Client B
//!             ├── /{roomId} ── BroadcastGroup
//! Client C ──┘         │               └──► Client D
//!                      │
//!                      └── {"type":"user_count","count":N} on join / leave
//! ```
//!
//! Binary frames are checked with [`unpack`] and fanned out to every other
//! peer of the room; frames that fail are dropped. The relay holds no
//! document state.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{FramePayload, Membership, RelayFrame, RoomManager};
use crate::protocol::unpack;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Connections beyond this are closed on arrival
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

impl RelayConfig {
    /// Defaults, with `bind_addr` taken from `DRAWSYNC_RELAY_ADDR` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("DRAWSYNC_RELAY_ADDR") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let room_manager = self.room_manager.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, room_manager, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

/// Room id from a request path: its last non-empty segment.
pub fn room_from_path(path: &str) -> Option<&str> {
    path.split('/').rev().find(|segment| !segment.is_empty())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), RelayError> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let Some(room_id) = room_from_path(&path).map(str::to_string) else {
        log::warn!("Rejecting {addr}: no room in path {path:?}");
        ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "missing room id".into(),
            })))
            .await?;
        return Ok(());
    };

    let peer_id = Uuid::new_v4();
    let Membership {
        group,
        receiver: mut broadcast_rx,
        peer_count,
    } = match room_manager.join(&room_id, peer_id, addr).await {
        Ok(membership) => membership,
        Err(e) => {
            log::warn!("Rejecting {addr}: {e}");
            ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: "room full".into(),
                })))
                .await?;
            return Ok(());
        }
    };
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        s.active_rooms = room_manager.room_count().await;
    }
    log::info!("Peer {peer_id} ({addr}) joined room {room_id}, {peer_count} connected");

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let accepted = match unpack(&data) {
                            Ok(frame) => {
                                log::trace!("{} from {peer_id} ({} bytes)", frame.opcode, data.len());
                                group.broadcast(RelayFrame::binary(peer_id, data.to_vec()));
                                true
                            }
                            Err(e) => {
                                log::warn!("Dropping frame from {addr}: {e}");
                                false
                            }
                        };
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += data.len() as u64;
                        if !accepted {
                            s.dropped_frames += 1;
                        }
                    }

                    Some(Ok(Message::Text(_))) => {
                        log::debug!("Ignoring text frame from {addr}");
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        // Don't echo back to sender
                        if frame.is_from(peer_id) {
                            continue;
                        }
                        let msg = match &frame.payload {
                            FramePayload::Binary(bytes) => Message::Binary(bytes.clone().into()),
                            FramePayload::Text(text) => Message::Text(text.clone().into()),
                        };
                        if let Err(e) = ws_sender.send(msg).await {
                            log::warn!("Failed to forward to {addr}: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {peer_id} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if room_manager.leave(&room_id, &peer_id).await == 0 {
        log::info!("Room {room_id} removed (empty)");
    }

    let mut s = stats.write().await;
    s.active_connections -= 1;
    s.active_rooms = room_manager.room_count().await;
    Ok(())
}
