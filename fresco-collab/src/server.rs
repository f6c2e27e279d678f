//! WebSocket sync server: the transport adapter in front of the room
//! coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RoomCoordinator ── OtEngine ── SpatialIndex
//! Client B ──┘         │
//!                       └── CompressionManager ── BroadcastGroup
//!                                                      │
//!                                           ┌──────────┼──────────┐
//!                                           ▼          ▼          ▼
//!                                        Client A   Client B   Client C
//! ```
//!
//! One task per connection: inbound frames are decoded into coordinator
//! calls, and the connection's broadcast receiver is pumped back out to
//! the socket. Rejected operations are echoed only to the originator;
//! room traffic reaches everyone through flushed batches.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageKind, WireMessage};
use crate::room::{CollabConfig, RoomCoordinator};
use crate::store::{MemoryStore, OperationStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9098".to_string(),
            collab: CollabConfig::default(),
        }
    }
}

/// Connection-level statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<RoomCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn OperationStore>) -> Self {
        let coordinator = RoomCoordinator::new(config.collab.clone(), store);
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration with an in-memory operation store.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<RoomCoordinator> {
        &self.coordinator
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Run the accept loop. Call from an async runtime; never returns
    /// except on listener failure.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let _background = self.coordinator.spawn_background_tasks();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Serve a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<RoomCoordinator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set on Join; a connection serves exactly one (room, user).
        let mut session: Option<(Uuid, Uuid)> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match WireMessage::decode(&bytes) {
                                Ok(frame) => {
                                    match Self::dispatch(
                                        &coordinator,
                                        frame,
                                        &mut session,
                                        &mut broadcast_rx,
                                    )
                                    .await
                                    {
                                        Some(reply) => {
                                            for frame in reply {
                                                let encoded = frame.encode()?;
                                                ws_sender
                                                    .send(Message::Binary(encoded.into()))
                                                    .await?;
                                            }
                                        }
                                        // Leave: clean close.
                                        None => break,
                                    }
                                }
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                msg = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not joined yet — wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("client {session:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        if let Some((room_id, user_id)) = session {
            coordinator.leave(room_id, user_id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("connection closed from {addr}");

        Ok(())
    }

    /// Translate one inbound frame into coordinator calls.
    ///
    /// Returns the reply frames for this client, or `None` for a clean
    /// Leave.
    async fn dispatch(
        coordinator: &Arc<RoomCoordinator>,
        frame: WireMessage,
        session: &mut Option<(Uuid, Uuid)>,
        broadcast_rx: &mut Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>>,
    ) -> Option<Vec<WireMessage>> {
        match frame.kind {
            MessageKind::Join => {
                let request = match frame.join_request() {
                    Ok(request) => request,
                    Err(e) => {
                        return Some(vec![WireMessage::rejected(
                            frame.room_id,
                            frame.user_id,
                            Uuid::nil(),
                            e.to_string(),
                        )]);
                    }
                };
                match coordinator.join(frame.room_id, frame.user_id, request).await {
                    Ok(outcome) => {
                        *session = Some((frame.room_id, frame.user_id));
                        *broadcast_rx = Some(outcome.receiver);
                        Some(vec![outcome.snapshot])
                    }
                    Err(e) => Some(vec![WireMessage::rejected(
                        frame.room_id,
                        frame.user_id,
                        Uuid::nil(),
                        e.to_string(),
                    )]),
                }
            }

            MessageKind::Operation => {
                let op = match frame.operation_payload() {
                    Ok(op) => op,
                    Err(e) => {
                        return Some(vec![WireMessage::rejected(
                            frame.room_id,
                            frame.user_id,
                            Uuid::nil(),
                            e.to_string(),
                        )]);
                    }
                };
                let op_id = op.id;
                match coordinator.submit_operation(op, frame.client_version).await {
                    Ok(committed) => Some(vec![WireMessage::committed(&committed)]),
                    Err(e) => {
                        log::warn!(
                            "rejected operation {op_id} from {} in room {}: {e}",
                            frame.user_id,
                            frame.room_id
                        );
                        Some(vec![WireMessage::rejected(
                            frame.room_id,
                            frame.user_id,
                            op_id,
                            e.to_string(),
                        )])
                    }
                }
            }

            MessageKind::SyncRequest => {
                let request = match frame.sync_request_payload() {
                    Ok(request) => request,
                    Err(e) => {
                        return Some(vec![WireMessage::rejected(
                            frame.room_id,
                            frame.user_id,
                            Uuid::nil(),
                            e.to_string(),
                        )]);
                    }
                };
                match coordinator
                    .sync_since(frame.room_id, frame.user_id, request)
                    .await
                {
                    Ok(frames) => Some(frames),
                    Err(e) => Some(vec![WireMessage::rejected(
                        frame.room_id,
                        frame.user_id,
                        Uuid::nil(),
                        e.to_string(),
                    )]),
                }
            }

            MessageKind::Leave => None,

            _ => {
                log::debug!("unhandled inbound kind {:?}", frame.kind);
                Some(Vec::new())
            }
        }
    }
}
