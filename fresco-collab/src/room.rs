//! Room coordinator: glues the OT engine, spatial index and compression
//! manager per room and owns the connected-client registry.
//!
//! Control flow for one client operation:
//! ```text
//! client op ──► OtEngine (transform + version)
//!                  │
//!                  ├──► SpatialIndex (insert/update/remove by stroke id)
//!                  └──► CompressionManager (batched delivery)
//!                            │ flush
//!                            ▼
//!                    BroadcastGroup ──► every connected client
//! ```
//!
//! Flushed batches are encoded once and fanned out as shared buffers;
//! delivery happens outside every room lock. Viewport requests bypass
//! the OT engine and hit the spatial index directly.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use fresco_spatial::{BoundingBox, IndexedStroke, IndexStats, Point, SpatialIndex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::batch::{CompressedBatch, CompressionConfig, CompressionManager, MessageBatch};
use crate::error::SyncError;
use crate::ops::{now_ms, OpPayload, Operation};
use crate::ot::{OtConfig, OtEngine, UserState};
use crate::protocol::{JoinRequest, SyncRequest, WireMessage};
use crate::store::OperationStore;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Broadcast channel capacity per room (messages buffered per
    /// lagging receiver).
    pub broadcast_capacity: usize,
    /// Rooms with no connected users are evicted after this long.
    pub idle_room_timeout: Duration,
    /// How often the cleanup task sweeps for idle rooms.
    pub cleanup_interval: Duration,
    pub ot: OtConfig,
    pub compression: CompressionConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            idle_room_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
            ot: OtConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Connected-client identity.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Fan-out channel for one room: every connected client holds a receiver
/// on the same broadcast channel of pre-encoded frames.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    clients: RwLock<HashMap<Uuid, ClientInfo>>,
    capacity: usize,
}

impl BroadcastGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            clients: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a client, returning its receiver.
    pub fn add_client(&self, info: ClientInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.user_id, info);
        self.sender.subscribe()
    }

    pub fn remove_client(&self, user_id: &Uuid) -> Option<ClientInfo> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Send pre-encoded bytes to every receiver. Returns the receiver
    /// count.
    pub fn broadcast_raw(&self, bytes: Arc<Vec<u8>>) -> usize {
        self.sender.send(bytes).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What a successful join hands back to the transport.
pub struct JoinOutcome {
    /// The client's subscription to room traffic.
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    /// Room version at join time.
    pub current_version: i64,
    /// Snapshot of the (viewport-scoped) canvas as one batch frame.
    pub snapshot: WireMessage,
}

/// The per-process coordinator over all active rooms.
pub struct RoomCoordinator {
    config: CollabConfig,
    ot: OtEngine,
    spatial: SpatialIndex,
    compression: Arc<CompressionManager>,
    groups: Arc<RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>>,
}

impl RoomCoordinator {
    /// Build the coordinator and wire the compression flush path into
    /// the per-room broadcast groups.
    pub fn new(config: CollabConfig, store: Arc<dyn OperationStore>) -> Arc<Self> {
        let compression = Arc::new(CompressionManager::new(config.compression.clone()));
        let groups: Arc<RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>> = Arc::default();

        {
            // Delivery path: encode once, fan out to the room. Runs on
            // the flushing task, never under a room lock.
            let groups = groups.clone();
            compression.set_flush_callback(move |compressed: CompressedBatch| {
                let frame = WireMessage::batch(&compressed, compressed.last_version);
                match frame.encode() {
                    Ok(bytes) => {
                        let group = groups
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get(&compressed.room_id)
                            .cloned();
                        if let Some(group) = group {
                            group.broadcast_raw(Arc::new(bytes));
                        }
                    }
                    Err(e) => {
                        log::error!(
                            "failed to encode batch frame for room {}: {e}",
                            compressed.room_id
                        );
                    }
                }
            });
        }

        Arc::new(Self {
            ot: OtEngine::new(store, config.ot.clone()),
            spatial: SpatialIndex::new(),
            compression,
            groups,
            config,
        })
    }

    fn group(&self, room_id: Uuid) -> Option<Arc<BroadcastGroup>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .cloned()
    }

    fn group_or_create(&self, room_id: Uuid) -> Arc<BroadcastGroup> {
        if let Some(group) = self.group(room_id) {
            return group;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(room_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.config.broadcast_capacity)))
            .clone()
    }

    /// Register a client with a room and build its initial snapshot.
    pub async fn join(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        request: JoinRequest,
    ) -> Result<JoinOutcome, SyncError> {
        if let Some(viewport) = &request.viewport {
            if !viewport.is_valid() {
                return Err(SyncError::InvalidGeometry(format!("{viewport:?}")));
            }
        }

        let group = self.group_or_create(room_id);
        let receiver = group.add_client(ClientInfo {
            user_id,
            display_name: request.display_name.clone(),
        });
        self.ot.register_user(room_id, user_id).await;
        if let Some(viewport) = request.viewport {
            self.ot.set_viewport(room_id, user_id, viewport).await;
        }

        let current_version = self.ot.current_version(room_id).await;
        let strokes = match request.viewport {
            Some(viewport) => self.spatial.query_viewport(&viewport, room_id)?,
            None => self.spatial.strokes_in_room(room_id),
        };
        let snapshot = snapshot_batch(room_id, current_version, &strokes)?;

        log::info!(
            "user {user_id} ({}) joined room {room_id} at version {current_version} \
             ({} visible strokes)",
            request.display_name,
            strokes.len()
        );

        Ok(JoinOutcome {
            receiver,
            current_version,
            snapshot,
        })
    }

    /// Process one client operation through all three engines.
    ///
    /// Returns the committed operation for the ack to the originator; a
    /// rejection leaves every engine untouched.
    pub async fn submit_operation(
        &self,
        op: Operation,
        client_version: i64,
    ) -> Result<Operation, SyncError> {
        let committed = self.ot.process_operation(op, client_version).await?;
        self.apply_to_spatial(&committed);
        self.compression.add_operation(committed.clone());
        Ok(committed)
    }

    /// Keep the spatial index current with a committed operation.
    ///
    /// Convergence is decided by the transform fold, not index state: an
    /// update or delete addressing an id the index never held is logged
    /// and skipped, the commit stands.
    fn apply_to_spatial(&self, op: &Operation) {
        match &op.payload {
            OpPayload::StrokeCreate { .. } => {
                if let Some(stroke) = op.as_indexed_stroke() {
                    if let Err(e) = self.spatial.insert(stroke) {
                        log::warn!("spatial insert failed for op {}: {e}", op.id);
                    }
                }
            }
            OpPayload::StrokeUpdate {
                stroke_id,
                points,
                color,
                thickness,
            } => match self.spatial.get(op.room_id, *stroke_id) {
                Some(mut stroke) => {
                    if let Some(points) = points {
                        stroke.data.points = points.clone();
                    }
                    if let Some(color) = color {
                        stroke.data.color = *color;
                    }
                    if let Some(thickness) = thickness {
                        stroke.data.thickness = *thickness;
                    }
                    if let Some(bbox) = BoundingBox::from_points(
                        &stroke.data.points,
                        f64::from(stroke.data.thickness) / 2.0,
                    ) {
                        stroke.bbox = bbox;
                    }
                    stroke.version = op.version;
                    if let Err(e) = self.spatial.update(op.room_id, *stroke_id, stroke) {
                        log::warn!("spatial update failed for stroke {stroke_id}: {e}");
                    }
                }
                None => {
                    log::warn!(
                        "update for unknown stroke {stroke_id} in room {}",
                        op.room_id
                    );
                }
            },
            OpPayload::StrokeDelete { stroke_id } => {
                if let Err(e) = self.spatial.remove(op.room_id, *stroke_id) {
                    log::warn!("spatial remove failed for stroke {stroke_id}: {e}");
                }
            }
            OpPayload::ClearAll => {
                self.spatial.clear_room(op.room_id);
            }
            _ => {}
        }
    }

    /// Catch-up: committed operations past the client's version, plus a
    /// visible-stroke snapshot when a viewport is supplied.
    pub async fn sync_since(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        request: SyncRequest,
    ) -> Result<Vec<WireMessage>, SyncError> {
        let current_version = self.ot.current_version(room_id).await;
        let mut frames = Vec::new();
        for op in self.ot.operations_since(room_id, request.since_version).await {
            frames.push(WireMessage::sync_operation(&op, current_version));
        }
        if let Some(viewport) = request.viewport {
            self.ot.set_viewport(room_id, user_id, viewport).await;
            for stroke in self.spatial.query_viewport(&viewport, room_id)? {
                frames.push(WireMessage::sync_operation(
                    &stroke_snapshot_op(&stroke),
                    current_version,
                ));
            }
        }
        Ok(frames)
    }

    /// Deregister a disconnected client. It is never counted in future
    /// queries; the last client out starts the idle-eviction clock.
    pub async fn leave(&self, room_id: Uuid, user_id: Uuid) {
        let remaining = {
            match self.group(room_id) {
                Some(group) => {
                    group.remove_client(&user_id);
                    group.client_count()
                }
                None => 0,
            }
        };
        if remaining == 0 {
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(group) = groups.get(&room_id) {
                if group.client_count() == 0 {
                    groups.remove(&room_id);
                }
            }
        }
        self.ot.deregister_user(room_id, user_id).await;
        log::info!("user {user_id} left room {room_id} ({remaining} clients remain)");
    }

    /// Viewport query, bypassing the OT engine.
    pub fn query_viewport(
        &self,
        viewport: &BoundingBox,
        room_id: Uuid,
    ) -> Result<Vec<IndexedStroke>, SyncError> {
        Ok(self.spatial.query_viewport(viewport, room_id)?)
    }

    /// Radius query for proximity selection/erase tools.
    pub fn query_circle(
        &self,
        center: Point,
        radius: f64,
        room_id: Uuid,
    ) -> Result<Vec<IndexedStroke>, SyncError> {
        Ok(self.spatial.query_circle(center, radius, room_id)?)
    }

    /// Drop every spatial entry for a room. Returns the number of
    /// strokes removed.
    pub fn clear_room(&self, room_id: Uuid) -> usize {
        self.spatial.clear_room(room_id)
    }

    /// Committed operations past `version`, for direct (non-transport)
    /// callers.
    pub async fn operations_since(&self, room_id: Uuid, version: i64) -> Vec<Operation> {
        self.ot.operations_since(room_id, version).await
    }

    /// Active users in a room.
    pub async fn room_users(&self, room_id: Uuid) -> Vec<UserState> {
        self.ot.room_users(room_id).await
    }

    /// Force-flush a room's pending batch.
    pub fn flush_room(&self, room_id: Uuid) -> bool {
        self.compression.flush_room(room_id)
    }

    pub fn spatial_stats(&self) -> IndexStats {
        self.spatial.stats()
    }

    /// Spawn the batch-timeout flusher and the idle-room cleanup task.
    /// Both end when the coordinator is dropped.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let flusher = self.compression.spawn_flusher();

        let weak = Arc::downgrade(self);
        let interval = self.config.cleanup_interval;
        let idle = self.config.idle_room_timeout;
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else { break };
                for room_id in coordinator.ot.evict_idle(idle).await {
                    coordinator.compression.flush_room(room_id);
                    coordinator.spatial.clear_room(room_id);
                    let mut groups = coordinator
                        .groups
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    groups.remove(&room_id);
                }
            }
        });

        vec![flusher, cleanup]
    }

    /// Health/monitoring snapshot for the stats endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let connected: usize = {
            let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
            groups.values().map(|g| g.client_count()).sum()
        };
        serde_json::json!({
            "status": "healthy",
            "spatial_index": self.spatial.stats(),
            "ot_engine": self.ot.stats().await,
            "connected_clients": connected,
            "compression": self.compression.stats(),
        })
    }
}

/// Synthesize the stroke-create operation a snapshot entry rides in.
fn stroke_snapshot_op(stroke: &IndexedStroke) -> Operation {
    Operation {
        id: Uuid::new_v4(),
        room_id: stroke.room_id,
        user_id: stroke.user_id,
        version: stroke.version,
        payload: OpPayload::StrokeCreate {
            stroke_id: stroke.id,
            points: stroke.data.points.clone(),
            color: stroke.data.color,
            thickness: stroke.data.thickness,
        },
        created_at_ms: now_ms(),
        applied_at_ms: None,
        transformed_from: Vec::new(),
    }
}

/// Pack a stroke snapshot into one compressed batch frame.
fn snapshot_batch(
    room_id: Uuid,
    current_version: i64,
    strokes: &[IndexedStroke],
) -> Result<WireMessage, SyncError> {
    let now = now_ms();
    let batch = MessageBatch {
        room_id,
        messages: strokes.iter().map(stroke_snapshot_op).collect(),
        start_time_ms: now,
        last_update_ms: now,
        size: strokes.len(),
    };
    let compressed = CompressedBatch::compress(&batch)?;
    Ok(WireMessage::batch(&compressed, current_version))
}
