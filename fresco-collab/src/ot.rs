//! Operational-transform engine: per-room version state and conflict
//! resolution.
//!
//! Each incoming operation is folded through every operation committed
//! after the sender's last known version, in commit order, under the
//! room's write lock. Observing the concurrent set, transforming,
//! incrementing the version counter and appending to the recent buffer
//! happen as one critical section, so two operations can never observe
//! the same concurrent set and receive the same version.
//!
//! Rooms are independent: each has its own lock and version counter, and
//! cross-room operations have no ordering relationship.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fresco_spatial::{BoundingBox, Point};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::SyncError;
use crate::ops::{now_ms, OpPayload, Operation};
use crate::store::OperationStore;

/// Users with no activity for this long drop out of room-user listings.
const USER_ACTIVE_WINDOW: Duration = Duration::from_secs(300);

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct OtConfig {
    /// Recent-operation buffer size per room (catch-up without a store
    /// scan).
    pub recent_ops_cap: usize,
    /// Page size for `operations_since`; callers page past it.
    pub sync_page_size: usize,
    /// Degraded fallback: collapse same-target conflict resolution to
    /// timestamp last-write-wins instead of the full transformation
    /// rules.
    pub last_write_wins: bool,
}

impl Default for OtConfig {
    fn default() -> Self {
        Self {
            recent_ops_cap: 100,
            sync_page_size: 100,
            last_write_wins: false,
        }
    }
}

/// Per-user operational state inside a room.
#[derive(Debug, Clone)]
pub struct UserState {
    pub user_id: Uuid,
    pub last_version: i64,
    pub cursor: Option<Point>,
    pub viewport: Option<BoundingBox>,
    pub selection: Vec<Uuid>,
    pub is_active: bool,
    pub last_activity: Instant,
}

impl UserState {
    fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            last_version: 0,
            cursor: None,
            viewport: None,
            selection: Vec::new(),
            is_active: true,
            last_activity: Instant::now(),
        }
    }
}

/// The operational state of one room.
pub struct RoomState {
    pub room_id: Uuid,
    current_version: i64,
    recent_ops: VecDeque<Operation>,
    users: HashMap<Uuid, UserState>,
    last_activity: Instant,
}

impl RoomState {
    fn new(room_id: Uuid, current_version: i64) -> Self {
        Self {
            room_id,
            current_version,
            recent_ops: VecDeque::with_capacity(128),
            users: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn current_version(&self) -> i64 {
        self.current_version
    }

    fn push_recent(&mut self, op: Operation, cap: usize) {
        self.recent_ops.push_back(op);
        while self.recent_ops.len() > cap {
            self.recent_ops.pop_front();
        }
    }

    /// Update the sender's user state from a committed operation.
    fn touch_user(&mut self, op: &Operation) {
        let user = self
            .users
            .entry(op.user_id)
            .or_insert_with(|| UserState::new(op.user_id));
        user.last_version = op.version;
        user.is_active = true;
        user.last_activity = Instant::now();
        match &op.payload {
            OpPayload::CursorMove { x, y } => user.cursor = Some(Point::new(*x, *y)),
            OpPayload::Selection { stroke_ids } => user.selection = stroke_ids.clone(),
            _ => {}
        }
    }

    fn has_active_users(&self) -> bool {
        self.users.values().any(|u| u.is_active)
    }
}

/// Transform `incoming` against one committed concurrent operation.
///
/// The rules, by (incoming, concurrent) kind pair on the same target:
/// create/create proceed unchanged; update/update resolves to the later
/// `created_at_ms` (the loser becomes a no-op); delete beats update in
/// both directions; delete/delete is an idempotent no-op. `clear_all`
/// conflicts with every stroke operation in the room and always wins.
/// Operations on different targets, and cursor/selection operations,
/// never conflict.
fn transform_pair(incoming: &mut Operation, concurrent: &Operation, last_write_wins: bool) {
    if incoming.payload.is_noop() {
        return;
    }
    // An incoming clear wins against everything already committed.
    if matches!(incoming.payload, OpPayload::ClearAll) {
        return;
    }
    // A committed clear invalidates every queued stroke operation that
    // predates it.
    if matches!(concurrent.payload, OpPayload::ClearAll) {
        if incoming.payload.is_stroke_op() {
            incoming.make_noop();
        }
        return;
    }
    let (Some(target), Some(other)) = (incoming.payload.stroke_id(), concurrent.payload.stroke_id())
    else {
        return;
    };
    if target != other {
        return;
    }
    if last_write_wins {
        if incoming.created_at_ms < concurrent.created_at_ms {
            incoming.make_noop();
        }
        return;
    }
    match (&incoming.payload, &concurrent.payload) {
        (OpPayload::StrokeUpdate { .. }, OpPayload::StrokeUpdate { .. }) => {
            if incoming.created_at_ms < concurrent.created_at_ms {
                incoming.make_noop();
            }
        }
        (OpPayload::StrokeUpdate { .. }, OpPayload::StrokeDelete { .. }) => {
            incoming.make_noop();
        }
        (OpPayload::StrokeDelete { .. }, OpPayload::StrokeDelete { .. }) => {
            // Already deleted; committing a second delete is a no-op.
            incoming.make_noop();
        }
        _ => {}
    }
}

/// Engine-level statistics for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OtStats {
    pub active_rooms: usize,
    pub total_commits: u64,
}

/// The operational-transform engine.
pub struct OtEngine {
    config: OtConfig,
    rooms: RwLock<HashMap<Uuid, Arc<RwLock<RoomState>>>>,
    store: Arc<dyn OperationStore>,
    total_commits: AtomicU64,
}

impl OtEngine {
    pub fn new(store: Arc<dyn OperationStore>, config: OtConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            store,
            total_commits: AtomicU64::new(0),
        }
    }

    async fn room(&self, room_id: Uuid) -> Option<Arc<RwLock<RoomState>>> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    /// Get or create room state, seeding the version counter from the
    /// store so versions stay strictly increasing across evictions.
    pub async fn room_or_create(&self, room_id: Uuid) -> Arc<RwLock<RoomState>> {
        if let Some(room) = self.room(room_id).await {
            return room;
        }
        let seed_version = match self.store.latest_version(room_id) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("could not load version for room {room_id}: {e}; starting at 0");
                0
            }
        };
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id)
            .or_insert_with(|| {
                log::info!("room {room_id} created at version {seed_version}");
                Arc::new(RwLock::new(RoomState::new(room_id, seed_version)))
            })
            .clone()
    }

    /// Transform, version and commit one incoming operation.
    ///
    /// Returns the committed operation — possibly a no-op marker if the
    /// transformation rules discarded it. Rejected operations (malformed
    /// payloads, unhandled kinds) never advance the version counter.
    pub async fn process_operation(
        &self,
        mut op: Operation,
        client_version: i64,
    ) -> Result<Operation, SyncError> {
        op.validate()?;
        let room = self.room_or_create(op.room_id).await;

        let committed = {
            let mut state = room.write().await;

            // Retry a colliding id with a fresh one rather than dropping
            // the operation.
            if state.recent_ops.iter().any(|o| o.id == op.id) {
                let err = SyncError::DuplicateOperationId(op.id);
                let fresh = Uuid::new_v4();
                log::warn!("{err} in room {}; regenerated as {fresh}", state.room_id);
                op.id = fresh;
            }

            for concurrent in state.recent_ops.iter() {
                if concurrent.version <= client_version {
                    continue;
                }
                transform_pair(&mut op, concurrent, self.config.last_write_wins);
                op.transformed_from.push(concurrent.id);
            }

            state.current_version += 1;
            op.version = state.current_version;
            op.applied_at_ms = Some(now_ms());
            state.push_recent(op.clone(), self.config.recent_ops_cap);
            state.touch_user(&op);
            state.last_activity = Instant::now();
            op
        };

        self.total_commits.fetch_add(1, Ordering::Relaxed);

        // Durability sits off the version-assignment critical path; a
        // failed append is logged and the in-memory commit stands.
        if let Err(e) = self.store.append(&committed) {
            log::warn!(
                "store append failed for op {} in room {}: {e}",
                committed.id,
                committed.room_id
            );
        }

        Ok(committed)
    }

    /// Committed operations with `version > version`, ascending, capped
    /// at the sync page size.
    ///
    /// Served from the recent buffer when it covers the requested range;
    /// otherwise from the store, degrading back to the buffer (partial
    /// sync) if the store is unavailable.
    pub async fn operations_since(&self, room_id: Uuid, version: i64) -> Vec<Operation> {
        let page = self.config.sync_page_size;

        if let Some(room) = self.room(room_id).await {
            let state = room.read().await;
            if state.current_version <= version {
                return Vec::new();
            }
            let buffer_covers = state
                .recent_ops
                .front()
                .is_some_and(|oldest| oldest.version <= version + 1);
            if buffer_covers {
                return state
                    .recent_ops
                    .iter()
                    .filter(|o| o.version > version)
                    .take(page)
                    .cloned()
                    .collect();
            }
        }

        match self.store.operations_since(room_id, version, page) {
            Ok(ops) => ops,
            Err(e) => {
                log::warn!(
                    "store unavailable during catch-up for room {room_id}: {e}; \
                     serving recent buffer only"
                );
                match self.room(room_id).await {
                    Some(room) => room
                        .read()
                        .await
                        .recent_ops
                        .iter()
                        .filter(|o| o.version > version)
                        .take(page)
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                }
            }
        }
    }

    /// Register a connected user in the room's user map.
    pub async fn register_user(&self, room_id: Uuid, user_id: Uuid) {
        let room = self.room_or_create(room_id).await;
        let mut state = room.write().await;
        state
            .users
            .entry(user_id)
            .or_insert_with(|| UserState::new(user_id))
            .is_active = true;
        state.last_activity = Instant::now();
    }

    /// Record a user's current viewport for partial-sync scoping.
    pub async fn set_viewport(&self, room_id: Uuid, user_id: Uuid, viewport: BoundingBox) {
        if let Some(room) = self.room(room_id).await {
            let mut state = room.write().await;
            if let Some(user) = state.users.get_mut(&user_id) {
                user.viewport = Some(viewport);
            }
        }
    }

    /// Mark a user disconnected. Returns the number of active users left
    /// in the room (the idle-eviction clock starts at zero).
    pub async fn deregister_user(&self, room_id: Uuid, user_id: Uuid) -> usize {
        match self.room(room_id).await {
            Some(room) => {
                let mut state = room.write().await;
                if let Some(user) = state.users.get_mut(&user_id) {
                    user.is_active = false;
                }
                state.last_activity = Instant::now();
                state.users.values().filter(|u| u.is_active).count()
            }
            None => 0,
        }
    }

    /// Active users with recent activity.
    pub async fn room_users(&self, room_id: Uuid) -> Vec<UserState> {
        match self.room(room_id).await {
            Some(room) => room
                .read()
                .await
                .users
                .values()
                .filter(|u| u.is_active && u.last_activity.elapsed() < USER_ACTIVE_WINDOW)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// The room's last assigned version (0 for unknown rooms).
    pub async fn current_version(&self, room_id: Uuid) -> i64 {
        match self.room(room_id).await {
            Some(room) => room.read().await.current_version,
            None => 0,
        }
    }

    /// Drop rooms with no active users and no activity for `idle`.
    /// Returns the evicted room ids; committed history stays in the
    /// store.
    pub async fn evict_idle(&self, idle: Duration) -> Vec<Uuid> {
        let mut evicted = Vec::new();
        let mut rooms = self.rooms.write().await;
        let ids: Vec<Uuid> = rooms.keys().copied().collect();
        for id in ids {
            let Some(room) = rooms.get(&id).cloned() else {
                continue;
            };
            let state = room.read().await;
            if !state.has_active_users() && state.last_activity.elapsed() >= idle {
                drop(state);
                rooms.remove(&id);
                evicted.push(id);
                log::info!("room {id} evicted (idle)");
            }
        }
        evicted
    }

    pub async fn stats(&self) -> OtStats {
        OtStats {
            active_rooms: self.rooms.read().await.len(),
            total_commits: self.total_commits.load(Ordering::Relaxed),
        }
    }
}
