//! Per-room rectangle-tree index for viewport and proximity queries.
//!
//! Each room owns an independent [`rstar::RTree`] of `(stroke id, bbox)`
//! entries plus a stroke-id side map. The side map serves two purposes:
//! it holds the full stroke record (the tree stores only geometry), and it
//! makes remove/update O(log n) — the removal path looks up the entry's
//! current bounds by id instead of scanning the tree.
//!
//! Rooms are looked up through an outer map of independently-locked tree
//! instances, so concurrent traffic on unrelated rooms never contends.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rstar::{RTree, RTreeObject, AABB};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::geom::{BoundingBox, Point};

/// Spatial index errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    /// Bounding box violates the `x1 < x2`, `y1 < y2` invariant.
    #[error("invalid bounding box: {0:?}")]
    InvalidGeometry(BoundingBox),
    /// No entry with this stroke id.
    #[error("stroke not found in spatial index: {0}")]
    NotFound(Uuid),
}

/// Rendering payload carried by each indexed stroke.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrokeData {
    pub points: Vec<Point>,
    /// RGBA, 0.0..=1.0 per channel.
    pub color: [f32; 4],
    pub thickness: f32,
}

/// The index's record for one stroke.
///
/// Created on stroke creation, replaced on update/move, removed (not
/// flagged) on deletion so the index never accumulates dead geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedStroke {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub data: StrokeData,
    pub version: i64,
    pub bbox: BoundingBox,
    pub is_active: bool,
}

/// Tree entry: geometry plus the id linking back to the side map.
#[derive(Clone, Debug, PartialEq)]
struct TreeEntry {
    id: Uuid,
    bbox: BoundingBox,
}

impl RTreeObject for TreeEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.bbox.x1, self.bbox.y1], [self.bbox.x2, self.bbox.y2])
    }
}

// ───────────────────────────────────────────────────────────────────
// RoomIndex — one tree per room
// ───────────────────────────────────────────────────────────────────

/// The spatial structure for a single room.
#[derive(Default)]
pub struct RoomIndex {
    tree: RTree<TreeEntry>,
    strokes: FxHashMap<Uuid, IndexedStroke>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a stroke, replacing any existing entry with the same id.
    ///
    /// Rejects strokes whose bounding box violates the geometry invariant.
    pub fn insert(&mut self, stroke: IndexedStroke) -> Result<(), IndexError> {
        if !stroke.bbox.is_valid() {
            return Err(IndexError::InvalidGeometry(stroke.bbox));
        }
        if self.strokes.contains_key(&stroke.id) {
            // Re-insert: drop the stale geometry first.
            let _ = self.remove(stroke.id);
        }
        self.tree.insert(TreeEntry {
            id: stroke.id,
            bbox: stroke.bbox,
        });
        self.strokes.insert(stroke.id, stroke);
        Ok(())
    }

    /// Replace the entry for `id` with `new_stroke` (remove + insert).
    pub fn update(&mut self, id: Uuid, new_stroke: IndexedStroke) -> Result<(), IndexError> {
        if !new_stroke.bbox.is_valid() {
            return Err(IndexError::InvalidGeometry(new_stroke.bbox));
        }
        self.remove(id)?;
        self.insert(new_stroke)
    }

    /// Remove the entry for `id`, returning the stroke it held.
    pub fn remove(&mut self, id: Uuid) -> Result<IndexedStroke, IndexError> {
        let stroke = self.strokes.remove(&id).ok_or(IndexError::NotFound(id))?;
        self.tree.remove(&TreeEntry {
            id,
            bbox: stroke.bbox,
        });
        Ok(stroke)
    }

    /// All active strokes whose bounding box intersects `viewport`
    /// (closed-interval test).
    pub fn query_viewport(&self, viewport: &BoundingBox) -> Result<Vec<IndexedStroke>, IndexError> {
        if !viewport.is_valid() {
            return Err(IndexError::InvalidGeometry(*viewport));
        }
        let envelope = AABB::from_corners(
            [viewport.x1, viewport.y1],
            [viewport.x2, viewport.y2],
        );
        let mut results = Vec::new();
        for entry in self.tree.locate_in_envelope_intersecting(&envelope) {
            // The tree narrows; the closed-interval test decides.
            if !entry.bbox.intersects(viewport) {
                continue;
            }
            if let Some(stroke) = self.strokes.get(&entry.id) {
                if stroke.is_active {
                    results.push(stroke.clone());
                }
            }
        }
        Ok(results)
    }

    /// Active strokes within `radius` of `center`: narrowed through the
    /// circle's bounding square, then filtered by exact
    /// closest-point-on-rectangle distance.
    pub fn query_circle(
        &self,
        center: Point,
        radius: f64,
    ) -> Result<Vec<IndexedStroke>, IndexError> {
        let square = BoundingBox::around_circle(center, radius);
        let mut results = self.query_viewport(&square)?;
        results.retain(|s| s.bbox.overlaps_circle(center, radius));
        Ok(results)
    }

    /// Look up a stroke by id.
    pub fn get(&self, id: Uuid) -> Option<&IndexedStroke> {
        self.strokes.get(&id)
    }

    /// All active strokes in the room.
    pub fn all_active(&self) -> Vec<IndexedStroke> {
        self.strokes
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.strokes.values().filter(|s| s.is_active).count()
    }

    /// Approximate tree height from the entry count (the tree does not
    /// expose its height directly).
    pub fn height_estimate(&self) -> usize {
        let mut height = 0;
        let mut n = self.tree.size();
        while n > 1 {
            n /= 4;
            height += 1;
        }
        height
    }
}

// ───────────────────────────────────────────────────────────────────
// SpatialIndex — room id → independently-locked RoomIndex
// ───────────────────────────────────────────────────────────────────

/// Capacity-monitoring snapshot across all rooms.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub total_items: usize,
    pub room_counts: HashMap<Uuid, usize>,
    pub tree_height: usize,
}

/// The process-wide spatial index: a map from room id to that room's
/// [`RoomIndex`], each behind its own lock.
#[derive(Default)]
pub struct SpatialIndex {
    rooms: RwLock<HashMap<Uuid, Arc<RwLock<RoomIndex>>>>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn room(&self, room_id: Uuid) -> Option<Arc<RwLock<RoomIndex>>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .cloned()
    }

    fn room_or_create(&self, room_id: Uuid) -> Arc<RwLock<RoomIndex>> {
        if let Some(room) = self.room(room_id) {
            return room;
        }
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomIndex::new())))
            .clone()
    }

    /// Insert a stroke into its room's tree.
    pub fn insert(&self, stroke: IndexedStroke) -> Result<(), IndexError> {
        let room = self.room_or_create(stroke.room_id);
        let mut index = room.write().unwrap_or_else(PoisonError::into_inner);
        index.insert(stroke)
    }

    /// Replace the stroke `stroke_id` in `room_id`.
    pub fn update(
        &self,
        room_id: Uuid,
        stroke_id: Uuid,
        new_stroke: IndexedStroke,
    ) -> Result<(), IndexError> {
        let room = self.room(room_id).ok_or(IndexError::NotFound(stroke_id))?;
        let mut index = room.write().unwrap_or_else(PoisonError::into_inner);
        index.update(stroke_id, new_stroke)
    }

    /// Remove the stroke `stroke_id` from `room_id`.
    pub fn remove(&self, room_id: Uuid, stroke_id: Uuid) -> Result<IndexedStroke, IndexError> {
        let room = self.room(room_id).ok_or(IndexError::NotFound(stroke_id))?;
        let mut index = room.write().unwrap_or_else(PoisonError::into_inner);
        index.remove(stroke_id)
    }

    /// Active strokes in `room_id` intersecting `viewport`. Unknown rooms
    /// yield an empty result (a valid query against nothing).
    pub fn query_viewport(
        &self,
        viewport: &BoundingBox,
        room_id: Uuid,
    ) -> Result<Vec<IndexedStroke>, IndexError> {
        if !viewport.is_valid() {
            return Err(IndexError::InvalidGeometry(*viewport));
        }
        match self.room(room_id) {
            Some(room) => {
                let index = room.read().unwrap_or_else(PoisonError::into_inner);
                index.query_viewport(viewport)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Active strokes in `room_id` within `radius` of `center`.
    pub fn query_circle(
        &self,
        center: Point,
        radius: f64,
        room_id: Uuid,
    ) -> Result<Vec<IndexedStroke>, IndexError> {
        match self.room(room_id) {
            Some(room) => {
                let index = room.read().unwrap_or_else(PoisonError::into_inner);
                index.query_circle(center, radius)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Copy of one stroke's current record, if present.
    pub fn get(&self, room_id: Uuid, stroke_id: Uuid) -> Option<IndexedStroke> {
        self.room(room_id).and_then(|room| {
            room.read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(stroke_id)
                .cloned()
        })
    }

    /// Snapshot of every active stroke in the room, for initial sync.
    pub fn strokes_in_room(&self, room_id: Uuid) -> Vec<IndexedStroke> {
        match self.room(room_id) {
            Some(room) => room
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .all_active(),
            None => Vec::new(),
        }
    }

    /// Drop every entry for `room_id`. Returns the number of strokes
    /// removed.
    pub fn clear_room(&self, room_id: Uuid) -> usize {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
            match rooms.remove(&room_id) {
                Some(room) => room.read().unwrap_or_else(PoisonError::into_inner).len(),
                None => 0,
            }
        };
        if removed > 0 {
            log::info!("cleared {removed} strokes from room {room_id}");
        }
        removed
    }

    /// Entry counts and an approximate tree height, for capacity
    /// monitoring.
    pub fn stats(&self) -> IndexStats {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = IndexStats::default();
        for (room_id, room) in rooms.iter() {
            let index = room.read().unwrap_or_else(PoisonError::into_inner);
            stats.total_items += index.len();
            stats.room_counts.insert(*room_id, index.active_count());
            stats.tree_height = stats.tree_height.max(index.height_estimate());
        }
        stats
    }
}
