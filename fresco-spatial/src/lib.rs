//! # fresco-spatial — per-room spatial indexing for the fresco canvas
//!
//! Answers "which strokes intersect this rectangle" in sub-linear time so
//! clients only receive and render what is visible.
//!
//! ```text
//! ┌──────────────┐   room id    ┌─────────────────────────┐
//! │ SpatialIndex │ ───────────► │ RoomIndex (per room)    │
//! │ (room map)   │              │  ├── RTree(id, bbox)    │
//! └──────────────┘              │  └── id → IndexedStroke │
//!                               └─────────────────────────┘
//! ```
//!
//! Each room gets its own independently-locked tree instance, so traffic
//! on unrelated rooms never contends. The id side map keeps remove and
//! update at O(log n) — no tree scan to locate an entry by id.

pub mod geom;
pub mod index;

pub use geom::{BoundingBox, Point};
pub use index::{IndexError, IndexStats, IndexedStroke, RoomIndex, SpatialIndex, StrokeData};
