//! # fresco-collab — real-time sync core for a collaborative canvas
//!
//! Makes concurrent edits from many clients converge to one consistent
//! canvas per room.
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌─────────────────┐
//! │   Client    │ ◄──────────────► │   SyncServer    │
//! │ (per user)  │   bincode frames │   (transport)   │
//! └─────────────┘                  └────────┬────────┘
//!                                           │
//!                                  ┌────────▼────────┐
//!                                  │ RoomCoordinator │
//!                                  └──┬─────┬─────┬──┘
//!                                     │     │     │
//!                          ┌──────────▼┐ ┌──▼───────────┐ ┌▼───────────────────┐
//!                          │ OtEngine  │ │ SpatialIndex │ │ CompressionManager │
//!                          │ (order)   │ │ (visibility) │ │ (delivery)         │
//!                          └─────┬─────┘ └──────────────┘ └────────────────────┘
//!                                │
//!                          ┌─────▼──────────┐
//!                          │ OperationStore │ (durability, off the hot path)
//!                          └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ops`] — operation data model (tagged payload union)
//! - [`ot`] — operational-transform engine, per-room versioning
//! - [`batch`] — batching, delta compression, LZ4-over-JSON codec
//! - [`room`] — per-room glue, client registry, broadcast fan-out
//! - [`protocol`] — binary wire envelope
//! - [`server`] — WebSocket transport adapter
//! - [`store`] — persistent operation-log boundary
//!
//! ## Guarantees
//!
//! Within a room, commit order equals version-assignment order and
//! versions are unique and strictly increasing. Conflicting concurrent
//! operations are rewritten by the transformation rules so every client
//! converges regardless of arrival order. Batches decompress to JSON
//! byte-identical to what was compressed.

pub mod batch;
pub mod error;
pub mod ops;
pub mod ot;
pub mod protocol;
pub mod room;
pub mod server;
pub mod store;

pub use batch::{
    CompressedBatch, CompressionConfig, CompressionManager, CompressionStats, MessageBatch,
};
pub use error::{StoreError, SyncError};
pub use ops::{now_ms, OpPayload, Operation};
pub use ot::{OtConfig, OtEngine, OtStats, UserState};
pub use protocol::{JoinRequest, MessageKind, RejectedOperation, SyncRequest, WireMessage};
pub use room::{BroadcastGroup, ClientInfo, CollabConfig, JoinOutcome, RoomCoordinator};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{MemoryStore, OperationStore};
