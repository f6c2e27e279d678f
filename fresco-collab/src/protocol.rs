//! Binary wire envelope for the sync transport.
//!
//! The outer envelope is bincode-encoded for minimal framing overhead;
//! payloads inside it are JSON, because the batching layer's round-trip
//! contract is defined over the serialized JSON batch.
//!
//! ```text
//! ┌──────┬─────────┬─────────┬────────────────┬──────────┐
//! │ kind │ room_id │ user_id │ client_version │ payload  │
//! │ 1 B  │ 16 B    │ 16 B    │ 8 B            │ variable │
//! └──────┴─────────┴─────────┴────────────────┴──────────┘
//! ```
//!
//! Inbound kinds: `Join`, `Operation`, `SyncRequest`, `Leave`.
//! Outbound kinds: `Operation` (commit ack), `SyncOperation` (catch-up),
//! `Batch` (compressed room traffic), `Rejected` (error echo to the
//! originator only).

use fresco_spatial::BoundingBox;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::CompressedBatch;
use crate::error::SyncError;
use crate::ops::Operation;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client joins a room (first message on a connection).
    Join = 1,
    /// A drawing operation; inbound it is uncommitted, outbound it is
    /// the committed ack to the originator.
    Operation = 2,
    /// Catch-up request after reconnect.
    SyncRequest = 3,
    /// Client leaves the room.
    Leave = 4,
    /// One committed operation during catch-up or initial sync.
    SyncOperation = 5,
    /// Compressed operation batch for the whole room.
    Batch = 6,
    /// Rejected-operation error, echoed only to the originator.
    Rejected = 7,
}

/// Join payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub display_name: String,
    /// Initial viewport; scopes the join snapshot when present.
    pub viewport: Option<BoundingBox>,
}

/// Catch-up payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Last committed version the client has applied.
    pub since_version: i64,
    /// Current viewport; adds a visible-stroke snapshot to the reply
    /// when present.
    pub viewport: Option<BoundingBox>,
}

/// Rejection payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOperation {
    pub operation_id: Uuid,
    pub reason: String,
}

/// The wire envelope.
///
/// `client_version` carries the sender's last known committed version on
/// ingress, and the room's current version on egress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub client_version: i64,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn join(room_id: Uuid, user_id: Uuid, request: &JoinRequest) -> Self {
        Self {
            kind: MessageKind::Join,
            room_id,
            user_id,
            client_version: 0,
            payload: serde_json::to_vec(request).unwrap_or_default(),
        }
    }

    pub fn operation(room_id: Uuid, user_id: Uuid, client_version: i64, op: &Operation) -> Self {
        Self {
            kind: MessageKind::Operation,
            room_id,
            user_id,
            client_version,
            payload: serde_json::to_vec(op).unwrap_or_default(),
        }
    }

    pub fn sync_request(room_id: Uuid, user_id: Uuid, request: &SyncRequest) -> Self {
        Self {
            kind: MessageKind::SyncRequest,
            room_id,
            user_id,
            client_version: request.since_version,
            payload: serde_json::to_vec(request).unwrap_or_default(),
        }
    }

    pub fn leave(room_id: Uuid, user_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Leave,
            room_id,
            user_id,
            client_version: 0,
            payload: Vec::new(),
        }
    }

    /// Commit ack: the (possibly no-op) committed operation back to its
    /// originator.
    pub fn committed(op: &Operation) -> Self {
        Self {
            kind: MessageKind::Operation,
            room_id: op.room_id,
            user_id: op.user_id,
            client_version: op.version,
            payload: serde_json::to_vec(op).unwrap_or_default(),
        }
    }

    /// One committed operation streamed during catch-up. `current_version`
    /// is the room's version at reply time.
    pub fn sync_operation(op: &Operation, current_version: i64) -> Self {
        Self {
            kind: MessageKind::SyncOperation,
            room_id: op.room_id,
            user_id: Uuid::nil(),
            client_version: current_version,
            payload: serde_json::to_vec(op).unwrap_or_default(),
        }
    }

    /// Compressed room batch. `current_version` is the room's version at
    /// flush/join time.
    pub fn batch(compressed: &CompressedBatch, current_version: i64) -> Self {
        Self {
            kind: MessageKind::Batch,
            room_id: compressed.room_id,
            user_id: Uuid::nil(),
            client_version: current_version,
            payload: compressed.payload.clone(),
        }
    }

    /// Rejection echo to the originating client.
    pub fn rejected(room_id: Uuid, user_id: Uuid, operation_id: Uuid, reason: String) -> Self {
        let rejection = RejectedOperation {
            operation_id,
            reason,
        };
        Self {
            kind: MessageKind::Rejected,
            room_id,
            user_id,
            client_version: 0,
            payload: serde_json::to_vec(&rejection).unwrap_or_default(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(format!("encode failed: {e}")))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(format!("decode failed: {e}")))?;
        Ok(msg)
    }

    /// Parse an operation payload (`Operation`/`SyncOperation` kinds).
    pub fn operation_payload(&self) -> Result<Operation, SyncError> {
        if !matches!(self.kind, MessageKind::Operation | MessageKind::SyncOperation) {
            return Err(SyncError::Protocol(format!(
                "no operation payload in {:?} message",
                self.kind
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| SyncError::Protocol(format!("malformed operation payload: {e}")))
    }

    /// Parse a join payload.
    pub fn join_request(&self) -> Result<JoinRequest, SyncError> {
        if self.kind != MessageKind::Join {
            return Err(SyncError::Protocol(format!(
                "no join payload in {:?} message",
                self.kind
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| SyncError::Protocol(format!("malformed join payload: {e}")))
    }

    /// Parse a sync-request payload.
    pub fn sync_request_payload(&self) -> Result<SyncRequest, SyncError> {
        if self.kind != MessageKind::SyncRequest {
            return Err(SyncError::Protocol(format!(
                "no sync-request payload in {:?} message",
                self.kind
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| SyncError::Protocol(format!("malformed sync-request payload: {e}")))
    }

    /// Parse a rejection payload.
    pub fn rejection(&self) -> Result<RejectedOperation, SyncError> {
        if self.kind != MessageKind::Rejected {
            return Err(SyncError::Protocol(format!(
                "no rejection payload in {:?} message",
                self.kind
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| SyncError::Protocol(format!("malformed rejection payload: {e}")))
    }

    /// Decode a batch payload back into its operation list.
    pub fn batch_payload(&self) -> Result<crate::batch::MessageBatch, SyncError> {
        if self.kind != MessageKind::Batch {
            return Err(SyncError::Protocol(format!(
                "no batch payload in {:?} message",
                self.kind
            )));
        }
        CompressedBatch::decode_payload(&self.payload)
    }
}
