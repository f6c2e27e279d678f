//! Error taxonomy for the sync core.
//!
//! Geometry and version invariant violations are rejected outright and
//! reported to the caller, never silently coerced. Store failures are
//! recoverable: catch-up degrades to the in-memory buffer, appends are
//! retried by the durability layer, and neither ever fails a client
//! request on its own.

use fresco_spatial::IndexError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the sync engines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Malformed bounding box or stroke geometry.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Operation kind the transformation rules cannot resolve.
    #[error("unknown operation kind: {0}")]
    UnknownOperation(String),
    /// Remove/update addressed an absent id.
    #[error("not found: {0}")]
    NotFound(Uuid),
    /// Persistent-store call failed.
    #[error("persistent store unavailable: {0}")]
    StoreUnavailable(String),
    /// Operation id collides with an already-committed operation.
    #[error("duplicate operation id: {0}")]
    DuplicateOperationId(Uuid),
    /// Wire envelope could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<IndexError> for SyncError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::InvalidGeometry(bbox) => SyncError::InvalidGeometry(format!("{bbox:?}")),
            IndexError::NotFound(id) => SyncError::NotFound(id),
        }
    }
}

/// Errors from the persistent operation log (external collaborator).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SyncError::StoreUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fresco_spatial::BoundingBox;

    #[test]
    fn test_index_error_maps_to_taxonomy() {
        let bad = BoundingBox::new(10.0, 0.0, 0.0, 10.0);
        let err: SyncError = IndexError::InvalidGeometry(bad).into();
        assert!(matches!(err, SyncError::InvalidGeometry(_)));

        let id = Uuid::new_v4();
        let err: SyncError = IndexError::NotFound(id).into();
        assert_eq!(err, SyncError::NotFound(id));
    }

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let err: SyncError = StoreError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, SyncError::StoreUnavailable(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}
