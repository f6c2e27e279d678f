//! Persistent operation-log boundary.
//!
//! The store is an external collaborator: an append-only operation log
//! keyed by room with a monotonic version index and a "operations since
//! version X" seek. The engine calls into it only for durability of
//! committed operations and for history replay on a recent-buffer miss —
//! it is never on the critical path of version assignment.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ops::Operation;

/// Contract the persistent operation log must satisfy.
pub trait OperationStore: Send + Sync {
    /// Durably append a committed operation.
    fn append(&self, op: &Operation) -> Result<(), StoreError>;

    /// Committed operations with `version > version`, ascending, capped
    /// at `limit`. Callers page by re-requesting from the last version
    /// they received.
    fn operations_since(
        &self,
        room_id: Uuid,
        version: i64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError>;

    /// Highest committed version for the room (0 if none). Used to seed
    /// the in-memory version counter when a room is recreated after
    /// eviction.
    fn latest_version(&self, room_id: Uuid) -> Result<i64, StoreError>;
}

/// In-memory reference implementation of the store contract.
///
/// Used as the default backing and in tests; deployments substitute a
/// durable implementation behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<Uuid, Vec<Operation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations logged for a room.
    pub fn len(&self, room_id: Uuid) -> usize {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .map_or(0, Vec::len)
    }
}

impl OperationStore for MemoryStore {
    fn append(&self, op: &Operation) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.entry(op.room_id).or_default().push(op.clone());
        Ok(())
    }

    fn operations_since(
        &self,
        room_id: Uuid,
        version: i64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ops: Vec<Operation> = rooms
            .get(&room_id)
            .map(|log| {
                log.iter()
                    .filter(|op| op.version > version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        ops.sort_by_key(|op| op.version);
        ops.truncate(limit);
        Ok(ops)
    }

    fn latest_version(&self, room_id: Uuid) -> Result<i64, StoreError> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms
            .get(&room_id)
            .and_then(|log| log.iter().map(|op| op.version).max())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpPayload;

    fn committed(room: Uuid, version: i64) -> Operation {
        let mut op = Operation::new(room, Uuid::new_v4(), OpPayload::ClearAll);
        op.version = version;
        op
    }

    #[test]
    fn test_append_and_seek() {
        let store = MemoryStore::new();
        let room = Uuid::new_v4();
        for v in 1..=5 {
            store.append(&committed(room, v)).unwrap();
        }

        let ops = store.operations_since(room, 2, 100).unwrap();
        assert_eq!(
            ops.iter().map(|o| o.version).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[test]
    fn test_seek_respects_limit() {
        let store = MemoryStore::new();
        let room = Uuid::new_v4();
        for v in 1..=10 {
            store.append(&committed(room, v)).unwrap();
        }

        let ops = store.operations_since(room, 0, 4).unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops.last().unwrap().version, 4);
    }

    #[test]
    fn test_rooms_are_separate_logs() {
        let store = MemoryStore::new();
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        store.append(&committed(room_a, 1)).unwrap();
        store.append(&committed(room_b, 1)).unwrap();
        store.append(&committed(room_b, 2)).unwrap();

        assert_eq!(store.len(room_a), 1);
        assert_eq!(store.len(room_b), 2);
        assert_eq!(store.latest_version(room_a).unwrap(), 1);
        assert_eq!(store.latest_version(room_b).unwrap(), 2);
    }

    #[test]
    fn test_latest_version_empty_room() {
        let store = MemoryStore::new();
        assert_eq!(store.latest_version(Uuid::new_v4()).unwrap(), 0);
    }
}
