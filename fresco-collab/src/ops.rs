//! Operation data model: the immutable record of one user action.
//!
//! The payload is a tagged union over the known operation kinds, so the
//! transformation rules dispatch exhaustively at compile time instead of
//! probing an untyped map.

use fresco_spatial::{BoundingBox, Point, StrokeData};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::SyncError;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Typed operation payload.
///
/// `StrokeDelta` is only ever produced by the compression layer when
/// substituting a field-level delta for a previously sent payload;
/// `Noop` is only ever produced by the transformation rules. Neither is
/// accepted on ingress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpPayload {
    StrokeCreate {
        stroke_id: Uuid,
        points: Vec<Point>,
        /// RGBA, 0.0..=1.0 per channel.
        color: [f32; 4],
        thickness: f32,
    },
    StrokeUpdate {
        stroke_id: Uuid,
        points: Option<Vec<Point>>,
        color: Option<[f32; 4]>,
        thickness: Option<f32>,
    },
    StrokeDelete {
        stroke_id: Uuid,
    },
    /// Field-level delta against the last transmitted payload for this id.
    StrokeDelta {
        stroke_id: Uuid,
        points: Option<Vec<Point>>,
        color: Option<[f32; 4]>,
        thickness: Option<f32>,
    },
    CursorMove {
        x: f64,
        y: f64,
    },
    Selection {
        stroke_ids: Vec<Uuid>,
    },
    ClearAll,
    /// Explicit no-op marker left behind by conflict resolution.
    Noop,
}

impl OpPayload {
    /// The stroke this payload targets, if any. Operations on different
    /// targets never conflict.
    pub fn stroke_id(&self) -> Option<Uuid> {
        match self {
            OpPayload::StrokeCreate { stroke_id, .. }
            | OpPayload::StrokeUpdate { stroke_id, .. }
            | OpPayload::StrokeDelete { stroke_id }
            | OpPayload::StrokeDelta { stroke_id, .. } => Some(*stroke_id),
            _ => None,
        }
    }

    /// Whether this payload changes canvas content (as opposed to
    /// presence state like cursors and selections).
    pub fn is_stroke_op(&self) -> bool {
        matches!(
            self,
            OpPayload::StrokeCreate { .. }
                | OpPayload::StrokeUpdate { .. }
                | OpPayload::StrokeDelete { .. }
                | OpPayload::ClearAll
        )
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, OpPayload::Noop)
    }

    /// Kind tag for logging and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpPayload::StrokeCreate { .. } => "stroke_create",
            OpPayload::StrokeUpdate { .. } => "stroke_update",
            OpPayload::StrokeDelete { .. } => "stroke_delete",
            OpPayload::StrokeDelta { .. } => "stroke_delta",
            OpPayload::CursorMove { .. } => "cursor_move",
            OpPayload::Selection { .. } => "selection",
            OpPayload::ClearAll => "clear_all",
            OpPayload::Noop => "noop",
        }
    }
}

/// One user action, versioned and ordered within its room once committed.
///
/// `version` is 0 until the engine commits the operation; after that it
/// is unique and strictly increasing per room and never changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub version: i64,
    pub payload: OpPayload,
    pub created_at_ms: u64,
    #[serde(default)]
    pub applied_at_ms: Option<u64>,
    /// Ids of committed operations this one was resolved against.
    #[serde(default)]
    pub transformed_from: Vec<Uuid>,
}

impl Operation {
    /// A fresh, uncommitted operation stamped with the current time.
    pub fn new(room_id: Uuid, user_id: Uuid, payload: OpPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            version: 0,
            payload,
            created_at_ms: now_ms(),
            applied_at_ms: None,
            transformed_from: Vec::new(),
        }
    }

    /// Validate an ingress operation before it can touch room state.
    ///
    /// Rejections here never advance the version counter.
    pub fn validate(&self) -> Result<(), SyncError> {
        match &self.payload {
            OpPayload::StrokeCreate {
                points, thickness, ..
            } => validate_stroke_geometry(Some(points), *thickness),
            OpPayload::StrokeUpdate {
                points, thickness, ..
            } => validate_stroke_geometry(points.as_deref(), thickness.unwrap_or(1.0)),
            OpPayload::StrokeDelete { .. }
            | OpPayload::CursorMove { .. }
            | OpPayload::Selection { .. }
            | OpPayload::ClearAll => Ok(()),
            // Engine-produced kinds are not valid ingress.
            OpPayload::StrokeDelta { .. } | OpPayload::Noop => Err(SyncError::UnknownOperation(
                self.payload.kind_name().to_string(),
            )),
        }
    }

    /// Bounding box of the stroke geometry this operation carries, padded
    /// by half the stroke thickness so hairline strokes still get a valid
    /// (positive-extent) box.
    pub fn stroke_bbox(&self) -> Option<BoundingBox> {
        match &self.payload {
            OpPayload::StrokeCreate {
                points, thickness, ..
            } => BoundingBox::from_points(points, f64::from(*thickness) / 2.0),
            OpPayload::StrokeUpdate {
                points: Some(points),
                thickness,
                ..
            } => BoundingBox::from_points(points, f64::from((*thickness).unwrap_or(2.0)) / 2.0),
            _ => None,
        }
    }

    /// Replace the payload with the explicit no-op marker.
    pub fn make_noop(&mut self) {
        self.payload = OpPayload::Noop;
    }

    /// Build the stroke record a `stroke_create` inserts into the index.
    pub fn as_indexed_stroke(&self) -> Option<fresco_spatial::IndexedStroke> {
        if let OpPayload::StrokeCreate {
            stroke_id,
            points,
            color,
            thickness,
        } = &self.payload
        {
            let bbox = self.stroke_bbox()?;
            Some(fresco_spatial::IndexedStroke {
                id: *stroke_id,
                room_id: self.room_id,
                user_id: self.user_id,
                data: StrokeData {
                    points: points.clone(),
                    color: *color,
                    thickness: *thickness,
                },
                version: self.version,
                bbox,
                is_active: true,
            })
        } else {
            None
        }
    }
}

fn validate_stroke_geometry(points: Option<&[Point]>, thickness: f32) -> Result<(), SyncError> {
    if !thickness.is_finite() || thickness <= 0.0 {
        return Err(SyncError::InvalidGeometry(format!(
            "thickness must be positive, got {thickness}"
        )));
    }
    if let Some(points) = points {
        if points.is_empty() {
            return Err(SyncError::InvalidGeometry("empty point list".into()));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(SyncError::InvalidGeometry(
                "non-finite point coordinate".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_payload() -> OpPayload {
        OpPayload::StrokeCreate {
            stroke_id: Uuid::new_v4(),
            points: vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)],
            color: [0.0, 0.0, 0.0, 1.0],
            thickness: 2.0,
        }
    }

    #[test]
    fn test_new_operation_is_uncommitted() {
        let op = Operation::new(Uuid::new_v4(), Uuid::new_v4(), create_payload());
        assert_eq!(op.version, 0);
        assert!(op.applied_at_ms.is_none());
        assert!(op.transformed_from.is_empty());
        assert!(op.created_at_ms > 0);
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let op = Operation::new(Uuid::new_v4(), Uuid::new_v4(), create_payload());
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_points() {
        let op = Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OpPayload::StrokeCreate {
                stroke_id: Uuid::new_v4(),
                points: vec![],
                color: [0.0; 4],
                thickness: 2.0,
            },
        );
        assert!(matches!(
            op.validate().unwrap_err(),
            SyncError::InvalidGeometry(_)
        ));
    }

    #[test]
    fn test_validate_rejects_nonfinite_point() {
        let op = Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OpPayload::StrokeCreate {
                stroke_id: Uuid::new_v4(),
                points: vec![Point::new(f64::NAN, 0.0)],
                color: [0.0; 4],
                thickness: 2.0,
            },
        );
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_thickness() {
        let op = Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OpPayload::StrokeCreate {
                stroke_id: Uuid::new_v4(),
                points: vec![Point::new(0.0, 0.0)],
                color: [0.0; 4],
                thickness: 0.0,
            },
        );
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_engine_kinds_on_ingress() {
        let noop = Operation::new(Uuid::new_v4(), Uuid::new_v4(), OpPayload::Noop);
        assert!(matches!(
            noop.validate().unwrap_err(),
            SyncError::UnknownOperation(_)
        ));

        let delta = Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OpPayload::StrokeDelta {
                stroke_id: Uuid::new_v4(),
                points: None,
                color: None,
                thickness: None,
            },
        );
        assert!(delta.validate().is_err());
    }

    #[test]
    fn test_stroke_bbox_padded_by_half_thickness() {
        let op = Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            OpPayload::StrokeCreate {
                stroke_id: Uuid::new_v4(),
                points: vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)],
                color: [0.0; 4],
                thickness: 4.0,
            },
        );
        let bbox = op.stroke_bbox().unwrap();
        assert_eq!(bbox, BoundingBox::new(-2.0, -2.0, 12.0, 2.0));
        assert!(bbox.is_valid());
    }

    #[test]
    fn test_payload_json_tagging() {
        let payload = OpPayload::StrokeDelete {
            stroke_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "stroke_delete");

        let clear = serde_json::to_value(&OpPayload::ClearAll).unwrap();
        assert_eq!(clear["kind"], "clear_all");
    }

    #[test]
    fn test_operation_json_roundtrip() {
        let mut op = Operation::new(Uuid::new_v4(), Uuid::new_v4(), create_payload());
        op.version = 7;
        op.applied_at_ms = Some(now_ms());
        op.transformed_from = vec![Uuid::new_v4()];

        let json = serde_json::to_vec(&op).unwrap();
        let back: Operation = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_stroke_id_targets() {
        let id = Uuid::new_v4();
        assert_eq!(
            OpPayload::StrokeDelete { stroke_id: id }.stroke_id(),
            Some(id)
        );
        assert_eq!(OpPayload::ClearAll.stroke_id(), None);
        assert_eq!(OpPayload::CursorMove { x: 1.0, y: 2.0 }.stroke_id(), None);
    }

    #[test]
    fn test_is_stroke_op() {
        assert!(OpPayload::ClearAll.is_stroke_op());
        assert!(!OpPayload::CursorMove { x: 0.0, y: 0.0 }.is_stroke_op());
        assert!(!OpPayload::Selection { stroke_ids: vec![] }.is_stroke_op());
        assert!(!OpPayload::Noop.is_stroke_op());
    }
}
