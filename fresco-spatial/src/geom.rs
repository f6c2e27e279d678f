//! Geometry value types shared by the sync engines.
//!
//! All coordinates are `f64`. Containment and intersection tests use
//! closed intervals (edges count as inside) so strokes sitting exactly on
//! a viewport edge never flap in and out of query results.

use serde::{Deserialize, Serialize};

/// A 2-D point in canvas coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box stored as min/max corners.
///
/// Invariant: `x1 < x2` and `y1 < y2`. Boxes violating the invariant are
/// rejected by [`BoundingBox::is_valid`] checks at every index boundary,
/// never silently coerced.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Strict invariant check: finite coordinates, positive extent on both
    /// axes.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    /// Closed-interval overlap test.
    #[inline]
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.x1 <= other.x2
            && self.x2 >= other.x1
            && self.y1 <= other.y2
            && self.y2 >= other.y1
    }

    /// Closed-interval point containment.
    #[inline]
    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x1 && px <= self.x2 && py >= self.y1 && py <= self.y2
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Squared distance from the closest point on this rectangle to
    /// `(px, py)`. Zero when the point is inside.
    #[inline]
    pub fn distance_sq_to(&self, px: f64, py: f64) -> f64 {
        let cx = clamp(px, self.x1, self.x2);
        let cy = clamp(py, self.y1, self.y2);
        (px - cx) * (px - cx) + (py - cy) * (py - cy)
    }

    /// Whether this rectangle overlaps the circle at `center` with the
    /// given radius (closest-point-on-rect test, boundary inclusive).
    #[inline]
    pub fn overlaps_circle(&self, center: Point, radius: f64) -> bool {
        self.distance_sq_to(center.x, center.y) <= radius * radius
    }

    /// The bounding square of a circle, used to narrow circle queries
    /// through the rectangle tree before the exact distance filter.
    pub fn around_circle(center: Point, radius: f64) -> Self {
        Self {
            x1: center.x - radius,
            y1: center.y - radius,
            x2: center.x + radius,
            y2: center.y + radius,
        }
    }

    /// Tight box around a point list, expanded by `pad` on every side.
    ///
    /// Returns `None` for an empty list. With `pad > 0` a single-point or
    /// axis-aligned stroke still yields a valid (positive-extent) box.
    pub fn from_points(points: &[Point], pad: f64) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            bbox.x1 = bbox.x1.min(p.x);
            bbox.y1 = bbox.y1.min(p.y);
            bbox.x2 = bbox.x2.max(p.x);
            bbox.y2 = bbox.y2.max(p.y);
        }
        bbox.x1 -= pad;
        bbox.y1 -= pad;
        bbox.x2 += pad;
        bbox.y2 += pad;
        Some(bbox)
    }
}

#[inline]
fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}
