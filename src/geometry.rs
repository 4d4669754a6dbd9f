use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates covering the half-open ranges
/// `x0..x1` and `y0..y1`: the `x0`/`y0` edges are inclusive and the `x1`/`y1`
/// edges exclusive. Width is `x1 - x0`, and boxes sharing an edge do not
/// intersect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BoundingBox {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y1 - self.y0).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Width divided by height, 0 for degenerate boxes
    pub fn ratio(&self) -> f32 {
        if self.height() == 0 {
            0.0
        } else {
            self.width() as f32 / self.height() as f32
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x0 + self.x1) as f32 / 2.0,
            (self.y0 + self.y1) as f32 / 2.0,
        )
    }

    /// Point used for zone membership: the middle of the bottom edge
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) as f32 / 2.0, self.y1 as f32)
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        let x1 = self.x1.min(other.x1);
        let y1 = self.y1.min(other.y1);
        if x1 <= x0 || y1 <= y0 {
            None
        } else {
            Some(BoundingBox { x0, y0, x1, y1 })
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersects_any(&self, others: &[BoundingBox]) -> bool {
        others.iter().any(|o| self.intersects(o))
    }

    /// Whether `self` lies entirely within `outer`
    pub fn is_inside(&self, outer: &BoundingBox) -> bool {
        self.x0 >= outer.x0 && self.y0 >= outer.y0 && self.x1 <= outer.x1 && self.y1 <= outer.y1
    }

    pub fn is_inside_any(&self, others: &[BoundingBox]) -> bool {
        others.iter().any(|o| self.is_inside(o))
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = match self.intersection(other) {
            Some(inter) => inter.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }

    /// Smallest box containing both
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Clamp the box into a `width` x `height` frame
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as i32, height as i32);
        BoundingBox {
            x0: self.x0.clamp(0, w),
            y0: self.y0.clamp(0, h),
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
        }
    }
}

/// Smallest box enclosing every box in the slice
pub fn enclosing(boxes: &[BoundingBox]) -> Option<BoundingBox> {
    let mut iter = boxes.iter();
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, b| acc.union(b)))
}
