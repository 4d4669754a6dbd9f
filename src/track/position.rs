use crate::geometry::BoundingBox;
use std::collections::VecDeque;

/// Average IoU below which an object is moving, no further checks
pub const THRESHOLD_KNOWN_ACTIVE_IOU: f32 = 0.2;
/// IoU a stationary object must keep to stay stationary
pub const THRESHOLD_STATIONARY_CHECK_IOU: f32 = 0.6;
/// IoU an active object must reach to count as motionless
pub const THRESHOLD_ACTIVE_CHECK_IOU: f32 = 0.9;
pub const MAX_STATIONARY_HISTORY: usize = 10;

/// Where an object has been sitting, estimated from its recent boxes.
///
/// The position box is the 15th/85th percentile envelope of up to ten
/// boxes observed since the object last moved, so a single jittery
/// detection does not reset it.
#[derive(Debug, Clone)]
pub struct StationaryPosition {
    history: VecDeque<BoundingBox>,
    xmins: Vec<i32>,
    ymins: Vec<i32>,
    xmaxs: Vec<i32>,
    ymaxs: Vec<i32>,
    position: BoundingBox,
}

impl StationaryPosition {
    pub fn new(bounds: BoundingBox) -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_STATIONARY_HISTORY + 1),
            xmins: Vec::new(),
            ymins: Vec::new(),
            xmaxs: Vec::new(),
            ymaxs: Vec::new(),
            position: bounds,
        }
    }

    pub fn position(&self) -> BoundingBox {
        self.position
    }

    /// Feed a new box. Returns true when the object is still at its
    /// position, false when it moved (the position restarts at `bbox`).
    pub fn update(&mut self, bbox: BoundingBox, stationary: bool) -> bool {
        self.history.push_back(bbox);
        while self.history.len() > MAX_STATIONARY_HISTORY {
            self.history.pop_front();
        }

        let history: Vec<BoundingBox> = self.history.iter().copied().collect();
        let avg_iou = bbox.iou(&average_boxes(&history));
        if avg_iou < THRESHOLD_KNOWN_ACTIVE_IOU {
            self.restart_at(bbox);
            return false;
        }

        let threshold = if stationary {
            THRESHOLD_STATIONARY_CHECK_IOU
        } else {
            THRESHOLD_ACTIVE_CHECK_IOU
        };
        if avg_iou < threshold {
            // median filters out single outliers
            let median_iou = self.position.iou(&median_of_boxes(&history));
            if median_iou < threshold {
                self.restart_at(bbox);
                return false;
            }
        }

        if self.xmins.len() < MAX_STATIONARY_HISTORY {
            self.xmins.push(bbox.x0);
            self.ymins.push(bbox.y0);
            self.xmaxs.push(bbox.x1);
            self.ymaxs.push(bbox.y1);
            self.position = BoundingBox::new(
                percentile(&self.xmins, 15.0),
                percentile(&self.ymins, 15.0),
                percentile(&self.xmaxs, 85.0),
                percentile(&self.ymaxs, 85.0),
            );
        }
        true
    }

    /// Forget the box history after the object moved
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn restart_at(&mut self, bbox: BoundingBox) {
        self.xmins = vec![bbox.x0];
        self.ymins = vec![bbox.y0];
        self.xmaxs = vec![bbox.x1];
        self.ymaxs = vec![bbox.y1];
        self.position = bbox;
    }
}

pub fn average_boxes(boxes: &[BoundingBox]) -> BoundingBox {
    if boxes.is_empty() {
        return BoundingBox::new(0, 0, 0, 0);
    }
    let n = boxes.len() as i64;
    let sum = |f: fn(&BoundingBox) -> i32| boxes.iter().map(|b| f(b) as i64).sum::<i64>();
    BoundingBox::new(
        (sum(|b| b.x0) / n) as i32,
        (sum(|b| b.y0) / n) as i32,
        (sum(|b| b.x1) / n) as i32,
        (sum(|b| b.y1) / n) as i32,
    )
}

pub fn median_of_boxes(boxes: &[BoundingBox]) -> BoundingBox {
    let pick = |f: fn(&BoundingBox) -> i32| {
        let values: Vec<i32> = boxes.iter().map(f).collect();
        percentile(&values, 50.0)
    };
    BoundingBox::new(pick(|b| b.x0), pick(|b| b.y0), pick(|b| b.x1), pick(|b| b.y1))
}

/// Linearly interpolated percentile, truncated to whole pixels
pub fn percentile(values: &[i32], pct: f32) -> i32 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = (pct / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f32;
    let value = sorted[lower] as f32 + (sorted[upper] - sorted[lower]) as f32 * fraction;
    value as i32
}

/// Median of float scores, 0 when empty
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
