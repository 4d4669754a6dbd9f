//! Object tracking across frames.
//!
//! Tracks live in an arena keyed by a stable numeric [`TrackId`]; each track
//! embeds its keypoint history so pose data never needs a back-pointer.

pub mod iou;
pub mod position;
pub mod zones;

use crate::config::{CameraConfig, ObjectsConfig, StationaryMaxFrames};
use crate::detect::Detection;
use crate::frame::{FrameShape, FrameTime};
use crate::geometry::BoundingBox;
use crate::region::DetectionRegion;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub use iou::IouTracker;
pub use position::StationaryPosition;
pub use zones::{Zone, ZoneSet};

/// Keypoint frames kept per track
pub const KEYPOINT_HISTORY: usize = 30;

/// Scores kept for the false-positive median
pub const SCORE_HISTORY: usize = 10;

/// One pose: `[x, y, confidence]` per keypoint
pub type Keypoints = Vec<[f32; 3]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Seen, but not yet for `min_initialized` frames
    New,
    Tracked,
    /// Motionless and clear of motion; skipped by region scheduling
    Stationary,
    /// Missed in recent frames
    Disappeared,
    Removed,
}

/// Classified activity for a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub label: String,
    pub score: f32,
}

/// Tracker settings derived from a camera's config
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub shape: FrameShape,
    pub max_disappeared: u32,
    pub min_initialized: u32,
    pub stationary_threshold: u32,
    pub max_frames: StationaryMaxFrames,
    pub objects: ObjectsConfig,
}

impl TrackerSettings {
    pub fn from_camera(camera: &CameraConfig) -> Self {
        Self {
            shape: camera.frame_shape(),
            max_disappeared: camera.detect.max_disappeared(),
            min_initialized: camera.detect.min_initialized(),
            stationary_threshold: camera.detect.stationary_threshold(),
            max_frames: camera.detect.stationary.max_frames.clone(),
            objects: camera.objects.clone(),
        }
    }

    fn track_threshold(&self, label: &str) -> f32 {
        self.objects
            .filters
            .get(label)
            .map(|f| f.threshold)
            .unwrap_or_else(|| crate::config::ObjectFilter::default().threshold)
    }
}

#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub track_id: TrackId,
    /// Externally visible id, unique across restarts
    pub id: String,
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
    /// Predicted box, equal to `bbox` right after a detection
    pub estimate: BoundingBox,
    velocity: (f32, f32),
    pub area: i64,
    pub ratio: f32,
    pub region: DetectionRegion,
    pub frame_time: FrameTime,
    pub start_time: FrameTime,
    pub motionless_count: u32,
    pub disappeared_count: u32,
    pub position_changes: u32,
    pub hits: u32,
    pub score_history: VecDeque<f32>,
    pub current_zones: Vec<String>,
    pub entered_zones: Vec<String>,
    pub keypoints: VecDeque<Keypoints>,
    pub sub_label: Option<(String, f32)>,
    pub false_positive: bool,
    pub state: TrackState,
    pub action: Option<ActionResult>,
    position: StationaryPosition,
}

impl TrackedObject {
    fn new(track_id: TrackId, detection: &Detection, frame_time: FrameTime, bounds: BoundingBox) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            track_id,
            id: format!("{:.6}-{}", frame_time, &suffix[..6]),
            label: detection.label.clone(),
            score: detection.score,
            bbox: detection.bbox,
            estimate: detection.bbox,
            velocity: (0.0, 0.0),
            area: detection.area,
            ratio: detection.ratio,
            region: detection.region,
            frame_time,
            start_time: frame_time,
            motionless_count: 0,
            disappeared_count: 0,
            position_changes: 0,
            hits: 1,
            score_history: VecDeque::from([detection.score]),
            current_zones: Vec::new(),
            entered_zones: Vec::new(),
            keypoints: VecDeque::with_capacity(KEYPOINT_HISTORY),
            sub_label: None,
            false_positive: true,
            state: TrackState::New,
            action: None,
            position: StationaryPosition::new(bounds),
        }
    }

    pub fn is_stationary(&self, threshold: u32) -> bool {
        self.motionless_count >= threshold
    }

    /// Median of recent scores
    pub fn computed_score(&self) -> f32 {
        let scores: Vec<f32> = self.score_history.iter().copied().collect();
        position::median(&scores)
    }

    /// The detection this track would produce if seen again unchanged
    pub fn as_detection(&self) -> Detection {
        Detection {
            label: self.label.clone(),
            score: self.score,
            bbox: self.bbox,
            area: self.area,
            ratio: self.ratio,
            region: self.region,
        }
    }

    pub fn snapshot(&self, stationary_threshold: u32) -> TrackedObjectSnapshot {
        TrackedObjectSnapshot {
            id: self.id.clone(),
            track_id: self.track_id,
            label: self.label.clone(),
            score: self.score,
            computed_score: self.computed_score(),
            bbox: self.bbox,
            estimate: self.estimate,
            area: self.area,
            ratio: self.ratio,
            region: self.region.bbox,
            frame_time: self.frame_time,
            start_time: self.start_time,
            motionless_count: self.motionless_count,
            position_changes: self.position_changes,
            disappeared_count: self.disappeared_count,
            stationary: self.is_stationary(stationary_threshold),
            false_positive: self.false_positive,
            current_zones: self.current_zones.clone(),
            entered_zones: self.entered_zones.clone(),
            sub_label: self.sub_label.clone(),
            action: self.action.clone(),
        }
    }
}

/// Serializable view of a track, published with every processed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObjectSnapshot {
    pub id: String,
    pub track_id: TrackId,
    pub label: String,
    pub score: f32,
    pub computed_score: f32,
    pub bbox: BoundingBox,
    pub estimate: BoundingBox,
    pub area: i64,
    pub ratio: f32,
    pub region: BoundingBox,
    pub frame_time: FrameTime,
    pub start_time: FrameTime,
    pub motionless_count: u32,
    pub position_changes: u32,
    pub disappeared_count: u32,
    pub stationary: bool,
    pub false_positive: bool,
    pub current_zones: Vec<String>,
    pub entered_zones: Vec<String>,
    pub sub_label: Option<(String, f32)>,
    pub action: Option<ActionResult>,
}

/// Per-camera tracker. Implementations are selected by `detect.tracker`.
pub trait ObjectTracker: Send {
    /// Full matching pass for a frame where detection ran
    fn match_and_update(&mut self, frame_time: FrameTime, detections: &[Detection]);

    /// Advance bookkeeping for a frame where no detection ran
    fn update_frame_times(&mut self, frame_time: FrameTime);

    /// Initialized tracks, in track id order
    fn tracked_objects(&self) -> Vec<&TrackedObject>;

    fn get(&self, track_id: TrackId) -> Option<&TrackedObject>;

    /// Boxes of detections whose tracks are not initialized yet
    fn untracked_object_boxes(&self) -> &[BoundingBox];

    /// Tracks to leave out of region scheduling this frame. Also moves
    /// tracks between `Tracked` and `Stationary`.
    fn stationary_object_ids(&mut self, motion_boxes: &[BoundingBox], motion_calibrating: bool) -> Vec<TrackId>;

    fn stationary_threshold(&self) -> u32;

    fn update_pose_data(&mut self, track_id: TrackId, keypoints: Keypoints);

    /// The full keypoint window of a track, if it has one
    fn keypoint_window(&self, track_id: TrackId) -> Option<Vec<Keypoints>>;

    fn set_action(&mut self, track_id: TrackId, action: ActionResult);

    fn set_sub_label(&mut self, track_id: TrackId, label: &str, score: f32);

    fn update_settings(&mut self, settings: TrackerSettings);

    /// Replace the zone polygons. Zones already entered are kept.
    fn update_zones(&mut self, zones: ZoneSet);

    fn snapshots(&self) -> Vec<TrackedObjectSnapshot> {
        let threshold = self.stationary_threshold();
        self.tracked_objects()
            .into_iter()
            .map(|t| t.snapshot(threshold))
            .collect()
    }
}

/// Build the tracker configured for a camera
pub fn create_tracker(camera: &CameraConfig) -> Box<dyn ObjectTracker> {
    match camera.detect.tracker {
        crate::config::TrackerKind::Iou => Box::new(IouTracker::new(
            TrackerSettings::from_camera(camera),
            ZoneSet::from_config(&camera.zones),
        )),
    }
}

#[cfg(test)]
mod tests;
