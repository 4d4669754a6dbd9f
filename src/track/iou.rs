use super::{
    ActionResult, Keypoints, ObjectTracker, TrackId, TrackState, TrackedObject, TrackerSettings,
    ZoneSet, KEYPOINT_HISTORY, SCORE_HISTORY,
};
use crate::detect::Detection;
use crate::frame::FrameTime;
use crate::geometry::BoundingBox;
use crate::region::RegionSource;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, trace};

/// Minimum overlap between a track's estimate and a detection to match
const MATCH_IOU: f32 = 0.1;

/// Center movement in pixels that counts as a position change
const POSITION_EPSILON: f32 = 5.0;

/// Weight of the previous velocity when blending in a new observation
const VELOCITY_SMOOTHING: f32 = 0.5;

/// Greedy IoU tracker.
///
/// Every frame, candidate (track, detection) pairs of the same label are
/// taken in order of decreasing IoU, ties going to the lower track id, and
/// each track and detection is used at most once.
pub struct IouTracker {
    settings: TrackerSettings,
    zones: ZoneSet,
    tracks: BTreeMap<TrackId, TrackedObject>,
    next_id: u64,
    untracked: Vec<BoundingBox>,
}

impl IouTracker {
    pub fn new(settings: TrackerSettings, zones: ZoneSet) -> Self {
        Self {
            settings,
            zones,
            tracks: BTreeMap::new(),
            next_id: 1,
            untracked: Vec::new(),
        }
    }

    /// Live tracks including uninitialized ones
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn register(&mut self, frame_time: FrameTime, detection: &Detection) -> TrackId {
        let track_id = TrackId(self.next_id);
        self.next_id += 1;

        let mut track = TrackedObject::new(track_id, detection, frame_time, self.settings.shape.bounds());
        // found through motion means it was moving when first seen
        if detection.region.source == RegionSource::Motion {
            track.position_changes = 1;
        }
        if self.settings.min_initialized == 0 {
            track.state = TrackState::Tracked;
        }
        refresh_zones(&mut track, &self.zones);
        refresh_false_positive(&mut track, &self.settings);

        debug!(
            "New track {} ({}) {} at {:?}",
            track.id, track_id, track.label, track.bbox
        );
        self.tracks.insert(track_id, track);
        track_id
    }

    fn remove(&mut self, track_id: TrackId, reason: &str) {
        if let Some(mut track) = self.tracks.remove(&track_id) {
            track.state = TrackState::Removed;
            debug!("Removed track {} ({}): {}", track.id, track.label, reason);
        }
    }

    fn apply_detections(&mut self, frame_time: FrameTime, assignments: Vec<(TrackId, Detection)>) {
        for (track_id, detection) in assignments {
            let Some(track) = self.tracks.get_mut(&track_id) else {
                continue;
            };
            if !apply_detection(track, &detection, frame_time, &self.settings, &self.zones) {
                self.remove(track_id, "stationary too long");
            }
        }
    }

    fn apply_misses(&mut self, missed: Vec<TrackId>) {
        for track_id in missed {
            let Some(track) = self.tracks.get_mut(&track_id) else {
                continue;
            };
            apply_miss(track, &self.settings);
            if track.state == TrackState::New {
                self.remove(track_id, "lost before initialization");
            } else if track.disappeared_count > self.settings.max_disappeared {
                self.remove(track_id, "disappeared");
            }
        }
    }

    fn refresh_untracked(&mut self) {
        self.untracked = self
            .tracks
            .values()
            .filter(|t| t.state == TrackState::New)
            .map(|t| t.bbox)
            .collect();
    }
}

impl ObjectTracker for IouTracker {
    fn match_and_update(&mut self, frame_time: FrameTime, detections: &[Detection]) {
        let mut pairs: Vec<(f32, TrackId, usize)> = Vec::new();
        for (track_id, track) in &self.tracks {
            for (index, detection) in detections.iter().enumerate() {
                if track.label != detection.label {
                    continue;
                }
                let iou = track.estimate.iou(&detection.bbox);
                if iou >= MATCH_IOU {
                    pairs.push((iou, *track_id, index));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut matched_tracks = HashSet::new();
        let mut matched_detections = vec![false; detections.len()];
        let mut assignments = Vec::new();
        for (_, track_id, index) in pairs {
            if matched_detections[index] || matched_tracks.contains(&track_id) {
                continue;
            }
            matched_tracks.insert(track_id);
            matched_detections[index] = true;
            assignments.push((track_id, detections[index].clone()));
        }

        let missed: Vec<TrackId> = self
            .tracks
            .keys()
            .filter(|id| !matched_tracks.contains(*id))
            .copied()
            .collect();

        self.apply_detections(frame_time, assignments);
        self.apply_misses(missed);
        for (detection, _) in detections.iter().zip(&matched_detections).filter(|(_, m)| !**m) {
            self.register(frame_time, detection);
        }
        self.refresh_untracked();
        trace!("{} tracks after frame {:.6}", self.tracks.len(), frame_time);
    }

    fn update_frame_times(&mut self, frame_time: FrameTime) {
        // objects seen last frame are assumed to still be there
        let (present, missed): (Vec<TrackId>, Vec<TrackId>) = self
            .tracks
            .keys()
            .copied()
            .partition(|id| self.tracks[id].disappeared_count == 0);
        let assignments = present
            .into_iter()
            .filter_map(|id| self.tracks.get(&id).map(|t| (id, t.as_detection())))
            .collect();
        self.apply_detections(frame_time, assignments);
        self.apply_misses(missed);
        self.refresh_untracked();
    }

    fn tracked_objects(&self) -> Vec<&TrackedObject> {
        self.tracks
            .values()
            .filter(|t| t.state != TrackState::New)
            .collect()
    }

    fn get(&self, track_id: TrackId) -> Option<&TrackedObject> {
        self.tracks.get(&track_id)
    }

    fn untracked_object_boxes(&self) -> &[BoundingBox] {
        &self.untracked
    }

    fn stationary_object_ids(&mut self, motion_boxes: &[BoundingBox], motion_calibrating: bool) -> Vec<TrackId> {
        let motion: &[BoundingBox] = if motion_calibrating { &[] } else { motion_boxes };
        let threshold = self.settings.stationary_threshold;
        let mut ids = Vec::new();
        for track in self.tracks.values_mut() {
            if track.state == TrackState::New {
                continue;
            }
            let stationary = track.motionless_count >= threshold
                && track.disappeared_count == 0
                && !track.bbox.intersects_any(motion);
            if stationary {
                track.state = TrackState::Stationary;
                ids.push(track.track_id);
            } else if track.state == TrackState::Stationary {
                track.state = TrackState::Tracked;
            }
        }
        ids
    }

    fn stationary_threshold(&self) -> u32 {
        self.settings.stationary_threshold
    }

    fn update_pose_data(&mut self, track_id: TrackId, keypoints: Keypoints) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.keypoints.push_back(keypoints);
            while track.keypoints.len() > KEYPOINT_HISTORY {
                track.keypoints.pop_front();
            }
        }
    }

    fn keypoint_window(&self, track_id: TrackId) -> Option<Vec<Keypoints>> {
        let track = self.tracks.get(&track_id)?;
        if track.keypoints.len() < KEYPOINT_HISTORY {
            return None;
        }
        Some(track.keypoints.iter().cloned().collect())
    }

    fn set_action(&mut self, track_id: TrackId, action: ActionResult) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.action = Some(action);
        }
    }

    fn set_sub_label(&mut self, track_id: TrackId, label: &str, score: f32) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            let better = track.sub_label.as_ref().map_or(true, |(_, s)| score > *s);
            if better {
                track.sub_label = Some((label.to_string(), score));
            }
        }
    }

    fn update_settings(&mut self, settings: TrackerSettings) {
        self.settings = settings;
    }

    fn update_zones(&mut self, zones: ZoneSet) {
        debug!("Tracker zones replaced");
        self.zones = zones;
    }
}

/// Update a matched track. Returns false when the track expired.
fn apply_detection(
    track: &mut TrackedObject,
    detection: &Detection,
    frame_time: FrameTime,
    settings: &TrackerSettings,
    zones: &ZoneSet,
) -> bool {
    let threshold = settings.stationary_threshold;
    let (old_x, old_y) = track.bbox.center();
    let (new_x, new_y) = detection.bbox.center();
    let frames = (track.disappeared_count + 1) as f32;
    track.velocity = (
        track.velocity.0 * VELOCITY_SMOOTHING + (new_x - old_x) / frames * (1.0 - VELOCITY_SMOOTHING),
        track.velocity.1 * VELOCITY_SMOOTHING + (new_y - old_y) / frames * (1.0 - VELOCITY_SMOOTHING),
    );

    let was_stationary = track.is_stationary(threshold);
    if track.position.update(detection.bbox, was_stationary) {
        track.motionless_count += 1;
        if is_expired(track, settings) {
            return false;
        }
    } else {
        track.motionless_count = 0;
        track.position.clear_history();
    }
    if (new_x - old_x).hypot(new_y - old_y) > POSITION_EPSILON {
        track.position_changes += 1;
    }

    track.score = detection.score;
    track.bbox = detection.bbox;
    track.estimate = detection.bbox;
    track.area = detection.area;
    track.ratio = detection.ratio;
    track.region = detection.region;
    track.frame_time = frame_time;
    track.disappeared_count = 0;
    track.hits += 1;
    track.score_history.push_back(detection.score);
    while track.score_history.len() > SCORE_HISTORY {
        track.score_history.pop_front();
    }

    track.state = match track.state {
        TrackState::New if track.hits <= settings.min_initialized => TrackState::New,
        TrackState::Stationary if track.is_stationary(threshold) => TrackState::Stationary,
        _ => TrackState::Tracked,
    };
    refresh_zones(track, zones);
    refresh_false_positive(track, settings);
    true
}

fn apply_miss(track: &mut TrackedObject, settings: &TrackerSettings) {
    track.disappeared_count += 1;
    if track.state != TrackState::New {
        track.state = TrackState::Disappeared;
    }

    let (dx, dy) = (track.velocity.0 as i32, track.velocity.1 as i32);
    let (w, h) = (settings.shape.width as i32, settings.shape.height as i32);
    let e = track.estimate;
    let predicted = BoundingBox::new(
        (e.x0 + dx).max(0),
        (e.y0 + dy).max(0),
        (e.x1 + dx).min(w - 1),
        (e.y1 + dy).min(h - 1),
    );
    // a prediction that left the frame is not worth keeping
    if predicted.x0 < predicted.x1 && predicted.y0 < predicted.y1 {
        track.estimate = predicted;
    }
}

fn is_expired(track: &TrackedObject, settings: &TrackerSettings) -> bool {
    match settings.max_frames.for_label(&track.label) {
        Some(max_frames) => track.motionless_count.saturating_sub(settings.stationary_threshold) > max_frames,
        None => false,
    }
}

fn refresh_zones(track: &mut TrackedObject, zones: &ZoneSet) {
    track.current_zones = zones.membership(&track.label, &track.bbox);
    for zone in &track.current_zones {
        if !track.entered_zones.contains(zone) {
            track.entered_zones.push(zone.clone());
        }
    }
}

/// Once a track's median score clears the label threshold it stays a true
/// positive.
fn refresh_false_positive(track: &mut TrackedObject, settings: &TrackerSettings) {
    if track.false_positive {
        track.false_positive = track.computed_score() < settings.track_threshold(&track.label);
    }
}
