use super::{ReviewSegmentRecord, SegmentData, SeverityLevel};
use crate::config::ReviewTimingConfig;
use crate::frame::FrameTime;
use crate::track::TrackedObjectSnapshot;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// The open segment of a camera
#[derive(Debug, Clone)]
pub struct PendingReviewSegment {
    pub id: String,
    pub camera: String,
    pub start_time: FrameTime,
    pub last_update: FrameTime,
    pub severity: SeverityLevel,
    /// Object or event id to the label it is reviewed under
    pub detections: BTreeMap<String, String>,
    pub sub_labels: BTreeSet<String>,
    /// In the order they were first touched
    pub zones: Vec<String>,
    pub audio: BTreeSet<String>,
    pub thumb_path: PathBuf,
    pub has_thumbnail: bool,
    /// Active objects when the thumbnail was last refreshed
    pub frame_active_count: usize,
    /// Manual events holding the segment open
    pub pinned: BTreeSet<String>,
}

impl PendingReviewSegment {
    pub fn new(camera: &str, frame_time: FrameTime, severity: SeverityLevel, thumb_dir: &Path) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{:.6}-{}", frame_time, &suffix[..6]);
        let thumb_path = thumb_dir.join(format!("thumb-{}-{}.jpg", camera, id));
        Self {
            id,
            camera: camera.to_string(),
            start_time: frame_time,
            last_update: frame_time,
            severity,
            detections: BTreeMap::new(),
            sub_labels: BTreeSet::new(),
            zones: Vec::new(),
            audio: BTreeSet::new(),
            thumb_path,
            has_thumbnail: false,
            frame_active_count: 0,
            pinned: BTreeSet::new(),
        }
    }

    /// Raise the severity. Returns true when it changed.
    pub fn escalate(&mut self, severity: SeverityLevel) -> bool {
        let before = self.severity;
        self.severity = self.severity.max(severity);
        self.severity != before
    }

    pub fn touch(&mut self, frame_time: FrameTime) {
        if frame_time > self.last_update {
            self.last_update = frame_time;
        }
    }

    pub fn add_zones(&mut self, zones: &[String]) {
        for zone in zones {
            if !self.zones.contains(zone) {
                self.zones.push(zone.clone());
            }
        }
    }

    /// Add an object under the label it is reviewed as. Attribute sub-labels
    /// replace the label; other sub-labels verify it.
    pub fn record_object(&mut self, object: &TrackedObjectSnapshot) {
        let entry = match &object.sub_label {
            None => object.label.clone(),
            Some((sub_label, _)) if crate::detect::is_attribute_label(sub_label) => sub_label.clone(),
            Some((sub_label, _)) => {
                self.sub_labels.insert(sub_label.clone());
                format!("{}-verified", object.label)
            }
        };
        self.detections.insert(object.id.clone(), entry);
    }

    /// True once the segment saw no activity for its severity's grace window.
    /// Pinned segments never expire.
    pub fn is_expired(&self, frame_time: FrameTime, timing: &ReviewTimingConfig) -> bool {
        if !self.pinned.is_empty() {
            return false;
        }
        let grace = match self.severity {
            SeverityLevel::Alert => timing.alert_grace_secs,
            SeverityLevel::Detection => timing.detection_grace_secs,
        };
        frame_time > self.last_update + grace
    }

    pub fn get_data(&self, ended: bool) -> ReviewSegmentRecord {
        let objects: BTreeSet<&String> = self.detections.values().collect();
        ReviewSegmentRecord {
            id: self.id.clone(),
            camera: self.camera.clone(),
            start_time: self.start_time,
            end_time: ended.then_some(self.last_update),
            severity: self.severity,
            thumb_path: self.thumb_path.clone(),
            data: SegmentData {
                detections: self.detections.keys().cloned().collect(),
                objects: objects.into_iter().cloned().collect(),
                sub_labels: self.sub_labels.iter().cloned().collect(),
                zones: self.zones.clone(),
                audio: self.audio.iter().cloned().collect(),
            },
        }
    }
}
