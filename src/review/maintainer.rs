use super::{
    PendingReviewSegment, ReviewEventKind, ReviewSegmentRecord, SegmentStore, SeverityLevel, ThumbnailWriter,
};
use crate::bus::{
    AudioDetections, ConfigSubscriber, DetectionPayload, DetectionSubscriber, ManualEvent, ManualEventState,
    VideoDetections,
};
use crate::config::{CameraConfig, EdgewatchConfig, RecordConfig, ReviewTimingConfig};
use crate::events::{EventBus, PipelineEvent};
use crate::frame::{frame_name, FrameTime};
use crate::frame_store::SharedFrameStore;
use crate::geometry::{enclosing, BoundingBox};
use crate::review::crop_16_9;
use crate::track::TrackedObjectSnapshot;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Turns per-frame detections into review segments.
///
/// Runs on its own thread: it polls record config updates, then waits up to a
/// second for the next detection payload.
pub struct ReviewSegmentMaintainer {
    cameras: BTreeMap<String, CameraConfig>,
    timing: ReviewTimingConfig,
    segments: HashMap<String, PendingReviewSegment>,
    store: Box<dyn SegmentStore>,
    events: EventBus,
    frames: SharedFrameStore,
    thumbnails: ThumbnailWriter,
    config_updates: ConfigSubscriber,
    detections: DetectionSubscriber,
}

impl ReviewSegmentMaintainer {
    pub fn new(
        config: &EdgewatchConfig,
        mut store: Box<dyn SegmentStore>,
        events: EventBus,
        frames: SharedFrameStore,
        config_updates: ConfigSubscriber,
        detections: DetectionSubscriber,
    ) -> Self {
        let thumbnails = ThumbnailWriter::new(&config.paths.clips_dir, config.review.thumbnail_height);
        if let Err(e) = thumbnails.ensure_dir() {
            warn!("Cannot create thumbnail directory {}: {}", thumbnails.dir().display(), e);
        }
        if let Err(e) = store.clear_ongoing() {
            warn!("Failed to clear ongoing review segments: {}", e);
        }

        Self {
            cameras: config.cameras.clone(),
            timing: config.review.clone(),
            segments: HashMap::new(),
            store,
            events,
            frames,
            thumbnails,
            config_updates,
            detections,
        }
    }

    pub fn open_segment(&self, camera: &str) -> Option<&PendingReviewSegment> {
        self.segments.get(camera)
    }

    /// Process payloads until cancelled or every publisher is gone, then end
    /// every open segment
    pub fn run(mut self, cancel: CancellationToken) {
        info!("Review segment maintainer started");
        while !cancel.is_cancelled() {
            self.apply_config_updates();
            match self.detections.get_data(POLL_TIMEOUT) {
                Ok(Some(payload)) => self.handle(payload),
                Ok(None) => {}
                Err(e) => {
                    warn!("Review maintainer lost its detection feed: {}", e);
                    break;
                }
            }
        }
        self.end_all();
        info!("Exiting review maintainer");
    }

    /// Apply pending `config/record/<camera>` updates
    pub fn apply_config_updates(&mut self) {
        while let Some((topic, record)) = self.config_updates.check_for_update::<RecordConfig>() {
            let camera = topic.rsplit('/').next().unwrap_or_default();
            match self.cameras.get_mut(camera) {
                Some(config) => {
                    info!("Recording on {} is now {}", camera, if record.enabled { "enabled" } else { "disabled" });
                    config.record = record;
                }
                None => debug!("Record update for unknown camera {}", camera),
            }
        }
    }

    pub fn handle(&mut self, payload: DetectionPayload) {
        let camera = payload.camera().to_string();
        let Some(config) = self.cameras.get(&camera).cloned() else {
            debug!("Ignoring detections for unknown camera {}", camera);
            return;
        };

        if !config.record.enabled {
            if let Some(segment) = self.segments.remove(&camera) {
                info!("Recording disabled on {}, ending segment {}", camera, segment.id);
                let before = segment.get_data(false);
                self.end_segment(segment, before);
            }
            return;
        }

        let current = self.segments.remove(&camera);
        let kept = match (current, payload) {
            (Some(segment), DetectionPayload::Video(video)) => self.update_existing(segment, &config, &video),
            (Some(segment), DetectionPayload::Audio(audio)) => Some(self.update_audio(segment, &config, &audio)),
            (Some(segment), DetectionPayload::Api(event)) => self.update_manual(segment, &event),
            (None, DetectionPayload::Video(video)) => self.check_if_new(&config, &video),
            (None, DetectionPayload::Audio(audio)) => self.new_from_audio(&config, &audio),
            (None, DetectionPayload::Api(event)) => self.new_from_manual(&config, &event),
        };
        if let Some(segment) = kept {
            self.segments.insert(camera, segment);
        }
    }

    /// End every open segment. Used at shutdown.
    pub fn end_all(&mut self) {
        let segments: Vec<PendingReviewSegment> = self.segments.drain().map(|(_, s)| s).collect();
        for segment in segments {
            let before = segment.get_data(false);
            self.end_segment(segment, before);
        }
    }

    fn update_existing(
        &mut self,
        mut segment: PendingReviewSegment,
        config: &CameraConfig,
        video: &VideoDetections,
    ) -> Option<PendingReviewSegment> {
        let frame_time = video.frame_time;
        let active = active_objects(config, frame_time, &video.objects);
        let before = segment.get_data(false);

        if !active.is_empty() {
            segment.touch(frame_time);
            let mut changed = false;
            for object in &active {
                segment.record_object(object);
                if qualifies_for_alert(config, object) {
                    changed |= segment.escalate(SeverityLevel::Alert);
                }
                segment.add_zones(&object.current_zones);
            }
            changed |= apply_actions(&mut segment, config, &video.objects);

            if active.len() > segment.frame_active_count {
                changed = true;
            }
            if changed {
                let boxes: Vec<BoundingBox> = active.iter().map(|o| o.bbox).collect();
                self.refresh_thumbnail(&mut segment, config, frame_time, &boxes);
                segment.frame_active_count = active.len();
                self.emit(ReviewEventKind::Update, before, segment.get_data(false));
            }
            return Some(segment);
        }

        if !segment.has_thumbnail && self.refresh_thumbnail(&mut segment, config, frame_time, &[]) {
            let after = segment.get_data(false);
            self.emit(ReviewEventKind::Update, before.clone(), after);
        }

        if segment.is_expired(frame_time, &self.timing) {
            self.end_segment(segment, before);
            return None;
        }
        Some(segment)
    }

    fn check_if_new(&mut self, config: &CameraConfig, video: &VideoDetections) -> Option<PendingReviewSegment> {
        let frame_time = video.frame_time;
        let active = active_objects(config, frame_time, &video.objects);
        if active.is_empty() {
            return None;
        }

        let mut severity = None;
        for object in &active {
            if qualifies_for_alert(config, object) {
                severity = Some(SeverityLevel::Alert);
            } else if severity.is_none() && qualifies_for_detection(config, object) {
                severity = Some(SeverityLevel::Detection);
            }
        }

        let mut segment = PendingReviewSegment::new(
            &config.name,
            frame_time,
            severity.unwrap_or(SeverityLevel::Detection),
            self.thumbnails.dir(),
        );
        for object in &active {
            segment.record_object(object);
            segment.add_zones(&object.current_zones);
        }
        if apply_actions(&mut segment, config, &video.objects) {
            severity = Some(SeverityLevel::Alert);
        }
        if severity.is_none() {
            return None;
        }

        let boxes: Vec<BoundingBox> = active.iter().map(|o| o.bbox).collect();
        self.refresh_thumbnail(&mut segment, config, frame_time, &boxes);
        segment.frame_active_count = active.len();

        let data = segment.get_data(false);
        self.emit(ReviewEventKind::New, data.clone(), data);
        Some(segment)
    }

    fn update_audio(
        &mut self,
        mut segment: PendingReviewSegment,
        config: &CameraConfig,
        audio: &AudioDetections,
    ) -> PendingReviewSegment {
        if audio.labels.is_empty() {
            return segment;
        }
        let before = segment.get_data(false);
        segment.touch(audio.frame_time);
        for label in &audio.labels {
            if config.review.alerts.labels.contains(label) {
                segment.audio.insert(label.clone());
                segment.escalate(SeverityLevel::Alert);
            } else if detection_label(config, label) {
                segment.audio.insert(label.clone());
            }
        }
        let after = segment.get_data(false);
        if after != before {
            self.emit(ReviewEventKind::Update, before, after);
        }
        segment
    }

    fn new_from_audio(&mut self, config: &CameraConfig, audio: &AudioDetections) -> Option<PendingReviewSegment> {
        let mut severity = None;
        let mut heard = Vec::new();
        for label in &audio.labels {
            if config.review.alerts.labels.contains(label) {
                heard.push(label.clone());
                severity = Some(SeverityLevel::Alert);
            } else if detection_label(config, label) {
                heard.push(label.clone());
                severity = severity.or(Some(SeverityLevel::Detection));
            }
        }

        let mut segment = PendingReviewSegment::new(&config.name, audio.frame_time, severity?, self.thumbnails.dir());
        segment.audio.extend(heard);
        let data = segment.get_data(false);
        self.emit(ReviewEventKind::New, data.clone(), data);
        Some(segment)
    }

    fn update_manual(&mut self, mut segment: PendingReviewSegment, event: &ManualEvent) -> Option<PendingReviewSegment> {
        let before = segment.get_data(false);
        let end_time = event.end_time.unwrap_or(event.frame_time);
        match event.state {
            ManualEventState::Complete => {
                // a complete also releases a pin taken by the matching start
                segment.pinned.remove(&event.event_id);
                segment.detections.insert(event.event_id.clone(), event.label.clone());
                segment.escalate(SeverityLevel::Alert);
                segment.last_update = end_time;
            }
            ManualEventState::Start => {
                segment.pinned.insert(event.event_id.clone());
                segment.detections.insert(event.event_id.clone(), event.label.clone());
                segment.escalate(SeverityLevel::Alert);
            }
            ManualEventState::End => {
                if !segment.pinned.remove(&event.event_id) {
                    debug!(
                        "Ignoring end of unknown manual event {} on {}",
                        event.event_id, segment.camera
                    );
                    return Some(segment);
                }
                segment.last_update = end_time;
                if segment.pinned.is_empty() {
                    self.end_segment(segment, before);
                    return None;
                }
            }
        }
        let after = segment.get_data(false);
        self.emit(ReviewEventKind::Update, before, after);
        Some(segment)
    }

    fn new_from_manual(&mut self, config: &CameraConfig, event: &ManualEvent) -> Option<PendingReviewSegment> {
        if event.state == ManualEventState::End {
            debug!("Manual event {} ended with no open segment on {}", event.event_id, config.name);
            return None;
        }

        let mut segment =
            PendingReviewSegment::new(&config.name, event.frame_time, SeverityLevel::Alert, self.thumbnails.dir());
        segment.detections.insert(event.event_id.clone(), event.label.clone());
        match event.state {
            ManualEventState::Start => {
                segment.pinned.insert(event.event_id.clone());
            }
            ManualEventState::Complete => {
                segment.last_update = event.end_time.unwrap_or(event.frame_time);
            }
            ManualEventState::End => {}
        }
        let data = segment.get_data(false);
        self.emit(ReviewEventKind::New, data.clone(), data);
        Some(segment)
    }

    /// Write the segment thumbnail from the frame at `frame_time`. Returns
    /// false when the frame is gone or the image could not be written.
    fn refresh_thumbnail(
        &self,
        segment: &mut PendingReviewSegment,
        config: &CameraConfig,
        frame_time: FrameTime,
        boxes: &[BoundingBox],
    ) -> bool {
        if !config.snapshots.thumbnails {
            return false;
        }
        let shape = config.frame_shape();
        let name = frame_name(&config.name, frame_time);
        let view = match self.frames.get(&name, shape.yuv_dims()) {
            Ok(view) => view,
            Err(e) => {
                debug!("No thumbnail for segment {}: {}", segment.id, e);
                return false;
            }
        };

        let area = enclosing(boxes)
            .and_then(|b| crop_16_9(shape, b))
            .unwrap_or_else(|| shape.bounds());
        let result = self.thumbnails.write(&segment.thumb_path, &view.data(), shape, area);
        drop(view);
        self.frames.close(&name);

        match result {
            Ok(()) => {
                segment.has_thumbnail = true;
                true
            }
            Err(e) => {
                warn!("Failed to write thumbnail {}: {}", segment.thumb_path.display(), e);
                false
            }
        }
    }

    fn end_segment(&mut self, segment: PendingReviewSegment, before: ReviewSegmentRecord) {
        let after = segment.get_data(true);
        self.emit(ReviewEventKind::End, before, after);
    }

    fn emit(&mut self, kind: ReviewEventKind, before: ReviewSegmentRecord, after: ReviewSegmentRecord) {
        if let Err(e) = self.store.upsert(&after) {
            warn!("Failed to persist review segment {}: {}", after.id, e);
        }
        self.events.publish(PipelineEvent::Review { kind, before, after });
    }
}

/// Objects that count as activity on this frame: moving, seen now, real,
/// and of a label the camera reviews.
pub fn active_objects<'a>(
    config: &CameraConfig,
    frame_time: FrameTime,
    objects: &'a [TrackedObjectSnapshot],
) -> Vec<&'a TrackedObjectSnapshot> {
    objects
        .iter()
        .filter(|o| {
            !o.stationary
                && o.position_changes > 0
                && o.frame_time == frame_time
                && !o.false_positive
                && (config.review.alerts.labels.contains(&o.label) || detection_label(config, &o.label))
        })
        .collect()
}

fn detection_label(config: &CameraConfig, label: &str) -> bool {
    match &config.review.detections.labels {
        None => true,
        Some(labels) => labels.iter().any(|l| l == label),
    }
}

fn in_required_zones(required: &[String], current: &[String]) -> bool {
    required.is_empty() || current.iter().any(|zone| required.contains(zone))
}

fn qualifies_for_alert(config: &CameraConfig, object: &TrackedObjectSnapshot) -> bool {
    config.review.alerts.labels.contains(&object.label)
        && in_required_zones(&config.review.alerts.required_zones, &object.current_zones)
}

fn qualifies_for_detection(config: &CameraConfig, object: &TrackedObjectSnapshot) -> bool {
    detection_label(config, &object.label)
        && in_required_zones(&config.review.detections.required_zones, &object.current_zones)
}

/// Escalate on the configured alert action. Returns true when the segment
/// changed.
fn apply_actions(segment: &mut PendingReviewSegment, config: &CameraConfig, objects: &[TrackedObjectSnapshot]) -> bool {
    let pose = &config.pose;
    let mut changed = false;
    for object in objects {
        let Some(action) = &object.action else {
            continue;
        };
        if action.label != pose.alert_action || action.score < pose.min_action_score {
            continue;
        }
        changed |= segment.escalate(SeverityLevel::Alert);
        let previous = segment.detections.insert(object.id.clone(), action.label.clone());
        changed |= previous.as_deref() != Some(action.label.as_str());
        changed |= segment.sub_labels.insert(action.label.clone());
        segment.add_zones(&object.current_zones);
    }
    changed
}
