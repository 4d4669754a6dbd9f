use super::RegionDetector;
use crate::bus::{
    ConfigSubscriber, DetectionPayload, DetectionPublisher, InterProcessRequestor,
    VideoDetections, REGION_GRID_TOPIC,
};
use crate::config::{CameraConfig, DetectConfig, ModelConfig, ZoneConfig};
use crate::detect::{attribute_applies, filter_detections, is_attribute_label, reduce_detections, Detection};
use crate::frame::{frame_name, FrameShape, FrameTime};
use crate::frame_store::{FrameRetention, SharedFrameStore};
use crate::geometry::BoundingBox;
use crate::metrics::{CameraMetrics, EventsPerSecond};
use crate::motion::{FrameDeltaMotionDetector, MotionDetector};
use crate::pose::PoseCoordinator;
use crate::region::{
    min_region_size, DetectionRegion, RegionGrid, RegionGridRequest, RegionScheduler, SchedulerInputs,
};
use crate::track::{create_tracker, ObjectTracker, TrackId, TrackerSettings, ZoneSet};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Longest wait for the next frame before checking for shutdown
const FRAME_WAIT: Duration = Duration::from_secs(1);

/// Same-label detections overlapping more than this are one object
const CONSOLIDATE_IOU: f32 = 0.5;

/// Channels and shared state a processor is wired to
pub struct ProcessorLinks {
    pub store: SharedFrameStore,
    pub frames: Receiver<FrameTime>,
    pub publisher: DetectionPublisher,
    /// Subscribed to the camera's detect config topic
    pub config_updates: ConfigSubscriber,
    /// Subscribed to the camera's zones topic
    pub zone_updates: ConfigSubscriber,
    pub metrics: Arc<CameraMetrics>,
}

/// The processing loop of one camera. Frames arrive by timestamp on a
/// bounded queue and are handled strictly in order.
pub struct CameraProcessor {
    camera: CameraConfig,
    shape: FrameShape,
    store: SharedFrameStore,
    frames: Receiver<FrameTime>,
    detector: Box<dyn RegionDetector>,
    motion: Box<dyn MotionDetector>,
    tracker: Box<dyn ObjectTracker>,
    scheduler: RegionScheduler,
    pose: Option<PoseCoordinator>,
    publisher: DetectionPublisher,
    config_updates: ConfigSubscriber,
    zone_updates: ConfigSubscriber,
    grid_source: Option<InterProcessRequestor>,
    metrics: Arc<CameraMetrics>,
    retention: FrameRetention,
    process_fps: EventsPerSecond,
    stationary_counter: u32,
    frames_since_grid_sync: u64,
}

impl CameraProcessor {
    pub fn new(
        camera: CameraConfig,
        model: &ModelConfig,
        detector: Box<dyn RegionDetector>,
        links: ProcessorLinks,
    ) -> Self {
        let shape = camera.frame_shape();
        let scheduler = RegionScheduler::new(
            &camera.name,
            shape,
            min_region_size(model.width, model.height),
            camera.detect.region_policy,
            camera.detect.rescan_after_secs,
            RegionGrid::new(),
        );
        let motion: Box<dyn MotionDetector> =
            Box::new(FrameDeltaMotionDetector::new(shape, camera.motion.clone()));
        let tracker = create_tracker(&camera);

        Self {
            shape,
            store: links.store,
            frames: links.frames,
            detector,
            motion,
            tracker,
            scheduler,
            pose: None,
            publisher: links.publisher,
            config_updates: links.config_updates,
            zone_updates: links.zone_updates,
            grid_source: None,
            metrics: links.metrics,
            retention: FrameRetention::new(camera.frame_retention),
            process_fps: EventsPerSecond::new(),
            stationary_counter: 0,
            frames_since_grid_sync: 0,
            camera,
        }
    }

    pub fn with_motion_detector(mut self, motion: Box<dyn MotionDetector>) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn ObjectTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_pose(mut self, pose: PoseCoordinator) -> Self {
        self.pose = Some(pose);
        self
    }

    /// Fetch the stored region grid and keep it in sync from now on. The
    /// startup scan is re-seeded from the fetched grid.
    pub fn with_grid_source(mut self, requestor: InterProcessRequestor) -> Self {
        let request = RegionGridRequest {
            camera: self.camera.name.clone(),
            grid: None,
        };
        match requestor.send_data::<_, RegionGrid>(REGION_GRID_TOPIC, &request) {
            Ok(grid) => {
                info!(
                    "{}: loaded region grid with {} samples",
                    self.camera.name,
                    grid.sample_count()
                );
                self.scheduler = RegionScheduler::new(
                    &self.camera.name,
                    self.shape,
                    self.scheduler.min_size(),
                    self.camera.detect.region_policy,
                    self.camera.detect.rescan_after_secs,
                    grid,
                );
            }
            Err(e) => warn!("{}: starting with an empty region grid: {}", self.camera.name, e),
        }
        self.grid_source = Some(requestor);
        self
    }

    pub fn name(&self) -> &str {
        &self.camera.name
    }

    pub fn tracker(&self) -> &dyn ObjectTracker {
        self.tracker.as_ref()
    }

    /// Process frames until cancelled or the capture side goes away
    pub fn run(mut self, cancel: CancellationToken) {
        info!("{}: processing started", self.camera.name);
        self.process_fps.start();

        while !cancel.is_cancelled() {
            self.apply_config_updates();

            let frame_time = match self.frames.recv_timeout(FRAME_WAIT) {
                Ok(frame_time) => frame_time,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("{}: frame queue closed", self.camera.name);
                    break;
                }
            };
            self.process_frame(frame_time);
        }

        self.shutdown();
    }

    /// Take in any detect or zone config published for this camera
    pub fn apply_config_updates(&mut self) {
        while let Some((topic, mut detect)) = self.config_updates.check_for_update::<DetectConfig>() {
            if detect.width != self.shape.width || detect.height != self.shape.height {
                warn!(
                    "{}: detect size changes need a restart, keeping {}x{}",
                    self.camera.name, self.shape.width, self.shape.height
                );
                detect.width = self.shape.width;
                detect.height = self.shape.height;
            }
            info!("{}: applying detect config from {}", self.camera.name, topic);
            self.camera.detect = detect;
            self.scheduler.set_policy(self.camera.detect.region_policy);
            self.tracker.update_settings(TrackerSettings::from_camera(&self.camera));
        }

        while let Some((topic, zones)) = self
            .zone_updates
            .check_for_update::<BTreeMap<String, ZoneConfig>>()
        {
            info!("{}: applying {} zones from {}", self.camera.name, zones.len(), topic);
            self.camera.zones = zones;
            self.tracker.update_zones(ZoneSet::from_config(&self.camera.zones));
        }
    }

    /// Run one frame through the pipeline. Returns what was published, or
    /// `None` when the frame was no longer in the store.
    pub fn process_frame(&mut self, frame_time: FrameTime) -> Option<VideoDetections> {
        let name = frame_name(&self.camera.name, frame_time);
        let view = match self.store.get(&name, self.shape.yuv_dims()) {
            Ok(view) => view,
            Err(e) => {
                warn!("{}: skipping frame {:.6}: {}", self.camera.name, frame_time, e);
                return None;
            }
        };

        let data = view.data();
        let frame: &[u8] = &data;

        let (motion_boxes, calibrating) = if self.camera.motion.enabled {
            (self.motion.detect(frame), self.motion.is_calibrating())
        } else {
            (Vec::new(), false)
        };

        let regions = if self.camera.detect.enabled {
            self.detect_objects(frame, frame_time, &motion_boxes, calibrating)
        } else {
            self.tracker.match_and_update(frame_time, &[]);
            Vec::new()
        };

        if let Some(pose) = self.pose.as_mut() {
            pose.process(frame, self.shape, frame_time, self.tracker.as_mut());
        }
        drop(data);
        drop(view);
        self.store.close(&name);

        let detections = VideoDetections {
            camera: self.camera.name.clone(),
            frame_time,
            objects: self.tracker.snapshots(),
            motion_boxes,
            regions: regions.iter().map(|r| r.bbox).collect(),
        };
        self.publisher.publish(DetectionPayload::Video(detections.clone()));

        if let Some(expired) = self.retention.push(name) {
            self.store.delete(&expired);
        }
        self.update_metrics();
        self.maybe_sync_grid();
        Some(detections)
    }

    fn detect_objects(
        &mut self,
        frame: &[u8],
        frame_time: FrameTime,
        motion_boxes: &[BoundingBox],
        calibrating: bool,
    ) -> Vec<DetectionRegion> {
        let interval = self.camera.detect.stationary_interval();
        let stationary_ids: Vec<TrackId> = if interval > 0 && self.stationary_counter >= interval {
            // re-check every stationary object once per interval
            self.stationary_counter = 0;
            Vec::new()
        } else {
            self.stationary_counter = self.stationary_counter.saturating_add(1);
            self.tracker.stationary_object_ids(motion_boxes, calibrating)
        };

        let threshold = self.tracker.stationary_threshold();
        let mut object_boxes: Vec<BoundingBox> = self
            .tracker
            .tracked_objects()
            .into_iter()
            .filter(|t| !stationary_ids.contains(&t.track_id))
            .map(|t| {
                if t.motionless_count < threshold {
                    t.estimate
                } else {
                    t.bbox
                }
            })
            .collect();
        object_boxes.extend_from_slice(self.tracker.untracked_object_boxes());

        let regions = self.scheduler.schedule(
            frame_time,
            SchedulerInputs {
                object_boxes: &object_boxes,
                motion_boxes,
                motion_calibrating: calibrating,
            },
        );

        let mut found = Vec::new();
        for region in &regions {
            match self.detector.detect_region(frame, self.shape, *region) {
                Ok(detections) => found.extend(detections),
                Err(e) => warn!(
                    "{}: no detections for region {:?} at {:.6}: {}",
                    self.camera.name, region.bbox, frame_time, e
                ),
            }
        }
        let (attributes, objects): (Vec<Detection>, Vec<Detection>) =
            filter_detections(found, &self.camera.objects)
                .into_iter()
                .partition(|d| is_attribute_label(&d.label));
        let fresh: Vec<BoundingBox> = objects.iter().map(|d| d.bbox).collect();

        // stationary objects are not re-detected but must not go missing
        let mut detections: Vec<Detection> = stationary_ids
            .iter()
            .filter_map(|id| self.tracker.get(*id))
            .map(|t| t.as_detection())
            .collect();
        detections.extend(objects);
        let detections = reduce_detections(detections, CONSOLIDATE_IOU);

        if regions.is_empty() {
            self.tracker.update_frame_times(frame_time);
        } else {
            self.tracker.match_and_update(frame_time, &detections);
        }
        self.assign_attributes(&attributes);
        self.scheduler.record_detections(frame_time, &fresh);

        trace!(
            "{}: {:.6} motion={} regions={} detections={} stationary={}",
            self.camera.name,
            frame_time,
            motion_boxes.len(),
            regions.len(),
            detections.len(),
            stationary_ids.len()
        );
        regions
    }

    /// Give each tracked object the best attribute found inside its box
    fn assign_attributes(&mut self, attributes: &[Detection]) {
        if attributes.is_empty() {
            return;
        }
        let best: Vec<(TrackId, String, f32)> = self
            .tracker
            .tracked_objects()
            .into_iter()
            .filter_map(|t| {
                attributes
                    .iter()
                    .filter(|a| attribute_applies(&t.label, &a.label) && a.bbox.is_inside(&t.bbox))
                    .max_by(|a, b| a.score.total_cmp(&b.score))
                    .map(|a| (t.track_id, a.label.clone(), a.score))
            })
            .collect();
        for (track_id, label, score) in best {
            self.tracker.set_sub_label(track_id, &label, score);
        }
    }

    fn update_metrics(&mut self) {
        self.process_fps.update();
        self.metrics.process_fps.store(self.process_fps.eps());
        self.metrics.detection_fps.store(self.detector.detection_fps());
        self.metrics.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn maybe_sync_grid(&mut self) {
        let every = self.camera.detect.grid_refresh_frames;
        if every == 0 || self.grid_source.is_none() {
            return;
        }
        self.frames_since_grid_sync += 1;
        if self.frames_since_grid_sync >= every {
            self.frames_since_grid_sync = 0;
            self.sync_grid();
        }
    }

    /// Store the learned grid and take back whatever is stored
    fn sync_grid(&mut self) {
        let Some(requestor) = self.grid_source.as_ref() else {
            return;
        };
        let request = RegionGridRequest {
            camera: self.camera.name.clone(),
            grid: Some(self.scheduler.grid().clone()),
        };
        match requestor.send_data::<_, RegionGrid>(REGION_GRID_TOPIC, &request) {
            Ok(grid) => {
                debug!("{}: region grid synced", self.camera.name);
                self.scheduler.set_grid(grid);
            }
            Err(e) => warn!("{}: region grid sync failed: {}", self.camera.name, e),
        }
    }

    /// Release every frame this processor still owns
    fn shutdown(mut self) {
        let mut released = 0;
        while let Ok(frame_time) = self.frames.try_recv() {
            if self.store.delete(&frame_name(&self.camera.name, frame_time)) {
                released += 1;
            }
        }
        for name in self.retention.drain() {
            if self.store.delete(&name) {
                released += 1;
            }
        }
        self.sync_grid();
        self.detector.close();
        info!(
            "{}: processing stopped, released {} frames",
            self.camera.name, released
        );
    }
}
