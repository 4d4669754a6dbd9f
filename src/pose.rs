//! Pose estimation and action classification for tracked people.
//!
//! Both models are external; requests and results carry the track id so
//! results are attached to the right track without comparing boxes.

use crate::config::PoseConfig;
use crate::frame::{FrameShape, FrameTime};
use crate::geometry::BoundingBox;
use crate::track::{ActionResult, Keypoints, ObjectTracker, TrackId};
use tracing::{debug, info};

/// Padding around a predicted box when the track was not detected this frame
const MISSED_BOX_PADDING: i32 = 20;

/// Score assumed for a box that comes from a prediction
const PREDICTED_SCORE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct PoseRequest {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseResult {
    pub track_id: TrackId,
    pub keypoints: Keypoints,
}

pub trait PoseEstimator: Send {
    /// Keypoints for each requested box of an I420 frame
    fn estimate(&mut self, frame: &[u8], shape: FrameShape, requests: &[PoseRequest]) -> Vec<PoseResult>;
}

pub trait ActionClassifier: Send {
    fn classify(&mut self, window: &[Keypoints], shape: FrameShape) -> Option<ActionResult>;
}

pub struct PoseCoordinator {
    config: PoseConfig,
    estimator: Box<dyn PoseEstimator>,
    classifier: Box<dyn ActionClassifier>,
}

impl PoseCoordinator {
    pub fn new(
        config: PoseConfig,
        estimator: Box<dyn PoseEstimator>,
        classifier: Box<dyn ActionClassifier>,
    ) -> Self {
        info!("Pose estimation enabled for {}", config.label);
        Self {
            config,
            estimator,
            classifier,
        }
    }

    /// Classify full keypoint windows, then estimate poses for this frame
    pub fn process(
        &mut self,
        frame: &[u8],
        shape: FrameShape,
        frame_time: FrameTime,
        tracker: &mut dyn ObjectTracker,
    ) {
        let requests: Vec<PoseRequest> = tracker
            .tracked_objects()
            .into_iter()
            .filter(|t| t.label == self.config.label)
            .map(|t| {
                if t.frame_time == frame_time {
                    PoseRequest {
                        track_id: t.track_id,
                        bbox: t.bbox,
                        score: t.score,
                    }
                } else {
                    let padded = t.bbox.union(&t.estimate);
                    PoseRequest {
                        track_id: t.track_id,
                        bbox: BoundingBox::new(
                            padded.x0 - MISSED_BOX_PADDING,
                            padded.y0 - MISSED_BOX_PADDING,
                            padded.x1 + MISSED_BOX_PADDING,
                            padded.y1 + MISSED_BOX_PADDING,
                        )
                        .clamp_to(shape.width, shape.height),
                        score: PREDICTED_SCORE,
                    }
                }
            })
            .collect();
        if requests.is_empty() {
            return;
        }

        for request in &requests {
            let Some(window) = tracker.keypoint_window(request.track_id) else {
                continue;
            };
            let start = window.len().saturating_sub(self.config.window);
            if let Some(action) = self.classifier.classify(&window[start..], shape) {
                debug!("Track {} classified as {} ({:.2})", request.track_id, action.label, action.score);
                tracker.set_action(request.track_id, action);
            }
        }

        for result in self.estimator.estimate(frame, shape, &requests) {
            tracker.update_pose_data(result.track_id, result.keypoints);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObjectsConfig, StationaryMaxFrames};
    use crate::detect::Detection;
    use crate::region::{DetectionRegion, RegionSource};
    use crate::track::{IouTracker, TrackerSettings, ZoneSet, KEYPOINT_HISTORY};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct EchoEstimator {
        seen: Arc<Mutex<Vec<PoseRequest>>>,
    }

    impl PoseEstimator for EchoEstimator {
        fn estimate(&mut self, _frame: &[u8], _shape: FrameShape, requests: &[PoseRequest]) -> Vec<PoseResult> {
            self.seen.lock().extend(requests.iter().cloned());
            // answer in reverse order; matching is by track id
            requests
                .iter()
                .rev()
                .map(|r| PoseResult {
                    track_id: r.track_id,
                    keypoints: vec![[r.bbox.x0 as f32, r.bbox.y0 as f32, 1.0]],
                })
                .collect()
        }
    }

    struct AlwaysFalls;

    impl ActionClassifier for AlwaysFalls {
        fn classify(&mut self, window: &[Keypoints], _shape: FrameShape) -> Option<ActionResult> {
            assert_eq!(window.len(), KEYPOINT_HISTORY);
            Some(ActionResult {
                label: "fall".to_string(),
                score: 0.8,
            })
        }
    }

    fn tracker() -> IouTracker {
        IouTracker::new(
            TrackerSettings {
                shape: FrameShape::new(640, 480),
                max_disappeared: 50,
                min_initialized: 0,
                stationary_threshold: 1000,
                max_frames: StationaryMaxFrames::default(),
                objects: ObjectsConfig::default(),
            },
            ZoneSet::default(),
        )
    }

    fn detection(label: &str, bbox: BoundingBox) -> Detection {
        Detection::new(
            label,
            0.9,
            bbox,
            DetectionRegion::new(BoundingBox::new(0, 0, 320, 320), RegionSource::Tracked),
        )
    }

    #[test]
    fn test_keypoints_follow_track_ids_and_full_window_is_classified() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pose = PoseCoordinator::new(
            PoseConfig::default(),
            Box::new(EchoEstimator { seen: seen.clone() }),
            Box::new(AlwaysFalls),
        );
        let shape = FrameShape::new(640, 480);
        let frame = vec![0u8; shape.yuv_size()];
        let mut t = tracker();
        let a = BoundingBox::new(10, 10, 110, 210);
        let b = BoundingBox::new(300, 10, 400, 210);

        for i in 0..KEYPOINT_HISTORY {
            let frame_time = i as f64;
            t.match_and_update(frame_time, &[detection("person", a), detection("person", b), detection("car", BoundingBox::new(500, 300, 600, 400))]);
            pose.process(&frame, shape, frame_time, &mut t);
        }

        let first = t.get(TrackId(1)).unwrap();
        assert_eq!(first.keypoints.len(), KEYPOINT_HISTORY);
        assert_eq!(first.keypoints[0][0][0], 10.0);
        assert_eq!(t.get(TrackId(2)).unwrap().keypoints[0][0][0], 300.0);
        assert!(t.get(TrackId(3)).unwrap().keypoints.is_empty());
        assert!(first.action.is_none());

        t.match_and_update(100.0, &[detection("person", a)]);
        pose.process(&frame, shape, 100.0, &mut t);
        assert_eq!(t.get(TrackId(1)).unwrap().action.as_ref().unwrap().label, "fall");

        // track 2 was missed, so its request uses a padded box and fixed score
        let last = seen.lock().iter().rev().find(|r| r.track_id == TrackId(2)).cloned().unwrap();
        assert_eq!(last.bbox, BoundingBox::new(280, 0, 420, 230));
        assert_eq!(last.score, PREDICTED_SCORE);
    }
}
