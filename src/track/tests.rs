use super::position::{median, percentile};
use super::zones::point_in_polygon;
use super::*;
use crate::config::{ObjectsConfig, StationaryMaxFrames, ZoneConfig};
use crate::region::RegionSource;
use std::collections::BTreeMap;

fn settings() -> TrackerSettings {
    TrackerSettings {
        shape: FrameShape::new(1280, 720),
        max_disappeared: 3,
        min_initialized: 0,
        stationary_threshold: 5,
        max_frames: StationaryMaxFrames::default(),
        objects: ObjectsConfig::default(),
    }
}

fn det(label: &str, score: f32, bbox: BoundingBox, source: RegionSource) -> Detection {
    Detection::new(
        label,
        score,
        bbox,
        DetectionRegion::new(BoundingBox::new(0, 0, 320, 320), source),
    )
}

fn person(bbox: BoundingBox) -> Detection {
    det("person", 0.9, bbox, RegionSource::Tracked)
}

fn tracker() -> IouTracker {
    IouTracker::new(settings(), ZoneSet::default())
}

fn stepped(k: i32) -> BoundingBox {
    BoundingBox::new(100 + 30 * k, 100, 200 + 30 * k, 300)
}

#[test]
fn test_new_track_from_motion_counts_as_moved() {
    let mut t = tracker();
    t.match_and_update(
        1.0,
        &[det("person", 0.9, BoundingBox::new(10, 10, 60, 120), RegionSource::Motion)],
    );

    let objects = t.tracked_objects();
    assert_eq!(objects.len(), 1);
    let track = objects[0];
    assert_eq!(track.track_id, TrackId(1));
    assert!(track.id.starts_with("1.000000-"));
    assert_eq!(track.id.len(), "1.000000-".len() + 6);
    assert_eq!(track.position_changes, 1);
    assert_eq!(track.state, TrackState::Tracked);
    assert!(!track.false_positive);
    assert_eq!(track.start_time, 1.0);
}

#[test]
fn test_equal_overlap_goes_to_lowest_track_id() {
    let mut t = tracker();
    t.match_and_update(
        1.0,
        &[
            person(BoundingBox::new(100, 100, 200, 300)),
            person(BoundingBox::new(300, 100, 400, 300)),
        ],
    );
    t.match_and_update(2.0, &[person(BoundingBox::new(150, 100, 350, 300))]);

    let first = t.get(TrackId(1)).unwrap();
    let second = t.get(TrackId(2)).unwrap();
    assert_eq!(first.frame_time, 2.0);
    assert_eq!(first.disappeared_count, 0);
    assert_eq!(second.disappeared_count, 1);
    assert_eq!(second.state, TrackState::Disappeared);
}

#[test]
fn test_highest_overlap_wins_and_labels_never_cross() {
    let mut t = tracker();
    t.match_and_update(
        1.0,
        &[
            person(BoundingBox::new(100, 100, 200, 300)),
            person(BoundingBox::new(300, 100, 400, 300)),
        ],
    );
    t.match_and_update(
        2.0,
        &[
            person(BoundingBox::new(290, 100, 390, 300)),
            det("car", 0.9, BoundingBox::new(100, 100, 200, 300), RegionSource::Tracked),
        ],
    );

    assert_eq!(t.get(TrackId(2)).unwrap().frame_time, 2.0);
    assert_eq!(t.get(TrackId(1)).unwrap().disappeared_count, 1);
    let car = t.get(TrackId(3)).unwrap();
    assert_eq!(car.label, "car");
}

#[test]
fn test_track_removed_after_max_disappeared() {
    let mut t = tracker();
    t.match_and_update(1.0, &[person(BoundingBox::new(100, 100, 200, 300))]);
    for frame in 2..=4 {
        t.match_and_update(frame as f64, &[]);
        assert_eq!(t.tracked_objects().len(), 1, "frame {}", frame);
    }
    t.match_and_update(5.0, &[]);
    assert!(t.tracked_objects().is_empty());
    assert!(t.is_empty());
}

#[test]
fn test_motionless_track_becomes_stationary_until_motion_overlaps() {
    let mut t = tracker();
    let bbox = BoundingBox::new(100, 100, 200, 300);
    for frame in 1..=6 {
        t.match_and_update(frame as f64, &[person(bbox)]);
    }
    assert_eq!(t.get(TrackId(1)).unwrap().motionless_count, 5);

    let ids = t.stationary_object_ids(&[], false);
    assert_eq!(ids, vec![TrackId(1)]);
    assert_eq!(t.get(TrackId(1)).unwrap().state, TrackState::Stationary);
    assert!(t.snapshots()[0].stationary);

    let motion = [BoundingBox::new(150, 250, 260, 330)];
    assert!(t.stationary_object_ids(&motion, false).is_empty());
    assert_eq!(t.get(TrackId(1)).unwrap().state, TrackState::Tracked);

    // motion is ignored while the motion detector calibrates
    assert_eq!(t.stationary_object_ids(&motion, true), vec![TrackId(1)]);
}

#[test]
fn test_moving_track_never_settles() {
    let mut t = tracker();
    t.match_and_update(1.0, &[person(stepped(0))]);
    for k in 1..=8 {
        t.match_and_update(1.0 + k as f64, &[person(stepped(k))]);
        assert!(t.get(TrackId(1)).unwrap().motionless_count <= 1, "step {}", k);
    }
    let track = t.get(TrackId(1)).unwrap();
    assert_eq!(track.position_changes, 8);
    assert!(t.stationary_object_ids(&[], false).is_empty());
}

#[test]
fn test_stationary_track_expires_after_max_frames() {
    let mut s = settings();
    s.max_frames = StationaryMaxFrames {
        default: Some(3),
        objects: BTreeMap::new(),
    };
    let mut t = IouTracker::new(s, ZoneSet::default());
    let bbox = BoundingBox::new(100, 100, 200, 300);
    for frame in 1..=9 {
        t.match_and_update(frame as f64, &[person(bbox)]);
    }
    assert_eq!(t.get(TrackId(1)).unwrap().motionless_count, 8);
    t.match_and_update(10.0, &[person(bbox)]);
    assert!(t.get(TrackId(1)).is_none());
}

#[test]
fn test_update_frame_times_carries_present_tracks() {
    let mut t = tracker();
    t.match_and_update(1.0, &[person(BoundingBox::new(100, 100, 200, 300))]);
    t.update_frame_times(2.0);

    let track = t.get(TrackId(1)).unwrap();
    assert_eq!(track.frame_time, 2.0);
    assert_eq!(track.motionless_count, 1);
    assert_eq!(track.disappeared_count, 0);

    t.match_and_update(3.0, &[]);
    t.update_frame_times(4.0);
    let track = t.get(TrackId(1)).unwrap();
    assert_eq!(track.frame_time, 2.0);
    assert_eq!(track.disappeared_count, 2);
}

#[test]
fn test_uninitialized_tracks_stay_hidden() {
    let mut s = settings();
    s.min_initialized = 2;
    let mut t = IouTracker::new(s, ZoneSet::default());
    let bbox = BoundingBox::new(100, 100, 200, 300);

    t.match_and_update(1.0, &[person(bbox)]);
    assert!(t.tracked_objects().is_empty());
    assert_eq!(t.untracked_object_boxes(), &[bbox]);

    t.match_and_update(2.0, &[person(bbox)]);
    assert!(t.tracked_objects().is_empty());

    t.match_and_update(3.0, &[person(bbox)]);
    assert_eq!(t.tracked_objects().len(), 1);
    assert!(t.untracked_object_boxes().is_empty());

    // a flicker that is never confirmed is dropped on its first miss
    t.match_and_update(4.0, &[person(bbox), person(BoundingBox::new(800, 100, 900, 300))]);
    assert_eq!(t.len(), 2);
    t.match_and_update(5.0, &[person(bbox)]);
    assert_eq!(t.len(), 1);
}

#[test]
fn test_zone_membership_follows_bottom_center() {
    let mut zones = BTreeMap::new();
    zones.insert(
        "driveway".to_string(),
        ZoneConfig {
            coordinates: vec![(0, 400), (640, 400), (640, 720), (0, 720)],
            objects: Vec::new(),
        },
    );
    zones.insert(
        "street".to_string(),
        ZoneConfig {
            coordinates: vec![(0, 400), (640, 400), (640, 720), (0, 720)],
            objects: vec!["car".to_string()],
        },
    );
    let mut t = IouTracker::new(settings(), ZoneSet::from_config(&zones));

    t.match_and_update(1.0, &[person(BoundingBox::new(100, 300, 200, 500))]);
    let track = t.get(TrackId(1)).unwrap();
    assert_eq!(track.current_zones, vec!["driveway".to_string()]);

    t.match_and_update(2.0, &[person(BoundingBox::new(100, 200, 200, 380))]);
    let track = t.get(TrackId(1)).unwrap();
    assert!(track.current_zones.is_empty());
    assert_eq!(track.entered_zones, vec!["driveway".to_string()]);
}

#[test]
fn test_replaced_zones_apply_from_next_update() {
    let mut t = IouTracker::new(settings(), ZoneSet::default());
    let bbox = BoundingBox::new(100, 300, 200, 500);
    t.match_and_update(1.0, &[person(bbox)]);
    assert!(t.get(TrackId(1)).unwrap().current_zones.is_empty());

    let mut zones = BTreeMap::new();
    zones.insert(
        "yard".to_string(),
        ZoneConfig {
            coordinates: vec![(0, 400), (640, 400), (640, 720), (0, 720)],
            objects: Vec::new(),
        },
    );
    t.update_zones(ZoneSet::from_config(&zones));
    t.match_and_update(2.0, &[person(bbox)]);
    let track = t.get(TrackId(1)).unwrap();
    assert_eq!(track.current_zones, vec!["yard".to_string()]);
    assert_eq!(track.entered_zones, vec!["yard".to_string()]);
}

#[test]
fn test_keypoint_history_is_a_bounded_window() {
    let mut t = tracker();
    t.match_and_update(1.0, &[person(BoundingBox::new(100, 100, 200, 300))]);
    let id = TrackId(1);

    for i in 0..KEYPOINT_HISTORY - 1 {
        t.update_pose_data(id, vec![[i as f32, 0.0, 1.0]]);
    }
    assert!(t.keypoint_window(id).is_none());

    for i in KEYPOINT_HISTORY - 1..KEYPOINT_HISTORY + 5 {
        t.update_pose_data(id, vec![[i as f32, 0.0, 1.0]]);
    }
    let window = t.keypoint_window(id).unwrap();
    assert_eq!(window.len(), KEYPOINT_HISTORY);
    assert_eq!(window[0][0][0], 5.0);
    assert_eq!(window[KEYPOINT_HISTORY - 1][0][0], (KEYPOINT_HISTORY + 4) as f32);

    // unknown ids are ignored
    t.update_pose_data(TrackId(99), vec![[0.0, 0.0, 0.0]]);
    assert!(t.keypoint_window(TrackId(99)).is_none());
}

#[test]
fn test_false_positive_clears_once_median_passes() {
    let mut t = tracker();
    let bbox = BoundingBox::new(100, 100, 200, 300);
    t.match_and_update(1.0, &[det("person", 0.5, bbox, RegionSource::Tracked)]);
    assert!(t.get(TrackId(1)).unwrap().false_positive);

    t.match_and_update(2.0, &[det("person", 0.9, bbox, RegionSource::Tracked)]);
    t.match_and_update(3.0, &[det("person", 0.9, bbox, RegionSource::Tracked)]);
    assert!(!t.get(TrackId(1)).unwrap().false_positive);

    for frame in 4..=12 {
        t.match_and_update(frame as f64, &[det("person", 0.3, bbox, RegionSource::Tracked)]);
    }
    let track = t.get(TrackId(1)).unwrap();
    assert!(track.computed_score() < 0.7);
    assert!(!track.false_positive);
}

#[test]
fn test_sub_label_keeps_best_score_and_action_is_stored() {
    let mut t = tracker();
    t.match_and_update(1.0, &[person(BoundingBox::new(100, 100, 200, 300))]);
    t.set_sub_label(TrackId(1), "alice", 0.8);
    t.set_sub_label(TrackId(1), "bob", 0.6);
    t.set_action(
        TrackId(1),
        ActionResult {
            label: "fall".to_string(),
            score: 0.9,
        },
    );

    let snapshot = &t.snapshots()[0];
    assert_eq!(snapshot.sub_label, Some(("alice".to_string(), 0.8)));
    assert_eq!(snapshot.action.as_ref().map(|a| a.label.as_str()), Some("fall"));
}

#[test]
fn test_estimate_follows_velocity_and_stays_in_frame() {
    let mut t = tracker();
    t.match_and_update(1.0, &[person(BoundingBox::new(1000, 100, 1200, 300))]);
    t.match_and_update(2.0, &[person(BoundingBox::new(1060, 100, 1260, 300))]);
    t.match_and_update(3.0, &[]);

    let track = t.get(TrackId(1)).unwrap();
    assert!(track.estimate.x0 > 1060);
    assert!(track.estimate.x1 <= 1279);
    assert_eq!(track.bbox, BoundingBox::new(1060, 100, 1260, 300));
}

#[test]
fn test_percentiles_and_median() {
    assert_eq!(percentile(&[0, 10], 15.0), 1);
    assert_eq!(percentile(&[4, 1, 3, 2], 50.0), 2);
    assert_eq!(percentile(&[7], 85.0), 7);
    assert_eq!(median(&[0.9, 0.5, 0.9]), 0.9);
    assert!((median(&[0.2, 0.4]) - 0.3).abs() < 1e-6);
    assert_eq!(median(&[]), 0.0);
}

#[test]
fn test_point_in_polygon() {
    let triangle = [(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)];
    assert!(point_in_polygon((10.0, 10.0), &triangle));
    assert!(!point_in_polygon((90.0, 90.0), &triangle));
    assert!(!point_in_polygon((10.0, 10.0), &triangle[..2]));
}
