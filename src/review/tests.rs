use super::*;
use crate::bus::{
    AudioDetections, ConfigPublisher, DetectionPayload, DetectionPublisher, ManualEvent, ManualEventState,
    VideoDetections,
};
use crate::config::{CameraConfig, EdgewatchConfig, RecordConfig};
use crate::error::StoreError;
use crate::events::{EventBus, PipelineEvent};
use crate::frame::{frame_name, FrameTime};
use crate::frame_store::SharedFrameStore;
use crate::geometry::BoundingBox;
use crate::region::{DetectionRegion, RegionSource};
use crate::track::{ActionResult, IouTracker, ObjectTracker, TrackId, TrackedObjectSnapshot, TrackerSettings, ZoneSet};
use crate::detect::Detection;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct MemoryStore {
    records: Arc<Mutex<Vec<ReviewSegmentRecord>>>,
    cleared: Arc<AtomicUsize>,
    fail: bool,
}

impl SegmentStore for MemoryStore {
    fn upsert(&mut self, record: &ReviewSegmentRecord) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Write {
                path: "memory".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn clear_ongoing(&mut self) -> Result<(), StoreError> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    maintainer: ReviewSegmentMaintainer,
    events: broadcast::Receiver<PipelineEvent>,
    store: MemoryStore,
    frames: SharedFrameStore,
    config_publisher: ConfigPublisher,
    detection_publisher: DetectionPublisher,
    dir: TempDir,
}

fn camera(name: &str, alert_labels: &[&str]) -> CameraConfig {
    let mut camera = CameraConfig::default();
    camera.name = name.to_string();
    camera.ffmpeg.input = "rtsp://camera".to_string();
    camera.detect.width = 640;
    camera.detect.height = 360;
    camera.detect.fps = 1;
    camera.review.alerts.labels = alert_labels.iter().map(|l| l.to_string()).collect();
    camera
}

fn harness_with(cameras: Vec<CameraConfig>, store: MemoryStore) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EdgewatchConfig::default();
    config.paths.clips_dir = dir.path().to_path_buf();
    for camera in cameras {
        config.cameras.insert(camera.name.clone(), camera);
    }

    let bus = EventBus::new(1024);
    let events = bus.subscribe();
    let frames = SharedFrameStore::new();
    let config_publisher = ConfigPublisher::new();
    let detection_publisher = DetectionPublisher::new(64);
    let maintainer = ReviewSegmentMaintainer::new(
        &config,
        Box::new(store.clone()),
        bus,
        frames.clone(),
        config_publisher.subscribe("config/record/"),
        detection_publisher.subscribe(),
    );
    Harness {
        maintainer,
        events,
        store,
        frames,
        config_publisher,
        detection_publisher,
        dir,
    }
}

fn harness(alert_labels: &[&str]) -> Harness {
    harness_with(vec![camera("front", alert_labels)], MemoryStore::default())
}

fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<(ReviewEventKind, ReviewSegmentRecord)> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::Review { kind, after, .. } = event {
            out.push((kind, after));
        }
    }
    out
}

fn object(id: &str, label: &str, frame_time: FrameTime, zones: &[&str]) -> TrackedObjectSnapshot {
    let bbox = BoundingBox::new(100, 100, 200, 300);
    let zones: Vec<String> = zones.iter().map(|z| z.to_string()).collect();
    TrackedObjectSnapshot {
        id: id.to_string(),
        track_id: TrackId(1),
        label: label.to_string(),
        score: 0.9,
        computed_score: 0.9,
        bbox,
        estimate: bbox,
        area: bbox.area(),
        ratio: bbox.ratio(),
        region: BoundingBox::new(0, 0, 320, 320),
        frame_time,
        start_time: frame_time,
        motionless_count: 0,
        position_changes: 1,
        disappeared_count: 0,
        stationary: false,
        false_positive: false,
        current_zones: zones.clone(),
        entered_zones: zones,
        sub_label: None,
        action: None,
    }
}

fn video(camera: &str, frame_time: FrameTime, objects: Vec<TrackedObjectSnapshot>) -> DetectionPayload {
    DetectionPayload::Video(VideoDetections {
        camera: camera.to_string(),
        frame_time,
        objects,
        motion_boxes: Vec::new(),
        regions: Vec::new(),
    })
}

fn manual(frame_time: FrameTime, state: ManualEventState, end_time: Option<FrameTime>) -> DetectionPayload {
    manual_event("doorbell-1", frame_time, state, end_time)
}

fn manual_event(
    event_id: &str,
    frame_time: FrameTime,
    state: ManualEventState,
    end_time: Option<FrameTime>,
) -> DetectionPayload {
    DetectionPayload::Api(ManualEvent {
        camera: "front".to_string(),
        frame_time,
        event_id: event_id.to_string(),
        label: "doorbell".to_string(),
        state,
        end_time,
    })
}

fn store_frame(frames: &SharedFrameStore, camera: &CameraConfig, frame_time: FrameTime) {
    let shape = camera.frame_shape();
    let buffer = frames.create(&frame_name(&camera.name, frame_time), shape.yuv_size()).unwrap();
    buffer.write_once(&vec![90u8; shape.yuv_size()]).unwrap();
}

#[test]
fn test_person_seen_for_five_frames_ends_after_detection_grace() {
    let mut h = harness(&["car"]);
    let config = camera("front", &["car"]);
    store_frame(&h.frames, &config, 1.0);
    let mut tracker = IouTracker::new(TrackerSettings::from_camera(&config), ZoneSet::default());
    let person = BoundingBox::new(200, 100, 260, 300);

    let mut ended_at = None;
    for frame in 1..=40 {
        let frame_time = frame as FrameTime;
        let source = if frame == 1 { RegionSource::Motion } else { RegionSource::Tracked };
        let region = DetectionRegion::new(BoundingBox::new(80, 0, 400, 320), source);
        let detections = if frame <= 5 {
            vec![Detection::new("person", 0.9, person, region)]
        } else {
            Vec::new()
        };
        tracker.match_and_update(frame_time, &detections);
        h.maintainer.handle(video("front", frame_time, tracker.snapshots()));
        if ended_at.is_none() && frame > 1 && h.maintainer.open_segment("front").is_none() {
            ended_at = Some(frame_time);
        }
    }

    let events = drain(&mut h.events);
    let (kind, first) = &events[0];
    assert_eq!(*kind, ReviewEventKind::New);
    assert_eq!(first.start_time, 1.0);
    assert_eq!(first.severity, SeverityLevel::Detection);
    assert_eq!(first.data.objects, vec!["person".to_string()]);
    assert!(first.thumb_path.exists());

    let ends: Vec<_> = events.iter().filter(|(k, _)| *k == ReviewEventKind::End).collect();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].1.end_time, Some(5.0));
    assert_eq!(ended_at, Some(36.0));

    let records = h.store.records.lock();
    assert_eq!(records.last().unwrap().end_time, Some(5.0));
    assert_eq!(h.store.cleared.load(Ordering::SeqCst), 1);
}

#[test]
fn test_alert_is_not_downgraded_by_later_detection() {
    let mut config = camera("front", &["person"]);
    config.review.alerts.required_zones = vec!["porch".to_string()];
    let mut h = harness_with(vec![config], MemoryStore::default());

    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &["porch"])]));
    for frame in 2..50 {
        h.maintainer.handle(video("front", frame as FrameTime, Vec::new()));
    }
    h.maintainer.handle(video("front", 50.0, vec![object("c1", "car", 50.0, &[])]));

    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.severity, SeverityLevel::Alert);
    assert_eq!(segment.last_update, 50.0);
    assert_eq!(segment.detections.len(), 2);

    for frame in 51..=200 {
        h.maintainer.handle(video("front", frame as FrameTime, Vec::new()));
    }
    let events = drain(&mut h.events);
    assert!(events.iter().all(|(_, r)| r.severity == SeverityLevel::Alert));
    let (kind, last) = events.last().unwrap();
    assert_eq!(*kind, ReviewEventKind::End);
    assert_eq!(last.end_time, Some(50.0));
}

#[test]
fn test_person_outside_required_zone_is_only_a_detection() {
    let mut config = camera("front", &["person"]);
    config.review.alerts.required_zones = vec!["porch".to_string()];
    let mut h = harness_with(vec![config], MemoryStore::default());

    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &["street"])]));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.severity, SeverityLevel::Detection);

    // entering the zone later escalates
    h.maintainer.handle(video("front", 2.0, vec![object("p1", "person", 2.0, &["porch"])]));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.severity, SeverityLevel::Alert);
    assert_eq!(segment.zones, vec!["street".to_string(), "porch".to_string()]);
}

#[test]
fn test_manual_start_pins_segment_until_end() {
    let mut h = harness(&["person"]);
    h.maintainer.handle(manual(10.0, ManualEventState::Start, None));
    for frame in 11..200 {
        h.maintainer.handle(video("front", frame as FrameTime, Vec::new()));
        assert!(h.maintainer.open_segment("front").is_some(), "expired at {}", frame);
    }

    h.maintainer.handle(manual(200.0, ManualEventState::End, Some(200.0)));
    assert!(h.maintainer.open_segment("front").is_none());

    let events = drain(&mut h.events);
    assert_eq!(events.first().unwrap().0, ReviewEventKind::New);
    assert_eq!(events.first().unwrap().1.severity, SeverityLevel::Alert);
    let (kind, last) = events.last().unwrap();
    assert_eq!(*kind, ReviewEventKind::End);
    assert_eq!(last.end_time, Some(200.0));
    assert_eq!(last.data.detections, vec!["doorbell-1".to_string()]);
}

#[test]
fn test_manual_complete_sets_last_update() {
    let mut h = harness(&["person"]);
    h.maintainer.handle(manual(10.0, ManualEventState::Complete, Some(25.0)));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.last_update, 25.0);
    assert!(segment.pinned.is_empty());

    // grace counts from the end of the manual event
    h.maintainer.handle(video("front", 145.0, Vec::new()));
    assert!(h.maintainer.open_segment("front").is_some());
    h.maintainer.handle(video("front", 146.0, Vec::new()));
    assert!(h.maintainer.open_segment("front").is_none());
}

#[test]
fn test_manual_complete_releases_start_pin() {
    let mut h = harness(&["person"]);
    h.maintainer.handle(manual(10.0, ManualEventState::Start, None));
    h.maintainer.handle(manual(20.0, ManualEventState::Complete, Some(20.0)));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert!(segment.pinned.is_empty());
    assert_eq!(segment.last_update, 20.0);

    for frame in 21..=140 {
        h.maintainer.handle(video("front", frame as FrameTime, Vec::new()));
        assert!(h.maintainer.open_segment("front").is_some(), "expired at {}", frame);
    }
    h.maintainer.handle(video("front", 141.0, Vec::new()));
    assert!(h.maintainer.open_segment("front").is_none());

    let events = drain(&mut h.events);
    let (kind, last) = events.last().unwrap();
    assert_eq!(*kind, ReviewEventKind::End);
    assert_eq!(last.end_time, Some(20.0));
}

#[test]
fn test_unmatched_manual_end_is_ignored() {
    let mut h = harness(&["car"]);
    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &[])]));
    h.maintainer.handle(video("front", 2.0, vec![object("p1", "person", 2.0, &[])]));
    drain(&mut h.events);

    h.maintainer.handle(manual_event("never-started", 2.5, ManualEventState::End, Some(2.5)));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.last_update, 2.0);
    assert!(drain(&mut h.events).is_empty());

    // a pinned segment also survives an end for another id
    h.maintainer.handle(manual(3.0, ManualEventState::Start, None));
    h.maintainer.handle(manual_event("other", 4.0, ManualEventState::End, Some(4.0)));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert!(segment.pinned.contains("doorbell-1"));
}

#[test]
fn test_alert_and_detection_use_different_grace_windows() {
    let mut h = harness_with(
        vec![camera("alerting", &["person"]), camera("quiet", &[])],
        MemoryStore::default(),
    );
    let mut ended = std::collections::BTreeMap::new();

    for frame in 0..=200 {
        let frame_time = frame as FrameTime;
        for name in ["alerting", "quiet"] {
            let objects = if frame == 0 {
                vec![object(&format!("{}-p", name), "person", frame_time, &[])]
            } else {
                Vec::new()
            };
            h.maintainer.handle(video(name, frame_time, objects));
            if frame > 0 && h.maintainer.open_segment(name).is_none() {
                ended.entry(name).or_insert(frame_time);
            }
        }
    }

    assert_eq!(ended["alerting"], 121.0);
    assert_eq!(ended["quiet"], 31.0);
    let events = drain(&mut h.events);
    let severity_of = |camera: &str| {
        events
            .iter()
            .find(|(k, r)| *k == ReviewEventKind::New && r.camera == camera)
            .map(|(_, r)| r.severity)
    };
    assert_eq!(severity_of("alerting"), Some(SeverityLevel::Alert));
    assert_eq!(severity_of("quiet"), Some(SeverityLevel::Detection));
}

#[test]
fn test_inactive_objects_do_not_open_segments() {
    let mut h = harness(&["person"]);
    let mut stationary = object("a", "person", 1.0, &[]);
    stationary.stationary = true;
    let mut never_moved = object("b", "person", 1.0, &[]);
    never_moved.position_changes = 0;
    let mut false_positive = object("c", "person", 1.0, &[]);
    false_positive.false_positive = true;
    let stale = object("d", "person", 0.5, &[]);

    h.maintainer.handle(video("front", 1.0, vec![stationary, never_moved, false_positive, stale]));
    assert!(h.maintainer.open_segment("front").is_none());
    assert!(drain(&mut h.events).is_empty());
}

#[test]
fn test_sub_labels_and_attributes_in_detection_map() {
    let mut h = harness(&["person"]);
    let mut verified = object("p1", "person", 1.0, &[]);
    verified.sub_label = Some(("alice".to_string(), 0.9));
    let mut attribute = object("c1", "car", 1.0, &[]);
    attribute.sub_label = Some(("license_plate".to_string(), 0.8));

    h.maintainer.handle(video("front", 1.0, vec![verified, attribute]));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.detections["p1"], "person-verified");
    assert_eq!(segment.detections["c1"], "license_plate");
    assert!(segment.sub_labels.contains("alice"));
    assert!(!segment.sub_labels.contains("license_plate"));
}

#[test]
fn test_fall_action_escalates_to_alert() {
    let mut h = harness(&["car"]);
    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &[])]));
    assert_eq!(h.maintainer.open_segment("front").unwrap().severity, SeverityLevel::Detection);

    let mut fallen = object("p1", "person", 2.0, &["kitchen"]);
    fallen.action = Some(ActionResult {
        label: "fall".to_string(),
        score: 0.9,
    });
    h.maintainer.handle(video("front", 2.0, vec![fallen]));

    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.severity, SeverityLevel::Alert);
    assert_eq!(segment.detections["p1"], "fall");
    assert!(segment.sub_labels.contains("fall"));
    assert_eq!(segment.zones, vec!["kitchen".to_string()]);
    let events = drain(&mut h.events);
    assert_eq!(events.last().unwrap().0, ReviewEventKind::Update);
}

#[test]
fn test_low_scoring_action_is_ignored() {
    let mut h = harness(&["car"]);
    let mut unsure = object("p1", "person", 1.0, &[]);
    unsure.action = Some(ActionResult {
        label: "fall".to_string(),
        score: 0.2,
    });
    h.maintainer.handle(video("front", 1.0, vec![unsure]));
    assert_eq!(h.maintainer.open_segment("front").unwrap().severity, SeverityLevel::Detection);
}

#[test]
fn test_audio_opens_and_escalates_segments() {
    let mut h = harness(&["scream"]);
    let audio = |frame_time: FrameTime, labels: &[&str]| {
        DetectionPayload::Audio(AudioDetections {
            camera: "front".to_string(),
            frame_time,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        })
    };

    h.maintainer.handle(audio(1.0, &[]));
    assert!(h.maintainer.open_segment("front").is_none());

    h.maintainer.handle(audio(1.0, &["bark"]));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.severity, SeverityLevel::Detection);

    h.maintainer.handle(audio(3.0, &["scream"]));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert_eq!(segment.severity, SeverityLevel::Alert);
    assert_eq!(segment.last_update, 3.0);
    assert_eq!(
        segment.audio.iter().cloned().collect::<Vec<_>>(),
        vec!["bark".to_string(), "scream".to_string()]
    );

    let kinds: Vec<_> = drain(&mut h.events).into_iter().map(|(k, _)| k).collect();
    assert_eq!(kinds, vec![ReviewEventKind::New, ReviewEventKind::Update]);
}

#[test]
fn test_disabling_record_ends_segment_immediately() {
    let mut h = harness(&["person"]);
    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &[])]));
    assert!(h.maintainer.open_segment("front").is_some());

    h.config_publisher
        .publish("config/record/front", &RecordConfig { enabled: false })
        .unwrap();
    h.maintainer.apply_config_updates();
    h.maintainer.handle(video("front", 2.0, vec![object("p1", "person", 2.0, &[])]));

    assert!(h.maintainer.open_segment("front").is_none());
    let (kind, last) = drain(&mut h.events).pop().unwrap();
    assert_eq!(kind, ReviewEventKind::End);
    assert_eq!(last.end_time, Some(1.0));
}

#[test]
fn test_store_failures_do_not_stop_events() {
    let store = MemoryStore {
        fail: true,
        ..MemoryStore::default()
    };
    let mut h = harness_with(vec![camera("front", &["person"])], store);
    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &[])]));

    assert!(h.maintainer.open_segment("front").is_some());
    assert_eq!(drain(&mut h.events).len(), 1);
    assert!(h.store.records.lock().is_empty());
}

#[test]
fn test_missing_frame_still_emits_new_segment() {
    let mut h = harness(&["person"]);
    h.maintainer.handle(video("front", 1.0, vec![object("p1", "person", 1.0, &[])]));
    let segment = h.maintainer.open_segment("front").unwrap();
    assert!(!segment.has_thumbnail);
    assert_eq!(drain(&mut h.events).len(), 1);

    // the first quiet frame still in the store supplies a full-frame thumbnail
    let config = camera("front", &["person"]);
    store_frame(&h.frames, &config, 2.0);
    h.maintainer.handle(video("front", 2.0, Vec::new()));
    assert!(h.maintainer.open_segment("front").unwrap().has_thumbnail);
    assert_eq!(h.frames.open_views(&frame_name("front", 2.0)), 0);
    assert!(h.dir.path().join("review").exists());
}

#[test]
fn test_run_ends_open_segments_on_shutdown() {
    let h = harness(&["person"]);
    let Harness {
        maintainer,
        mut events,
        detection_publisher,
        ..
    } = h;
    let cancel = CancellationToken::new();
    let worker = {
        let cancel = cancel.clone();
        std::thread::spawn(move || maintainer.run(cancel))
    };

    detection_publisher.publish(video("front", 1.0, vec![object("p1", "person", 1.0, &[])]));
    let mut seen = Vec::new();
    for _ in 0..50 {
        seen.extend(drain(&mut events));
        if !seen.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cancel.cancel();
    worker.join().unwrap();
    seen.extend(drain(&mut events));

    let kinds: Vec<_> = seen.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![ReviewEventKind::New, ReviewEventKind::End]);
}

#[test]
fn test_run_exits_when_detection_feed_closes() {
    let h = harness(&["person"]);
    let Harness {
        maintainer,
        mut events,
        detection_publisher,
        ..
    } = h;
    let worker = std::thread::spawn(move || maintainer.run(CancellationToken::new()));

    detection_publisher.publish(manual(1.0, ManualEventState::Start, None));
    drop(detection_publisher);

    // never cancelled; the loop must notice the publishers are gone
    worker.join().unwrap();
    let kinds: Vec<_> = drain(&mut events).into_iter().map(|(k, _)| k).collect();
    assert_eq!(kinds, vec![ReviewEventKind::New, ReviewEventKind::End]);
}

#[test]
fn test_json_lines_store_replays_latest_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("review.jsonl");
    let mut store = JsonLinesSegmentStore::new(&path);
    let thumbs = dir.path().join("review");

    let mut finished = PendingReviewSegment::new("front", 1.0, SeverityLevel::Detection, &thumbs);
    store.upsert(&finished.get_data(false)).unwrap();
    finished.last_update = 4.0;
    store.upsert(&finished.get_data(true)).unwrap();
    let ongoing = PendingReviewSegment::new("back", 2.0, SeverityLevel::Alert, &thumbs);
    store.upsert(&ongoing.get_data(false)).unwrap();

    let records = JsonLinesSegmentStore::replay(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[&finished.id].end_time, Some(4.0));

    store.clear_ongoing().unwrap();
    let records = JsonLinesSegmentStore::replay(&path).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records.contains_key(&finished.id));
}

#[test]
fn test_segment_ids_and_thumb_paths_are_unique() {
    let dir = PathBuf::from("/tmp/review");
    let a = PendingReviewSegment::new("front", 1.0, SeverityLevel::Detection, &dir);
    let b = PendingReviewSegment::new("front", 1.0, SeverityLevel::Detection, &dir);
    assert_ne!(a.id, b.id);
    assert!(a.id.starts_with("1.000000-"));
    assert_ne!(a.thumb_path, b.thumb_path);
    assert!(a.thumb_path.to_string_lossy().contains("thumb-front-"));
}
