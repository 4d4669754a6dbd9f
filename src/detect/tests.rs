use super::backend::{decode_result, decode_rows, encode_result, encode_rows};
use super::client::rescale;
use super::*;
use crate::config::{DetectorConfig, ModelConfig, ObjectFilter, ObjectsConfig};
use crate::error::DetectError;
use crate::frame::FrameShape;
use crate::frame_store::SharedFrameStore;
use crate::geometry::BoundingBox;
use crate::region::{DetectionRegion, RegionSource};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backend returning a fixed answer after an optional delay
struct ScriptedDetector {
    answer: Vec<RawDetection>,
    delay: Duration,
}

impl ObjectDetector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn detect_raw(&mut self, tensor: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>, DetectError> {
        assert_eq!(tensor.len(), (width * height * 3) as usize);
        std::thread::sleep(self.delay);
        Ok(self.answer.clone())
    }
}

/// Backend whose answer and latency come from the tensor: byte 0 is the
/// delay in tenths of a second, byte 1 the class id
struct EchoDetector;

impl ObjectDetector for EchoDetector {
    fn name(&self) -> &str {
        "echo"
    }

    fn detect_raw(&mut self, tensor: &[u8], _width: u32, _height: u32) -> Result<Vec<RawDetection>, DetectError> {
        std::thread::sleep(Duration::from_millis(tensor[0] as u64 * 100));
        Ok(vec![raw(tensor[1] as u32, 0.9, [0.0, 0.0, 0.5, 0.5])])
    }
}

fn small_model() -> ModelConfig {
    ModelConfig {
        width: 16,
        height: 16,
        ..ModelConfig::default()
    }
}

fn raw(class_id: u32, score: f32, rel: [f32; 4]) -> RawDetection {
    RawDetection {
        class_id,
        score,
        y_min: rel[0],
        x_min: rel[1],
        y_max: rel[2],
        x_max: rel[3],
    }
}

fn start_pool(answer: Vec<RawDetection>, delay: Duration) -> (DetectorProcess, DetectionQueue, DetectionSignals, SharedFrameStore) {
    let store = SharedFrameStore::new();
    let queue = DetectionQueue::new(4);
    let signals = DetectionSignals::new();
    let factory: DetectorFactory = Arc::new(move || {
        Ok(Box::new(ScriptedDetector {
            answer: answer.clone(),
            delay,
        }) as Box<dyn ObjectDetector>)
    });
    let process = DetectorProcess::new(
        "test",
        &DetectorConfig::default(),
        &small_model(),
        factory,
        queue.clone(),
        signals.clone(),
        store.clone(),
        CancellationToken::new(),
    );
    process.start_or_restart().unwrap();
    (process, queue, signals, store)
}

#[test]
fn test_rows_round_trip_and_pad() {
    let rows = [raw(2, 0.9, [0.1, 0.2, 0.3, 0.4])];
    let bytes = encode_rows(&rows, 20);
    assert_eq!(bytes.len(), output_buffer_size(20));
    let decoded = decode_rows(&bytes);
    assert_eq!(decoded.len(), 20);
    assert_eq!(decoded[0], rows[0]);
    assert_eq!(decoded[1].score, 0.0);
}

#[test]
fn test_worker_drops_low_scores_and_client_maps_labels() {
    let (process, queue, signals, store) = start_pool(
        vec![
            raw(0, 0.8, [0.0, 0.0, 0.5, 0.5]),
            raw(2, 0.3, [0.5, 0.5, 1.0, 1.0]),
        ],
        Duration::ZERO,
    );
    let mut client = DetectionClient::new(
        "front",
        &small_model(),
        20,
        queue,
        &signals,
        store.clone(),
        Duration::from_secs(2),
    )
    .unwrap();

    let result = client.detect(&vec![0u8; 16 * 16 * 3]).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].0, "person");
    assert!((result[0].1 - 0.8).abs() < 1e-6);

    client.close();
    process.stop(Duration::from_secs(2));
    assert!(store.is_empty());
    assert!(!process.is_alive());
}

#[test]
fn test_detect_region_rescales_into_frame() {
    let (process, queue, signals, store) = start_pool(
        vec![raw(0, 0.9, [0.25, 0.25, 0.75, 0.75])],
        Duration::ZERO,
    );
    let mut client = DetectionClient::new("front", &small_model(), 20, queue, &signals, store, Duration::from_secs(2))
        .unwrap();

    let shape = FrameShape::new(64, 48);
    let frame = vec![0u8; shape.yuv_size()];
    let region = DetectionRegion::new(BoundingBox::new(8, 8, 40, 40), RegionSource::Motion);
    let detections = client.detect_region(&frame, shape, region).unwrap();

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].bbox, BoundingBox::new(16, 16, 32, 32));
    assert_eq!(detections[0].region, region);
    assert_eq!(detections[0].area, 256);
    process.stop(Duration::from_secs(2));
}

#[test]
fn test_slow_detector_times_out_and_reports_busy() {
    let (process, queue, signals, store) = start_pool(Vec::new(), Duration::from_millis(500));
    let mut client = DetectionClient::new(
        "front",
        &small_model(),
        20,
        queue,
        &signals,
        store,
        Duration::from_millis(50),
    )
    .unwrap();

    let err = client.detect(&vec![0u8; 16 * 16 * 3]).unwrap_err();
    assert!(matches!(err, DetectError::Timeout { .. }));
    std::thread::sleep(Duration::from_millis(100));
    assert!(process.detection_start() > 0.0);
    process.stop(Duration::from_secs(2));
}

#[test]
fn test_late_result_is_not_returned_for_next_request() {
    let store = SharedFrameStore::new();
    let queue = DetectionQueue::new(4);
    let signals = DetectionSignals::new();
    let factory: DetectorFactory = Arc::new(|| Ok(Box::new(EchoDetector) as Box<dyn ObjectDetector>));
    let process = DetectorProcess::new(
        "echo",
        &DetectorConfig::default(),
        &small_model(),
        factory,
        queue.clone(),
        signals.clone(),
        store.clone(),
        CancellationToken::new(),
    );
    process.start_or_restart().unwrap();
    let mut client = DetectionClient::new(
        "front",
        &small_model(),
        20,
        queue,
        &signals,
        store,
        Duration::from_millis(600),
    )
    .unwrap();

    // 700ms of work against a 600ms timeout, answering "person"
    let mut slow = vec![0u8; 16 * 16 * 3];
    slow[0] = 7;
    slow[1] = 0;
    let err = client.detect(&slow).unwrap_err();
    assert!(matches!(err, DetectError::Timeout { .. }));

    // the first job finishes while this one waits; its answer must not leak
    let mut fast = vec![0u8; 16 * 16 * 3];
    fast[0] = 1;
    fast[1] = 2;
    let result = client.detect(&fast).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].0, "car");

    client.close();
    process.stop(Duration::from_secs(2));
}

#[test]
fn test_signals_track_the_current_job() {
    let signals = DetectionSignals::new();
    let signal = signals.register("front");
    assert!(!signals.is_current("back", 0));

    signal.latest.store(3, std::sync::atomic::Ordering::Release);
    assert!(signals.is_current("front", 3));
    assert!(!signals.is_current("front", 2));

    assert!(signals.notify("front", 2));
    assert!(signals.notify("front", 3));
    assert!(!signals.notify("back", 3));
    assert_eq!(signal.completions.try_recv().unwrap(), 2);
    assert_eq!(signal.completions.try_recv().unwrap(), 3);
}

#[test]
fn test_result_header_carries_job_sequence() {
    let rows = [raw(1, 0.5, [0.0, 0.0, 1.0, 1.0])];
    let bytes = encode_result(42, &rows, 3);
    assert_eq!(bytes.len(), output_buffer_size(3));
    let (seq, decoded) = decode_result(&bytes).unwrap();
    assert_eq!(seq, 42);
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0], rows[0]);
    assert!(decode_result(&bytes[..8]).is_none());
}

#[test]
fn test_wrong_tensor_size_is_rejected() {
    let (process, queue, signals, store) = start_pool(Vec::new(), Duration::ZERO);
    let mut client = DetectionClient::new("front", &small_model(), 20, queue, &signals, store, Duration::from_secs(1))
        .unwrap();
    let err = client.detect(&[0u8; 10]).unwrap_err();
    assert!(matches!(err, DetectError::TensorSize { .. }));
    assert!(!err.is_transient());
    process.stop(Duration::from_secs(2));
}

#[test]
fn test_failed_backend_leaves_worker_dead() {
    let store = SharedFrameStore::new();
    let factory: DetectorFactory = Arc::new(|| {
        Err(DetectError::Backend {
            details: "no device".to_string(),
        })
    });
    let process = DetectorProcess::new(
        "broken",
        &DetectorConfig::default(),
        &small_model(),
        factory,
        DetectionQueue::new(1),
        DetectionSignals::new(),
        store,
        CancellationToken::new(),
    );
    process.start_or_restart().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(!process.is_alive());
}

#[test]
fn test_rescale_clamps_and_drops_outside() {
    let shape = FrameShape::new(100, 100);
    let region = BoundingBox::new(80, 80, 180, 180);
    let clamped = rescale(shape, &region, [0.0, 0.0, 0.5, 0.5]).unwrap();
    assert_eq!(clamped, BoundingBox::new(80, 80, 100, 100));
    assert!(rescale(shape, &region, [0.5, 0.5, 0.9, 0.9]).is_none());
}

fn detection(label: &str, score: f32, bbox: BoundingBox) -> Detection {
    Detection::new(
        label,
        score,
        bbox,
        DetectionRegion::new(BoundingBox::new(0, 0, 320, 320), RegionSource::Tracked),
    )
}

#[test]
fn test_reduce_keeps_best_of_overlapping_duplicates() {
    let reduced = reduce_detections(
        vec![
            detection("person", 0.6, BoundingBox::new(10, 10, 50, 100)),
            detection("person", 0.9, BoundingBox::new(12, 10, 52, 100)),
            detection("car", 0.7, BoundingBox::new(12, 10, 52, 100)),
            detection("person", 0.8, BoundingBox::new(200, 10, 240, 100)),
        ],
        0.4,
    );
    assert_eq!(reduced.len(), 3);
    let people: Vec<f32> = reduced
        .iter()
        .filter(|d| d.label == "person")
        .map(|d| d.score)
        .collect();
    assert_eq!(people, vec![0.9, 0.8]);
}

#[test]
fn test_filter_detections_applies_label_filters() {
    let mut objects = ObjectsConfig::default();
    objects.track = vec!["person".to_string(), "car".to_string()];
    objects.filters.insert(
        "car".to_string(),
        ObjectFilter {
            min_area: 5000,
            ..ObjectFilter::default()
        },
    );
    let kept = filter_detections(
        vec![
            detection("person", 0.7, BoundingBox::new(0, 0, 10, 20)),
            detection("person", 0.3, BoundingBox::new(0, 0, 10, 20)),
            detection("car", 0.9, BoundingBox::new(0, 0, 10, 20)),
            detection("dog", 0.9, BoundingBox::new(0, 0, 100, 100)),
        ],
        &objects,
    );
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].label, "person");
}

#[test]
fn test_attribute_labels_only_describe_their_objects() {
    assert!(is_attribute_label("face"));
    assert!(!is_attribute_label("person"));
    assert!(attribute_applies("car", "license_plate"));
    assert!(!attribute_applies("person", "license_plate"));
}
