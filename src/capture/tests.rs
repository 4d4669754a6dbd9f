use super::*;
use crate::config::{CameraConfig, FfmpegConfig, OutputConfig};
use crate::error::CaptureError;
use crate::events::{EventBus, PipelineEvent};
use crate::frame::{FrameShape, FrameTime, MonotonicClock};
use crate::frame_store::SharedFrameStore;
use crate::metrics::CameraMetrics;
use crate::recovery::RecoveryConfig;
use crossbeam::channel::{bounded, Receiver};
use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const FRAME_BYTES: usize = 24;

fn sink(queue: usize) -> (FrameSink, Receiver<FrameTime>) {
    let (tx, rx) = bounded(queue);
    let sink = FrameSink {
        camera: "front".to_string(),
        shape: FrameShape::new(4, 4),
        store: SharedFrameStore::new(),
        frames: tx,
        metrics: Arc::new(CameraMetrics::default()),
    };
    (sink, rx)
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

#[test]
fn test_log_pipe_keeps_only_the_tail() {
    let pipe = LogPipe::new("front:detect");
    for i in 0..150 {
        pipe.push(format!("line {}", i));
    }
    pipe.push("   ".to_string());

    let lines = pipe.lines();
    assert_eq!(lines.len(), LOG_PIPE_LINES);
    assert_eq!(lines[0], "line 50");
    assert_eq!(lines[LOG_PIPE_LINES - 1], "line 149");

    pipe.dump();
    assert!(pipe.lines().is_empty());
}

#[test]
fn test_empty_command_is_rejected() {
    let err = ManagedProcess::spawn("front:detect", &[], true).err().unwrap();
    assert!(matches!(err, CaptureError::EmptyCommand));
}

#[test]
fn test_process_stderr_is_collected_and_terminate_stops_it() {
    let mut process = ManagedProcess::spawn("front:detect", &sh("echo hello >&2; sleep 5"), false).unwrap();
    assert!(process.is_running());
    let log = process.log().clone();
    assert!(wait_for(Duration::from_secs(3), || log.lines() == vec!["hello".to_string()]));

    process.terminate(Duration::from_secs(2)).unwrap();
    assert!(!process.is_running());
}

#[test]
fn test_terminate_kills_process_ignoring_sigterm() {
    let mut process = ManagedProcess::spawn("front:output0", &sh("trap '' TERM; sleep 5"), false).unwrap();
    // give the shell time to install the trap
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    process.terminate(Duration::from_millis(300)).unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!process.is_running());
}

#[test]
fn test_stdout_can_only_be_taken_once() {
    let mut process = ManagedProcess::spawn("front:detect", &sh("sleep 5"), true).unwrap();
    assert!(process.take_stdout().is_ok());
    assert!(matches!(
        process.take_stdout(),
        Err(CaptureError::StdoutUnavailable)
    ));
}

#[test]
fn test_capture_publishes_every_complete_frame() {
    let (sink, rx) = sink(8);
    // two and a half frames
    let mut source = Cursor::new(vec![7u8; FRAME_BYTES * 2 + FRAME_BYTES / 2]);

    let end = capture_frames(&mut source, &sink, &mut MonotonicClock::new(), &CancellationToken::new());

    assert_eq!(end, CaptureEnd::EndOfStream);
    let times: Vec<FrameTime> = rx.try_iter().collect();
    assert_eq!(times.len(), 2);
    assert!(times[0] < times[1]);
    assert_eq!(sink.store.len(), 2);
    assert_eq!(sink.metrics.frames_captured.load(Ordering::Relaxed), 2);
    assert_eq!(sink.metrics.frames_skipped.load(Ordering::Relaxed), 0);
    assert!(sink.metrics.current_frame_time.load() > 0.0);
}

#[test]
fn test_full_queue_skips_frames_without_leaking_buffers() {
    let (sink, rx) = sink(1);
    let mut source = Cursor::new(vec![0u8; FRAME_BYTES * 3]);

    let end = capture_frames(&mut source, &sink, &mut MonotonicClock::new(), &CancellationToken::new());

    assert_eq!(end, CaptureEnd::EndOfStream);
    assert_eq!(rx.len(), 1);
    assert_eq!(sink.store.len(), 1);
    assert_eq!(sink.metrics.frames_captured.load(Ordering::Relaxed), 3);
    assert_eq!(sink.metrics.frames_skipped.load(Ordering::Relaxed), 2);
}

#[test]
fn test_capture_stops_when_processor_is_gone() {
    let (sink, rx) = sink(4);
    drop(rx);
    let mut source = Cursor::new(vec![0u8; FRAME_BYTES * 3]);

    let end = capture_frames(&mut source, &sink, &mut MonotonicClock::new(), &CancellationToken::new());

    assert_eq!(end, CaptureEnd::QueueClosed);
    assert!(sink.store.is_empty());
}

#[test]
fn test_cancelled_capture_reads_nothing() {
    let (sink, rx) = sink(4);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut source = Cursor::new(vec![0u8; FRAME_BYTES]);

    let end = capture_frames(&mut source, &sink, &mut MonotonicClock::new(), &cancel);

    assert_eq!(end, CaptureEnd::Cancelled);
    assert!(rx.is_empty());
    assert_eq!(sink.metrics.frames_captured.load(Ordering::Relaxed), 0);
}

fn liveness(alive: bool, idle: f64, fps: f64) -> CaptureLiveness {
    CaptureLiveness {
        now: 1000.0,
        capture_alive: alive,
        current_frame_time: 1000.0 - idle,
        camera_fps: fps,
    }
}

#[test]
fn test_liveness_faults() {
    let config = FfmpegConfig::default();

    assert_eq!(evaluate_liveness(&liveness(true, 1.0, 5.0), 5, &config), None);
    assert_eq!(
        evaluate_liveness(&liveness(false, 30.0, 50.0), 5, &config),
        Some(CaptureFault::CaptureThreadDead)
    );
    assert_eq!(
        evaluate_liveness(&liveness(true, 25.0, 5.0), 5, &config),
        Some(CaptureFault::NoFrames { idle_secs: 25.0 })
    );
    assert_eq!(
        evaluate_liveness(&liveness(true, 1.0, 16.0), 5, &config),
        Some(CaptureFault::FpsTooHigh {
            fps: 16.0,
            limit: 15.0
        })
    );
    // exactly at the margin is tolerated
    assert_eq!(evaluate_liveness(&liveness(true, 1.0, 15.0), 5, &config), None);
}

#[test]
fn test_output_stall_uses_newest_of_start_and_artifact() {
    let now = SystemTime::now();
    let stall = Duration::from_secs(120);
    let long_ago = now - Duration::from_secs(600);

    assert!(output_stalled(None, long_ago, now, stall));
    assert!(output_stalled(Some(now - Duration::from_secs(200)), long_ago, now, stall));
    assert!(!output_stalled(Some(now - Duration::from_secs(10)), long_ago, now, stall));
    assert!(!output_stalled(None, now - Duration::from_secs(30), now, stall));
}

#[test]
fn test_latest_artifact_only_counts_the_camera_prefix() {
    let dir = TempDir::new().unwrap();
    assert!(latest_artifact_time(dir.path(), "front").is_none());

    std::fs::write(dir.path().join("front@20260101T000000.mp4"), b"x").unwrap();
    std::fs::write(dir.path().join("frontdoor@20260101T000000.mp4"), b"x").unwrap();

    assert!(latest_artifact_time(dir.path(), "front").is_some());
    assert!(latest_artifact_time(dir.path(), "back").is_none());
    assert!(latest_artifact_time(&dir.path().join("missing"), "front").is_none());
}

struct SupervisorHarness {
    supervisor: CaptureSupervisor,
    frames: Receiver<FrameTime>,
    events: tokio::sync::broadcast::Receiver<PipelineEvent>,
    _cache: TempDir,
}

fn supervisor(camera: CameraConfig) -> SupervisorHarness {
    let (tx, rx) = bounded(16);
    let sink = FrameSink {
        camera: camera.name.clone(),
        shape: camera.frame_shape(),
        store: SharedFrameStore::new(),
        frames: tx,
        metrics: Arc::new(CameraMetrics::default()),
    };
    let bus = EventBus::new(32);
    let events = bus.subscribe();
    let cache = TempDir::new().unwrap();
    let supervisor = CaptureSupervisor::new(
        camera,
        sink,
        cache.path().to_path_buf(),
        RecoveryConfig::default(),
        bus,
        CancellationToken::new(),
    );
    SupervisorHarness {
        supervisor,
        frames: rx,
        events,
        _cache: cache,
    }
}

fn tiny_camera(script: &str) -> CameraConfig {
    let mut camera = CameraConfig::default();
    camera.name = "front".to_string();
    camera.detect.width = 4;
    camera.detect.height = 4;
    camera.ffmpeg.detect_command = Some(sh(script));
    camera.ffmpeg.terminate_grace_secs = 1;
    camera
}

fn restarted_workers(events: &mut tokio::sync::broadcast::Receiver<PipelineEvent>) -> Vec<String> {
    let mut workers = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::WorkerRestarted { worker, .. } = event {
            workers.push(worker);
        }
    }
    workers
}

#[test]
fn test_supervisor_restarts_capture_after_stream_ends() {
    let mut h = supervisor(tiny_camera("head -c 72 /dev/zero"));

    h.supervisor.start().unwrap();
    assert!(h.supervisor.ingest_pid().is_some());
    assert!(wait_for(Duration::from_secs(5), || !h.supervisor.is_capturing()));
    assert_eq!(h.frames.try_iter().count(), 3);

    h.supervisor.check();

    assert_eq!(restarted_workers(&mut h.events), vec!["capture:front".to_string()]);
    assert!(wait_for(Duration::from_secs(5), || h.frames.len() == 3));

    h.supervisor.shutdown();
    assert!(h.supervisor.ingest_pid().is_none());
    assert!(!h.supervisor.is_capturing());
}

#[test]
fn test_supervisor_reports_connection_changes() {
    let mut h = supervisor(tiny_camera("sleep 5"));

    h.supervisor.start().unwrap();
    h.supervisor.shutdown();

    let mut states = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        if let PipelineEvent::CameraStatusChanged { connected, .. } = event {
            states.push(connected);
        }
    }
    assert_eq!(states, vec![true, false]);
}

#[test]
fn test_supervisor_start_fails_without_command() {
    let mut camera = tiny_camera("true");
    camera.ffmpeg.detect_command = Some(Vec::new());
    let mut h = supervisor(camera);

    assert!(matches!(h.supervisor.start(), Err(CaptureError::EmptyCommand)));
    assert!(!h.supervisor.is_capturing());
}

#[test]
fn test_exited_output_is_restarted_on_its_own() {
    let mut camera = tiny_camera("sleep 5");
    camera.ffmpeg.outputs = vec![OutputConfig {
        command: sh("exit 0"),
        roles: vec!["restream".to_string()],
    }];
    let mut h = supervisor(camera);
    h.supervisor.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    h.supervisor.check();

    assert_eq!(restarted_workers(&mut h.events), vec!["front:output0".to_string()]);
    assert!(h.supervisor.is_capturing());
    h.supervisor.shutdown();
}
