//! Rate counters and per-camera/per-detector gauges shared across threads.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// `f64` gauge stored as raw bits
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release)
    }
}

/// Events per second over a sliding window
#[derive(Debug)]
pub struct EventsPerSecond {
    window: Duration,
    max_events: usize,
    timestamps: VecDeque<Instant>,
    started: Option<Instant>,
}

impl EventsPerSecond {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10), 1000)
    }

    pub fn with_window(window: Duration, max_events: usize) -> Self {
        Self {
            window,
            max_events,
            timestamps: VecDeque::with_capacity(max_events),
            started: None,
        }
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
        self.timestamps.push_back(now);
        if self.timestamps.len() > self.max_events {
            self.timestamps.pop_front();
        }
        self.expire(now);
    }

    pub fn eps(&mut self) -> f64 {
        self.eps_at(Instant::now())
    }

    pub fn eps_at(&mut self, now: Instant) -> f64 {
        self.expire(now);
        let Some(started) = self.started else {
            return 0.0;
        };
        // before a full window has passed, divide by the elapsed time
        let seconds = now.duration_since(started).min(self.window).as_secs_f64().max(1.0);
        self.timestamps.len() as f64 / seconds
    }

    fn expire(&mut self, now: Instant) {
        while let Some(first) = self.timestamps.front() {
            if now.duration_since(*first) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for EventsPerSecond {
    fn default() -> Self {
        Self::new()
    }
}

/// Live gauges for one camera
#[derive(Debug, Default)]
pub struct CameraMetrics {
    /// Rate frames arrive from the ingest process
    pub camera_fps: AtomicF64,
    /// Rate frames are dropped because the queue is full
    pub skipped_fps: AtomicF64,
    /// Rate frames are processed
    pub process_fps: AtomicF64,
    /// Rate of detector calls for this camera
    pub detection_fps: AtomicF64,
    /// Timestamp of the frame currently being read
    pub current_frame_time: AtomicF64,
    pub ingest_pid: AtomicU32,
    pub frames_captured: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub frames_processed: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CameraMetricsSnapshot {
    pub camera_fps: f64,
    pub skipped_fps: f64,
    pub process_fps: f64,
    pub detection_fps: f64,
    pub ingest_pid: u32,
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub frames_processed: u64,
}

impl CameraMetrics {
    pub fn snapshot(&self) -> CameraMetricsSnapshot {
        CameraMetricsSnapshot {
            camera_fps: self.camera_fps.load(),
            skipped_fps: self.skipped_fps.load(),
            process_fps: self.process_fps.load(),
            detection_fps: self.detection_fps.load(),
            ingest_pid: self.ingest_pid.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
        }
    }
}

/// Live gauges for one detector worker
#[derive(Debug, Default)]
pub struct DetectorMetrics {
    /// Start of the in-flight detection, 0 when idle
    pub detection_start: AtomicF64,
    /// Exponentially averaged inference time in seconds
    pub avg_inference_speed: AtomicF64,
    pub detections_run: AtomicU64,
    pub pid: AtomicU32,
}

impl DetectorMetrics {
    pub fn record_inference(&self, seconds: f64) {
        let previous = self.avg_inference_speed.load();
        let next = if previous == 0.0 {
            seconds
        } else {
            previous * 0.9 + seconds * 0.1
        };
        self.avg_inference_speed.store(next);
        self.detections_run.fetch_add(1, Ordering::Relaxed);
    }
}
