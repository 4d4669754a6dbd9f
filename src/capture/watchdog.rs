use super::supervisor::CaptureSupervisor;
use crate::config::FfmpegConfig;
use crate::frame::FrameTime;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why a camera's capture needs a restart
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureFault {
    CaptureThreadDead,
    NoFrames { idle_secs: f64 },
    /// The source delivers far more frames than configured
    FpsTooHigh { fps: f64, limit: f64 },
}

impl std::fmt::Display for CaptureFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureFault::CaptureThreadDead => write!(f, "capture thread died"),
            CaptureFault::NoFrames { idle_secs } => {
                write!(f, "no frames for {:.1}s", idle_secs)
            }
            CaptureFault::FpsTooHigh { fps, limit } => {
                write!(f, "{:.1} fps exceeds the limit of {:.1}", fps, limit)
            }
        }
    }
}

/// What the watchdog observed about one camera's capture
#[derive(Debug, Clone, Copy)]
pub struct CaptureLiveness {
    pub now: FrameTime,
    pub capture_alive: bool,
    /// When the capture loop last started reading a frame
    pub current_frame_time: FrameTime,
    pub camera_fps: f64,
}

/// First fault found, most severe first
pub fn evaluate_liveness(
    liveness: &CaptureLiveness,
    target_fps: u32,
    config: &FfmpegConfig,
) -> Option<CaptureFault> {
    if !liveness.capture_alive {
        return Some(CaptureFault::CaptureThreadDead);
    }

    let idle_secs = liveness.now - liveness.current_frame_time;
    if idle_secs > config.frame_timeout_secs {
        return Some(CaptureFault::NoFrames { idle_secs });
    }

    let limit = target_fps as f64 + config.fps_margin;
    if liveness.camera_fps > limit {
        return Some(CaptureFault::FpsTooHigh {
            fps: liveness.camera_fps,
            limit,
        });
    }
    None
}

/// Modification time of the newest artifact `camera` wrote into `dir`.
/// Outputs name their files `<camera>@<anything>`.
pub fn latest_artifact_time(dir: &Path, camera: &str) -> Option<SystemTime> {
    let prefix = format!("{}@", camera);
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

/// True when neither the output's start nor its newest artifact is within
/// `stall` of `now`
pub fn output_stalled(
    latest_artifact: Option<SystemTime>,
    started: SystemTime,
    now: SystemTime,
    stall: Duration,
) -> bool {
    let reference = latest_artifact.map_or(started, |latest| latest.max(started));
    now.duration_since(reference)
        .map(|idle| idle > stall)
        .unwrap_or(false)
}

/// Check a camera's capture every `interval` until cancelled, then shut it
/// down. Checks run on the blocking pool since restarts wait on processes.
pub async fn run_camera_watchdog(
    supervisor: Arc<Mutex<CaptureSupervisor>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let camera = supervisor.lock().camera().to_string();
    info!("{}: capture watchdog started", camera);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let checked = Arc::clone(&supervisor);
                if let Err(e) = tokio::task::spawn_blocking(move || checked.lock().check()).await {
                    error!("{}: capture check panicked: {}", camera, e);
                }
            }
        }
    }

    debug!("{}: capture watchdog stopping", camera);
    let stopping = Arc::clone(&supervisor);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.lock().shutdown()).await {
        error!("{}: capture shutdown panicked: {}", camera, e);
    }
    info!("{}: capture watchdog stopped", camera);
}
