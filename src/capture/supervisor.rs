use super::ingest::ManagedProcess;
use super::reader::{capture_frames, CaptureEnd, FrameSink};
use super::watchdog::{evaluate_liveness, latest_artifact_time, output_stalled, CaptureLiveness};
use crate::config::{CameraConfig, OutputConfig};
use crate::error::CaptureError;
use crate::events::{EventBus, PipelineEvent};
use crate::frame::{now_timestamp, MonotonicClock};
use crate::recovery::{RecoveryAction, RecoveryConfig, RecoveryManager};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct CaptureThread {
    handle: JoinHandle<CaptureEnd>,
    cancel: CancellationToken,
}

/// A side-channel process such as a recorder, restarted on its own
struct OutputSlot {
    label: String,
    config: OutputConfig,
    process: Option<ManagedProcess>,
    started: SystemTime,
}

/// Owns one camera's decode process, the thread reading frames from it and
/// any output processes configured for the camera.
pub struct CaptureSupervisor {
    camera: CameraConfig,
    sink: FrameSink,
    cache_dir: PathBuf,
    events: EventBus,
    cancel: CancellationToken,
    ingest: Option<ManagedProcess>,
    capture: Option<CaptureThread>,
    outputs: Vec<OutputSlot>,
    recovery: RecoveryManager,
    /// Set while backing off after repeated failures
    restart_at: Option<Instant>,
    connected: bool,
}

impl CaptureSupervisor {
    pub fn new(
        camera: CameraConfig,
        sink: FrameSink,
        cache_dir: PathBuf,
        recovery: RecoveryConfig,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        let outputs = camera
            .ffmpeg
            .outputs
            .iter()
            .enumerate()
            .map(|(index, config)| OutputSlot {
                label: format!("{}:output{}", camera.name, index),
                config: config.clone(),
                process: None,
                started: SystemTime::now(),
            })
            .collect();
        Self {
            camera,
            sink,
            cache_dir,
            events,
            cancel,
            ingest: None,
            capture: None,
            outputs,
            recovery: RecoveryManager::with_config(recovery),
            restart_at: None,
            connected: false,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera.name
    }

    fn component(&self) -> String {
        format!("capture:{}", self.camera.name)
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.camera.ffmpeg.terminate_grace_secs)
    }

    pub fn start(&mut self) -> Result<(), CaptureError> {
        self.start_ingest()?;
        for index in 0..self.outputs.len() {
            self.start_output(index);
        }
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture
            .as_ref()
            .map(|c| !c.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn ingest_pid(&self) -> Option<u32> {
        self.ingest.as_ref().map(ManagedProcess::pid)
    }

    fn start_ingest(&mut self) -> Result<(), CaptureError> {
        let label = format!("{}:detect", self.camera.name);
        let mut process = ManagedProcess::spawn(&label, &self.camera.detect_command(), true)?;
        let mut stdout = process.take_stdout()?;
        self.sink.metrics.ingest_pid.store(process.pid(), Ordering::Relaxed);
        // the frame timeout counts from now
        self.sink.metrics.current_frame_time.store(now_timestamp());

        let cancel = self.cancel.child_token();
        let thread_cancel = cancel.clone();
        let sink = self.sink.clone();
        let handle = std::thread::Builder::new()
            .name(format!("capture:{}", self.camera.name))
            .spawn(move || {
                let mut clock = MonotonicClock::new();
                let end = capture_frames(&mut stdout, &sink, &mut clock, &thread_cancel);
                match &end {
                    CaptureEnd::Cancelled => debug!("{}: capture cancelled", sink.camera),
                    other => warn!("{}: capture stopped: {:?}", sink.camera, other),
                }
                end
            })
            .map_err(|source| CaptureError::Spawn {
                command: label.clone(),
                source,
            })?;

        self.ingest = Some(process);
        self.capture = Some(CaptureThread { handle, cancel });
        self.set_connected(true);
        Ok(())
    }

    fn stop_ingest(&mut self) {
        let grace = self.grace();
        if let Some(capture) = self.capture.as_ref() {
            capture.cancel.cancel();
        }
        if let Some(mut process) = self.ingest.take() {
            if let Err(e) = process.terminate(grace) {
                error!("{}: {}", process.label(), e);
            }
        }
        if let Some(capture) = self.capture.take() {
            // the reader sees end of stream once the process is gone
            let deadline = Instant::now() + grace;
            while !capture.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if capture.handle.is_finished() {
                let _ = capture.handle.join();
            } else {
                warn!("{}: abandoning capture thread", self.camera.name);
            }
        }
        self.sink.metrics.ingest_pid.store(0, Ordering::Relaxed);
        self.set_connected(false);
    }

    fn restart_ingest(&mut self, reason: &str) {
        if let Some(process) = self.ingest.as_ref() {
            process.log().dump();
        }
        self.stop_ingest();
        let component = self.component();
        match self.recovery.record_failure(&component) {
            RecoveryAction::Restart => self.try_start_ingest(reason),
            RecoveryAction::RestartAfterDelay(delay) => {
                warn!("{}: next capture attempt in {:?}", self.camera.name, delay);
                self.restart_at = Some(Instant::now() + delay);
            }
        }
    }

    fn try_start_ingest(&mut self, reason: &str) {
        match self.start_ingest() {
            Ok(()) => {
                self.events.publish(PipelineEvent::WorkerRestarted {
                    worker: self.component(),
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                error!("{}: cannot start capture: {}", self.camera.name, e);
                let retry = Duration::from_secs(self.camera.ffmpeg.retry_interval_secs);
                self.restart_at = Some(Instant::now() + retry);
            }
        }
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.events.publish(PipelineEvent::CameraStatusChanged {
                camera: self.camera.name.clone(),
                connected,
                timestamp: SystemTime::now(),
            });
        }
    }

    fn start_output(&mut self, index: usize) {
        let slot = &mut self.outputs[index];
        match ManagedProcess::spawn(&slot.label, &slot.config.command, false) {
            Ok(process) => {
                slot.process = Some(process);
                slot.started = SystemTime::now();
            }
            Err(e) => error!("{}: cannot start output: {}", slot.label, e),
        }
    }

    fn restart_output(&mut self, index: usize, reason: &str) {
        let grace = self.grace();
        let label = self.outputs[index].label.clone();
        if let Some(mut process) = self.outputs[index].process.take() {
            process.log().dump();
            if let Err(e) = process.terminate(grace) {
                error!("{}: {}", label, e);
            }
        }
        self.start_output(index);
        self.events.publish(PipelineEvent::WorkerRestarted {
            worker: label,
            reason: reason.to_string(),
        });
    }

    /// One watchdog pass over the capture and its outputs
    pub fn check(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }

        if let Some(at) = self.restart_at {
            if Instant::now() >= at {
                self.restart_at = None;
                self.try_start_ingest("backoff elapsed");
            }
        } else {
            let liveness = CaptureLiveness {
                now: now_timestamp(),
                capture_alive: self.is_capturing(),
                current_frame_time: self.sink.metrics.current_frame_time.load(),
                camera_fps: self.sink.metrics.camera_fps.load(),
            };
            let component = self.component();
            match evaluate_liveness(&liveness, self.camera.detect.fps, &self.camera.ffmpeg) {
                Some(fault) => {
                    warn!("{}: {}, restarting capture", self.camera.name, fault);
                    self.restart_ingest(&fault.to_string());
                }
                None if self.recovery.restart_count(&component) > 0 => {
                    self.recovery.reset(&component);
                }
                None => {}
            }
        }

        let stall = Duration::from_secs(self.camera.ffmpeg.output_stall_secs);
        for index in 0..self.outputs.len() {
            let slot = &mut self.outputs[index];
            let running = slot.process.as_mut().map(|p| p.is_running()).unwrap_or(false);
            if !running {
                self.restart_output(index, "output process exited");
                continue;
            }
            if slot.config.records() {
                let latest = latest_artifact_time(&self.cache_dir, &self.camera.name);
                if output_stalled(latest, slot.started, SystemTime::now(), stall) {
                    self.restart_output(index, "no new recording segments");
                }
            }
        }
    }

    /// Stop everything this supervisor owns
    pub fn shutdown(&mut self) {
        info!("{}: stopping capture", self.camera.name);
        self.restart_at = None;
        self.stop_ingest();
        let grace = self.grace();
        for slot in &mut self.outputs {
            if let Some(mut process) = slot.process.take() {
                if let Err(e) = process.terminate(grace) {
                    error!("{}: {}", slot.label, e);
                }
            }
        }
    }
}
