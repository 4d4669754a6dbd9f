//! Camera capture: the decode subprocess, the thread that turns its raw
//! output into stored frames, and the watchdog that restarts either when the
//! stream stalls.

pub mod ingest;
pub mod reader;
pub mod supervisor;
pub mod watchdog;

pub use ingest::{LogPipe, ManagedProcess, LOG_PIPE_LINES};
pub use reader::{capture_frames, CaptureEnd, FrameSink};
pub use supervisor::CaptureSupervisor;
pub use watchdog::{
    evaluate_liveness, latest_artifact_time, output_stalled, run_camera_watchdog, CaptureFault,
    CaptureLiveness,
};

#[cfg(test)]
mod tests;
