//! In-process messaging between pipeline stages.
//!
//! Three primitives are provided:
//! - config pub/sub: last-value topics carrying configuration fragments
//! - request/response: a communicator thread dispatching to registered handlers
//! - detections fan-out: per-frame results and external events for the review stage

pub mod config_updater;
pub mod detections;
pub mod inter_process;

pub use config_updater::{ConfigPublisher, ConfigSubscriber};
pub use detections::{
    AudioDetections, DetectionPayload, DetectionPublisher, DetectionSubscriber, ManualEvent,
    ManualEventState, VideoDetections,
};
pub use inter_process::{InterProcessCommunicator, InterProcessRequestor};

/// Config topic for a camera's detect settings
pub fn detect_topic(camera: &str) -> String {
    format!("config/detect/{}", camera)
}

/// Config topic for a camera's record settings
pub fn record_topic(camera: &str) -> String {
    format!("config/record/{}", camera)
}

/// Config topic for a camera's zone polygons
pub fn zones_topic(camera: &str) -> String {
    format!("config/zones/{}", camera)
}

/// Request topic answering with a camera's region grid
pub const REGION_GRID_TOPIC: &str = "request_region_grid";
