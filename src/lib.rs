pub mod config;
pub mod error;
pub mod events;
pub mod recovery;
pub mod metrics;
pub mod geometry;
pub mod frame;
pub mod frame_store;
pub mod bus;
pub mod capture;
pub mod motion;
pub mod region;
pub mod detect;
pub mod track;
pub mod pose;
pub mod pipeline;
pub mod review;
pub mod watchdog;
pub mod app;

pub use config::{CameraConfig, EdgewatchConfig};
pub use error::{EdgewatchError, Result};
pub use recovery::{RecoveryConfig, RecoveryManager};
pub use app::{ComponentState, EdgewatchOrchestrator, RunOutcome, ShutdownReason};
pub use events::{EventBus, EventFilter, EventReceiver, PipelineEvent};
pub use metrics::{CameraMetrics, CameraMetricsSnapshot, DetectorMetrics};
pub use frame::{FrameShape, FrameTime};
pub use frame_store::{FrameRetention, SharedFrameStore};
pub use bus::{ConfigPublisher, DetectionPublisher};
pub use capture::CaptureSupervisor;
pub use detect::{Detection, DetectionClient, DetectorProcess};
pub use track::{IouTracker, ObjectTracker, TrackedObject};
pub use pipeline::{CameraProcessor, RegionDetector};
pub use review::{ReviewSegmentMaintainer, ReviewSegmentRecord, SeverityLevel};
pub use watchdog::{ProcessWatchdog, SupervisedWorker};
