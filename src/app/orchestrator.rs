use super::types::ComponentState;
use crate::bus::{ConfigPublisher, DetectionPublisher, InterProcessCommunicator};
use crate::capture::CaptureSupervisor;
use crate::config::EdgewatchConfig;
use crate::detect::{DetectionQueue, DetectionSignals, DetectorProcess};
use crate::error::Result;
use crate::events::EventBus;
use crate::frame_store::SharedFrameStore;
use crate::metrics::CameraMetrics;
use crate::region::RegionGridRegistry;
use crate::watchdog::Escalation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::workers::ProcessorThread;

/// Everything running for one camera
pub(super) struct CameraRuntime {
    pub(super) name: String,
    pub(super) supervisor: Arc<Mutex<CaptureSupervisor>>,
    pub(super) processor: Arc<ProcessorThread>,
    pub(super) metrics: Arc<CameraMetrics>,
    pub(super) watchdog: Option<tokio::task::JoinHandle<()>>,
}

/// Stop tokens, cancelled one stage at a time during shutdown
#[derive(Default)]
pub(super) struct StageTokens {
    /// Capture supervisors and their watchdogs
    pub(super) intake: CancellationToken,
    pub(super) processing: CancellationToken,
    /// Detector workers and the communicator
    pub(super) workers: CancellationToken,
    pub(super) review: CancellationToken,
    pub(super) supervision: CancellationToken,
}

/// Builds the pipeline from configuration, runs it and tears it down in order
pub struct EdgewatchOrchestrator {
    pub(super) config: EdgewatchConfig,
    pub(super) config_path: Option<PathBuf>,
    pub(super) store: SharedFrameStore,
    pub(super) events: EventBus,
    pub(super) detections: DetectionPublisher,
    pub(super) config_publisher: ConfigPublisher,
    pub(super) registry: RegionGridRegistry,
    pub(super) queue: DetectionQueue,
    pub(super) signals: DetectionSignals,

    // Workers
    pub(super) communicator: Option<InterProcessCommunicator>,
    pub(super) detectors: Vec<Arc<DetectorProcess>>,
    pub(super) cameras: Vec<CameraRuntime>,
    pub(super) review: Option<JoinHandle<()>>,
    pub(super) process_watchdog: Option<tokio::task::JoinHandle<Option<Escalation>>>,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) tokens: StageTokens,
}

impl EdgewatchOrchestrator {
    /// Validate `config` and prepare shared state. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: EdgewatchConfig, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;

        let cameras = config.enabled_cameras().count();
        info!(
            "Preparing pipeline for {} cameras and {} detectors",
            cameras,
            config.detectors.len()
        );

        let registry = RegionGridRegistry::load(&config.paths.region_grids());
        Ok(Self {
            events: EventBus::new(config.bus.event_capacity),
            detections: DetectionPublisher::new(config.bus.detection_capacity),
            config_publisher: ConfigPublisher::new(),
            queue: DetectionQueue::new(cameras.max(1) * 2),
            signals: DetectionSignals::new(),
            store: SharedFrameStore::new(),
            registry,
            config,
            config_path,
            communicator: None,
            detectors: Vec::new(),
            cameras: Vec::new(),
            review: None,
            process_watchdog: None,
            component_states: Arc::new(Mutex::new(HashMap::new())),
            tokens: StageTokens::default(),
        })
    }

    pub fn config(&self) -> &EdgewatchConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn frame_store(&self) -> &SharedFrameStore {
        &self.store
    }

    /// Publisher for external detection payloads such as manual events
    pub fn detections(&self) -> &DetectionPublisher {
        &self.detections
    }

    pub fn camera_metrics(&self, camera: &str) -> Option<Arc<CameraMetrics>> {
        self.cameras
            .iter()
            .find(|c| c.name == camera)
            .map(|c| Arc::clone(&c.metrics))
    }
}
