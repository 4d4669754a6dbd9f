use super::orchestrator::CameraRuntime;
use super::workers::ProcessorThread;
use super::{ComponentState, EdgewatchOrchestrator};
use crate::bus::{detect_topic, zones_topic, InterProcessCommunicator};
use crate::capture::{run_camera_watchdog, CaptureSupervisor, FrameSink};
use crate::config::CameraConfig;
use crate::detect::{factory_for, DetectionClient, DetectorProcess};
use crate::error::{EdgewatchError, Result};
use crate::events::PipelineEvent;
use crate::metrics::CameraMetrics;
use crate::pipeline::{CameraProcessor, ProcessorLinks};
use crate::recovery::RecoveryConfig;
use crate::review::{JsonLinesSegmentStore, ReviewSegmentMaintainer};
use crate::watchdog::{ProcessWatchdog, SupervisedWorker};
use crossbeam::channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

impl EdgewatchOrchestrator {
    /// Start every stage, consumers before producers
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting edgewatch pipeline");

        self.start_communicator()?;
        self.start_detectors()?;
        self.start_review()?;

        let cameras: Vec<CameraConfig> = self.config.enabled_cameras().cloned().collect();
        if cameras.is_empty() {
            warn!("No enabled cameras configured");
        }
        for camera in cameras {
            self.start_camera(camera)?;
        }

        self.start_process_watchdog();
        info!("Edgewatch pipeline started");
        Ok(())
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.bus.request_timeout_ms)
    }

    fn start_communicator(&mut self) -> Result<()> {
        self.set_component_state("communicator", ComponentState::Starting);
        let communicator = InterProcessCommunicator::start(self.tokens.workers.child_token())?;
        self.registry.serve(&communicator);
        self.communicator = Some(communicator);
        self.set_component_state("communicator", ComponentState::Running);
        Ok(())
    }

    fn start_detectors(&mut self) -> Result<()> {
        for (name, config) in &self.config.detectors {
            let component = format!("detector:{}", name);
            self.set_component_state(&component, ComponentState::Starting);
            let detector = Arc::new(DetectorProcess::new(
                name,
                config,
                &self.config.model,
                factory_for(config),
                self.queue.clone(),
                self.signals.clone(),
                self.store.clone(),
                self.tokens.workers.child_token(),
            ));
            detector.start_or_restart().map_err(|e| {
                error!("Failed to start detector {}: {}", name, e);
                EdgewatchError::component(component.clone(), e.to_string())
            })?;
            self.detectors.push(detector);
            self.set_component_state(&component, ComponentState::Running);
        }
        Ok(())
    }

    fn start_review(&mut self) -> Result<()> {
        self.set_component_state("review", ComponentState::Starting);
        let maintainer = ReviewSegmentMaintainer::new(
            &self.config,
            Box::new(JsonLinesSegmentStore::new(&self.config.paths.review_log)),
            self.events.clone(),
            self.store.clone(),
            self.config_publisher.subscribe("config/record/"),
            self.detections.subscribe(),
        );
        let cancel = self.tokens.review.clone();
        let handle = std::thread::Builder::new()
            .name("review".to_string())
            .spawn(move || maintainer.run(cancel))?;
        self.review = Some(handle);
        self.set_component_state("review", ComponentState::Running);
        Ok(())
    }

    fn start_camera(&mut self, camera: CameraConfig) -> Result<()> {
        let component = format!("camera:{}", camera.name);
        self.set_component_state(&component, ComponentState::Starting);
        let communicator = self
            .communicator
            .as_ref()
            .ok_or_else(|| EdgewatchError::system("communicator must start before cameras"))?;

        let metrics = Arc::new(CameraMetrics::default());
        let (frames_tx, frames_rx) = bounded(camera.frame_queue_size);

        let client = DetectionClient::new(
            &camera.name,
            &self.config.model,
            self.config.max_detections(),
            self.queue.clone(),
            &self.signals,
            self.store.clone(),
            self.request_timeout(),
        )?;
        let links = ProcessorLinks {
            store: self.store.clone(),
            frames: frames_rx,
            publisher: self.detections.clone(),
            config_updates: self.config_publisher.subscribe(&detect_topic(&camera.name)),
            zone_updates: self.config_publisher.subscribe(&zones_topic(&camera.name)),
            metrics: Arc::clone(&metrics),
        };
        if camera.pose.enabled {
            warn!(
                "{}: pose estimation needs an estimator and classifier, none are built in",
                camera.name
            );
        }
        let processor = CameraProcessor::new(camera.clone(), &self.config.model, Box::new(client), links)
            .with_grid_source(communicator.requestor(self.request_timeout()));
        let processor = Arc::new(ProcessorThread::spawn(processor, self.tokens.processing.clone())?);

        let sink = FrameSink {
            camera: camera.name.clone(),
            shape: camera.frame_shape(),
            store: self.store.clone(),
            frames: frames_tx,
            metrics: Arc::clone(&metrics),
        };
        let mut supervisor = CaptureSupervisor::new(
            camera.clone(),
            sink,
            self.config.paths.cache_dir.clone(),
            RecoveryConfig::from(&self.config.watchdog),
            self.events.clone(),
            self.tokens.intake.clone(),
        );
        // a camera that cannot start yet is retried by its watchdog
        match supervisor.start() {
            Ok(()) => self.set_component_state(&component, ComponentState::Running),
            Err(e) => {
                error!("{}: capture failed to start: {}", camera.name, e);
                self.set_component_state(&component, ComponentState::Failed);
                self.events.publish(PipelineEvent::SystemError {
                    component: component.clone(),
                    error: e.to_string(),
                });
            }
        }

        let supervisor = Arc::new(Mutex::new(supervisor));
        let watchdog = tokio::spawn(run_camera_watchdog(
            Arc::clone(&supervisor),
            Duration::from_secs(self.config.watchdog.interval_secs),
            self.tokens.intake.clone(),
        ));

        self.cameras.push(CameraRuntime {
            name: camera.name,
            supervisor,
            processor,
            metrics,
            watchdog: Some(watchdog),
        });
        Ok(())
    }

    fn start_process_watchdog(&mut self) {
        let watchdog_config = &self.config.watchdog;
        let mut watchdog = ProcessWatchdog::new(
            watchdog_config.detection_stuck_secs,
            RecoveryConfig::from(watchdog_config),
            self.events.clone(),
        );
        for detector in &self.detectors {
            watchdog.add(Arc::clone(detector) as Arc<dyn SupervisedWorker>);
        }
        for camera in &self.cameras {
            watchdog.add(Arc::clone(&camera.processor) as Arc<dyn SupervisedWorker>);
        }

        let interval = Duration::from_secs(watchdog_config.interval_secs);
        let startup_delay = Duration::from_secs(watchdog_config.startup_delay_secs);
        self.process_watchdog = Some(tokio::spawn(watchdog.run(
            interval,
            startup_delay,
            self.tokens.supervision.clone(),
        )));
    }
}
