use super::{ComponentState, EdgewatchOrchestrator};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// How long each stage may take to wind down before it is forced
const STAGE_GRACE: Duration = Duration::from_secs(10);

impl EdgewatchOrchestrator {
    /// Stop intake, drain the queues, stop the workers, then persist state.
    /// Returns the exit code.
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        let mut exit_code = 0;

        self.tokens.supervision.cancel();
        if let Some(watchdog) = self.process_watchdog.take() {
            watchdog.abort();
        }

        if !self.stop_capture().await {
            exit_code = 1;
        }
        if !self.stop_processors().await {
            exit_code = 1;
        }
        if !self.stop_detectors().await {
            exit_code = 1;
        }
        if !self.stop_review().await {
            exit_code = 1;
        }
        self.stop_communicator().await;

        if let Err(e) = self.registry.save(&self.config.paths.region_grids()) {
            warn!("Failed to save region grids: {}", e);
        }
        let leaked = self.store.report_leaks();
        if leaked > 0 {
            error!("{} frame buffers leaked at shutdown", leaked);
            self.store.delete_prefix("");
        }

        self.tokens.workers.cancel();
        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Capture watchdogs stop their supervisors once intake is cancelled. A
    /// supervisor whose watchdog is gone is stopped here.
    async fn stop_capture(&mut self) -> bool {
        info!("Stopping capture");
        self.tokens.intake.cancel();
        let mut clean = true;
        for camera in &mut self.cameras {
            let grace = self
                .config
                .cameras
                .get(&camera.name)
                .map(|c| Duration::from_secs(c.ffmpeg.terminate_grace_secs))
                .unwrap_or_default();
            let stopped = match camera.watchdog.take() {
                Some(watchdog) => match timeout(grace + STAGE_GRACE, watchdog).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        error!("{}: capture watchdog failed: {}", camera.name, e);
                        false
                    }
                    Err(_) => {
                        error!("{}: capture stop timeout", camera.name);
                        false
                    }
                },
                None => false,
            };
            if stopped {
                continue;
            }

            // the watchdog never stopped its supervisor
            clean = false;
            let supervisor = Arc::clone(&camera.supervisor);
            let stopping = tokio::task::spawn_blocking(move || supervisor.lock().shutdown());
            if timeout(grace + STAGE_GRACE, stopping).await.is_err() {
                error!("{}: capture supervisor did not stop", camera.name);
            }
        }
        clean
    }

    /// Frames already queued are processed before the loops exit
    async fn stop_processors(&mut self) -> bool {
        info!("Draining frame queues");
        // dropping the supervisors closes the queues
        let processors: Vec<_> = self
            .cameras
            .drain(..)
            .map(|camera| (camera.name, camera.processor))
            .collect();

        let mut clean = true;
        for (name, processor) in &processors {
            let component = format!("camera:{}", name);
            self.set_component_state(&component, ComponentState::Stopping);
            let joining = Arc::clone(processor);
            let joined = tokio::task::spawn_blocking(move || joining.join(STAGE_GRACE))
                .await
                .unwrap_or(false);
            if joined {
                self.set_component_state(&component, ComponentState::Stopped);
            } else {
                warn!("{}: queue not drained in time, cancelling", name);
                clean = false;
            }
        }

        if !clean {
            self.tokens.processing.cancel();
            for (name, processor) in &processors {
                let joining = Arc::clone(processor);
                let joined = tokio::task::spawn_blocking(move || joining.join(STAGE_GRACE))
                    .await
                    .unwrap_or(false);
                let component = format!("camera:{}", name);
                if joined {
                    self.set_component_state(&component, ComponentState::Stopped);
                } else {
                    error!("{}: processing did not stop", name);
                    self.set_component_state(&component, ComponentState::Failed);
                }
            }
        }
        self.tokens.processing.cancel();
        clean
    }

    async fn stop_detectors(&mut self) -> bool {
        let detectors = std::mem::take(&mut self.detectors);
        let mut clean = true;
        for detector in detectors {
            let component = format!("detector:{}", detector.name());
            self.set_component_state(&component, ComponentState::Stopping);
            let stopping = Arc::clone(&detector);
            let stopped = tokio::task::spawn_blocking(move || {
                stopping.stop(STAGE_GRACE);
                !stopping.is_alive()
            })
            .await
            .unwrap_or(false);
            if stopped {
                self.set_component_state(&component, ComponentState::Stopped);
            } else {
                self.set_component_state(&component, ComponentState::Failed);
                clean = false;
            }
        }
        clean
    }

    /// The maintainer ends every open segment on its way out
    async fn stop_review(&mut self) -> bool {
        let Some(handle) = self.review.take() else {
            return true;
        };
        self.set_component_state("review", ComponentState::Stopping);
        self.tokens.review.cancel();
        match timeout(
            STAGE_GRACE,
            tokio::task::spawn_blocking(move || handle.join().is_ok()),
        )
        .await
        {
            Ok(Ok(true)) => {
                self.set_component_state("review", ComponentState::Stopped);
                true
            }
            Ok(_) => {
                error!("Review maintainer panicked");
                self.set_component_state("review", ComponentState::Failed);
                false
            }
            Err(_) => {
                error!("Review maintainer stop timeout");
                self.set_component_state("review", ComponentState::Failed);
                false
            }
        }
    }

    async fn stop_communicator(&mut self) {
        if let Some(mut communicator) = self.communicator.take() {
            self.set_component_state("communicator", ComponentState::Stopping);
            if tokio::task::spawn_blocking(move || communicator.stop())
                .await
                .is_err()
            {
                warn!("Communicator stop panicked");
            }
            self.set_component_state("communicator", ComponentState::Stopped);
        }
    }
}
