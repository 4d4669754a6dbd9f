use super::{EdgewatchOrchestrator, RunOutcome, ShutdownReason};
use crate::bus::{detect_topic, record_topic, zones_topic, ConfigPublisher};
use crate::config::EdgewatchConfig;
use crate::error::{BusError, EdgewatchError, Result};
use crate::events::{EventFilter, EventReceiver, PipelineEvent};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

/// Publish the hot-reloadable fragments of every camera in `config`.
/// Returns how many fragments went out.
pub fn publish_fragments(publisher: &ConfigPublisher, config: &EdgewatchConfig) -> std::result::Result<usize, BusError> {
    let mut published = 0;
    for camera in config.cameras.values() {
        publisher.publish(&detect_topic(&camera.name), &camera.detect)?;
        publisher.publish(&record_topic(&camera.name), &camera.record)?;
        publisher.publish(&zones_topic(&camera.name), &camera.zones)?;
        published += 3;
    }
    Ok(published)
}

impl EdgewatchOrchestrator {
    /// Run until a signal or an unrecoverable worker failure, then shut down
    pub async fn run(&mut self) -> Result<RunOutcome> {
        info!("Edgewatch pipeline is running");

        let (shutdown_sender, mut shutdown_receiver) = oneshot::channel();
        self.setup_signal_handlers(shutdown_sender);
        let mut hangup = hangup_stream();
        let mut requests = EventReceiver::new(
            &self.events,
            EventFilter::EventTypes(vec!["shutdown_requested"]),
            "runtime",
        );

        let mut watchdog = self
            .process_watchdog
            .take()
            .ok_or_else(|| EdgewatchError::system("Pipeline was not started"))?;

        let reason = loop {
            tokio::select! {
                received = &mut shutdown_receiver => {
                    break received.unwrap_or_else(|_| {
                        ShutdownReason::Error("Shutdown channel closed unexpectedly".to_string())
                    });
                }
                escalation = &mut watchdog => {
                    break match escalation {
                        Ok(Some(escalation)) => ShutdownReason::Escalation(escalation.to_string()),
                        Ok(None) => ShutdownReason::Error("Process watchdog stopped".to_string()),
                        Err(e) => ShutdownReason::Error(format!("Process watchdog failed: {}", e)),
                    };
                }
                request = requests.recv() => {
                    break match request {
                        Some(PipelineEvent::ShutdownRequested { reason, .. }) => ShutdownReason::Requested(reason),
                        _ => ShutdownReason::Error("Event bus closed".to_string()),
                    };
                }
                _ = next_hangup(&mut hangup) => {
                    if let Err(e) = self.reload_config() {
                        error!("Configuration reload failed: {}", e);
                        self.events.publish(PipelineEvent::SystemError {
                            component: "config".to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        };

        info!("Shutdown initiated: {:?}", reason);
        let exit_code = self.shutdown().await?;
        info!("Edgewatch pipeline shutdown complete");

        Ok(match reason {
            ShutdownReason::Escalation(reason) => RunOutcome::Restart(reason),
            ShutdownReason::Signal(_) | ShutdownReason::Requested(_) => RunOutcome::Exit(exit_code),
            ShutdownReason::Error(_) => RunOutcome::Exit(1),
        })
    }

    /// Re-read the configuration file and publish the camera fragments that
    /// can change while running
    pub fn reload_config(&self) -> Result<usize> {
        let Some(path) = self.config_path.as_ref() else {
            warn!("No configuration file to reload");
            return Ok(0);
        };
        info!("Reloading configuration from {}", path.display());
        let config = EdgewatchConfig::load_from_file(path)?;
        config.validate()?;

        let mut running = config.clone();
        running
            .cameras
            .retain(|name, _| self.cameras.iter().any(|c| &c.name == name));
        for name in config.cameras.keys().filter(|n| !running.cameras.contains_key(*n)) {
            warn!("Camera {} is not running, restart to add it", name);
        }
        let published = publish_fragments(&self.config_publisher, &running)?;
        info!("Published {} configuration fragments", published);
        Ok(published)
    }

    fn setup_signal_handlers(&self, shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        // Handle SIGTERM (systemd stop)
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                if let Some(()) = sigterm.recv().await {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        // Handle SIGINT (Ctrl+C)
        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }
}

#[cfg(unix)]
type Hangup = Option<signal::unix::Signal>;

#[cfg(not(unix))]
type Hangup = Option<()>;

#[cfg(unix)]
fn hangup_stream() -> Hangup {
    match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Configuration reload on SIGHUP unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn hangup_stream() -> Hangup {
    None
}

/// Resolves on the next SIGHUP, never when none can be received
async fn next_hangup(hangup: &mut Hangup) {
    #[cfg(unix)]
    if let Some(stream) = hangup.as_mut() {
        if stream.recv().await.is_some() {
            info!("Received SIGHUP signal");
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = hangup;
    std::future::pending::<()>().await
}
