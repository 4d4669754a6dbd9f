use crate::review::{ReviewEventKind, ReviewSegmentRecord};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events that can occur in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A review segment was opened, updated or closed
    Review {
        kind: ReviewEventKind,
        before: ReviewSegmentRecord,
        after: ReviewSegmentRecord,
    },
    /// Frames started or stopped arriving from a camera
    CameraStatusChanged {
        camera: String,
        connected: bool,
        timestamp: SystemTime,
    },
    /// A supervised worker was restarted
    WorkerRestarted { worker: String, reason: String },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl PipelineEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            PipelineEvent::Review { kind, after, .. } => {
                format!(
                    "Review segment {} {} on {} ({})",
                    after.id,
                    kind.as_str(),
                    after.camera,
                    after.severity.as_str()
                )
            }
            PipelineEvent::CameraStatusChanged {
                camera, connected, ..
            } => {
                format!(
                    "Camera {} {}",
                    camera,
                    if *connected {
                        "connected"
                    } else {
                        "disconnected"
                    }
                )
            }
            PipelineEvent::WorkerRestarted { worker, reason } => {
                format!("Worker {} restarted: {}", worker, reason)
            }
            PipelineEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            PipelineEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::Review { .. } => "review",
            PipelineEvent::CameraStatusChanged { .. } => "camera_status_changed",
            PipelineEvent::WorkerRestarted { .. } => "worker_restarted",
            PipelineEvent::SystemError { .. } => "system_error",
            PipelineEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Event bus for component coordination using broadcast channels
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, returning how many subscribers received it.
    /// Callable from plain threads.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        match &event {
            PipelineEvent::Review { kind, after, .. } => {
                info!(
                    "Review segment {} {} on {} (severity {})",
                    after.id,
                    kind.as_str(),
                    after.camera,
                    after.severity.as_str()
                );
            }
            PipelineEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            PipelineEvent::CameraStatusChanged {
                camera, connected, ..
            } => {
                if *connected {
                    info!("Camera {} connected", camera);
                } else {
                    warn!("Camera {} disconnected", camera);
                }
            }
            PipelineEvent::WorkerRestarted { worker, reason } => {
                warn!("Worker {} restarted: {}", worker, reason);
            }
            PipelineEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
        }

        // no subscribers is not an error for fire-and-forget events
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    All,
    EventTypes(Vec<&'static str>),
    Cameras(Vec<String>),
}

impl EventFilter {
    pub fn matches(&self, event: &PipelineEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Cameras(cameras) => match event {
                PipelineEvent::Review { after, .. } => cameras.contains(&after.camera),
                PipelineEvent::CameraStatusChanged { camera, .. } => cameras.contains(camera),
                _ => false,
            },
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(bus: &EventBus, filter: EventFilter, name: &str) -> Self {
        Self {
            receiver: bus.subscribe(),
            filter,
            name: name.to_string(),
        }
    }

    /// Receive the next matching event, `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        debug!(
                            "Receiver '{}' received event: {}",
                            self.name,
                            event.description()
                        );
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return None;
                }
            }
        }
    }
}
