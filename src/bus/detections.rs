use crate::error::BusError;
use crate::frame::FrameTime;
use crate::geometry::BoundingBox;
use crate::track::TrackedObjectSnapshot;
use crossbeam::channel::{bounded, select, unbounded, Receiver, RecvError, Sender, TryRecvError, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-frame results published by a camera processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDetections {
    pub camera: String,
    pub frame_time: FrameTime,
    pub objects: Vec<TrackedObjectSnapshot>,
    pub motion_boxes: Vec<BoundingBox>,
    pub regions: Vec<BoundingBox>,
}

/// Labels heard by an audio source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDetections {
    pub camera: String,
    pub frame_time: FrameTime,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualEventState {
    /// Open-ended event, pins the segment until ended
    Start,
    /// Event with a known end time
    Complete,
    End,
}

/// Externally created event (API or integration)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualEvent {
    pub camera: String,
    pub frame_time: FrameTime,
    pub event_id: String,
    pub label: String,
    pub state: ManualEventState,
    #[serde(default)]
    pub end_time: Option<FrameTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DetectionPayload {
    Video(VideoDetections),
    Audio(AudioDetections),
    Api(ManualEvent),
}

impl DetectionPayload {
    pub fn camera(&self) -> &str {
        match self {
            DetectionPayload::Video(v) => &v.camera,
            DetectionPayload::Audio(a) => &a.camera,
            DetectionPayload::Api(m) => &m.camera,
        }
    }

    pub fn frame_time(&self) -> FrameTime {
        match self {
            DetectionPayload::Video(v) => v.frame_time,
            DetectionPayload::Audio(a) => a.frame_time,
            DetectionPayload::Api(m) => m.frame_time,
        }
    }

    /// Audio and manual payloads are never dropped
    pub fn is_lossless(&self) -> bool {
        !matches!(self, DetectionPayload::Video(_))
    }
}

struct Lanes {
    video: Sender<DetectionPayload>,
    events: Sender<DetectionPayload>,
}

/// Fans detections out to every subscriber. Video payloads go through a
/// bounded lane, so a subscriber that falls behind loses frames rather than
/// stalling the publisher. Audio and manual payloads use an unbounded lane.
#[derive(Clone)]
pub struct DetectionPublisher {
    subscribers: Arc<RwLock<Vec<Lanes>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl DetectionPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::default(),
            capacity: capacity.max(1),
            dropped: Arc::default(),
        }
    }

    pub fn subscribe(&self) -> DetectionSubscriber {
        let (video_tx, video) = bounded(self.capacity);
        let (events_tx, events) = unbounded();
        self.subscribers.write().push(Lanes {
            video: video_tx,
            events: events_tx,
        });
        DetectionSubscriber { video, events }
    }

    pub fn publish(&self, payload: DetectionPayload) {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        let lossless = payload.is_lossless();
        subscribers.retain(|lanes| {
            if lossless {
                return lanes.events.send(payload.clone()).is_ok();
            }
            match lanes.video.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total % 100 == 1 {
                        warn!(
                            "Detection subscriber is behind, dropped {} payloads so far",
                            total
                        );
                    }
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        if subscribers.len() != before {
            debug!("Pruned {} disconnected detection subscribers", before - subscribers.len());
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

pub struct DetectionSubscriber {
    video: Receiver<DetectionPayload>,
    events: Receiver<DetectionPayload>,
}

impl DetectionSubscriber {
    /// Wait up to `timeout` for the next payload. Audio and manual payloads
    /// are served ahead of queued video. `Ok(None)` means nothing arrived in
    /// time; `Err(BusError::Disconnected)` means every publisher is gone.
    pub fn get_data(&self, timeout: Duration) -> Result<Option<DetectionPayload>, BusError> {
        if let Ok(payload) = self.events.try_recv() {
            return Ok(Some(payload));
        }
        select! {
            recv(self.events) -> payload => received(payload, &self.video),
            recv(self.video) -> payload => received(payload, &self.events),
            default(timeout) => Ok(None),
        }
    }

    /// Next payload without waiting
    pub fn try_get(&self) -> Option<DetectionPayload> {
        self.events.try_recv().or_else(|_| self.video.try_recv()).ok()
    }
}

/// A lane reports disconnect once it is empty; the other lane may still
/// hold payloads
fn received(
    payload: Result<DetectionPayload, RecvError>,
    other: &Receiver<DetectionPayload>,
) -> Result<Option<DetectionPayload>, BusError> {
    match payload {
        Ok(payload) => Ok(Some(payload)),
        Err(RecvError) => match other.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(BusError::Disconnected),
        },
    }
}
