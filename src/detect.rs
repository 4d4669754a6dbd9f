//! Object detection offloaded to worker threads.
//!
//! A camera processor writes a model-sized RGB tensor into its input buffer,
//! queues a job naming it and waits on its completion signal. Any idle worker
//! picks the job up, runs the backend and writes fixed-size result rows to the
//! camera's output buffer.

pub mod backend;
pub mod client;
pub mod filters;
pub mod worker;

use crate::geometry::BoundingBox;
use crate::region::DetectionRegion;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use backend::{decode_result, encode_result, factory_for, DetectorFactory, ExternalProcessDetector, NullDetector, ObjectDetector, RawDetection};
pub use client::DetectionClient;
pub use filters::{attribute_applies, filter_detections, is_attribute_label, reduce_detections};
pub use worker::DetectorProcess;

/// Values per result row: class id, score, y_min, x_min, y_max, x_max
pub const RESULT_ROW_LEN: usize = 6;

/// Bytes of one result row. The first row of a result buffer is a header
/// holding the job sequence number.
pub const RESULT_ROW_BYTES: usize = RESULT_ROW_LEN * 4;

/// One object found in a frame, in frame pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
    pub area: i64,
    pub ratio: f32,
    pub region: DetectionRegion,
}

impl Detection {
    pub fn new(label: &str, score: f32, bbox: BoundingBox, region: DetectionRegion) -> Self {
        Self {
            label: label.to_string(),
            score,
            bbox,
            area: bbox.area(),
            ratio: bbox.ratio(),
            region,
        }
    }
}

/// Name of the tensor buffer for a camera's detector connection
pub fn input_buffer_name(camera: &str) -> String {
    format!("detect-in-{}", camera)
}

/// Name of the result buffer for a camera's detector connection
pub fn output_buffer_name(camera: &str) -> String {
    format!("detect-out-{}", camera)
}

/// Bytes of the result buffer for `max_detections` rows plus the header row
pub fn output_buffer_size(max_detections: usize) -> usize {
    (max_detections + 1) * RESULT_ROW_BYTES
}

/// One queued detection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionJob {
    pub connection: String,
    pub seq: u64,
}

/// Shared job queue every detector worker pulls from
#[derive(Clone)]
pub struct DetectionQueue {
    pub sender: Sender<DetectionJob>,
    pub receiver: Receiver<DetectionJob>,
}

impl DetectionQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self { sender, receiver }
    }
}

struct Connection {
    tx: Sender<u64>,
    rx: Receiver<u64>,
    latest: Arc<AtomicU64>,
}

/// Client side of a registered connection
pub struct ConnectionSignal {
    /// Fires with the sequence number of each completed job
    pub completions: Receiver<u64>,
    /// Sequence number of the job the client is waiting on
    pub latest: Arc<AtomicU64>,
}

/// Per-connection completion signals
#[derive(Clone, Default)]
pub struct DetectionSignals {
    signals: Arc<RwLock<HashMap<String, Connection>>>,
}

impl DetectionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> ConnectionSignal {
        let mut signals = self.signals.write();
        let connection = signals.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = unbounded();
            Connection {
                tx,
                rx,
                latest: Arc::new(AtomicU64::new(0)),
            }
        });
        ConnectionSignal {
            completions: connection.rx.clone(),
            latest: Arc::clone(&connection.latest),
        }
    }

    /// Whether `seq` is still the job the connection is waiting on
    pub fn is_current(&self, name: &str, seq: u64) -> bool {
        self.signals
            .read()
            .get(name)
            .map(|c| c.latest.load(Ordering::Acquire) == seq)
            .unwrap_or(false)
    }

    pub fn notify(&self, name: &str, seq: u64) -> bool {
        match self.signals.read().get(name) {
            Some(connection) => connection.tx.send(seq).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests;
