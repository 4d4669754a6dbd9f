use super::backend::decode_result;
use super::{
    input_buffer_name, output_buffer_name, output_buffer_size, Detection, DetectionJob,
    DetectionQueue, DetectionSignals, RESULT_ROW_BYTES,
};
use crate::config::ModelConfig;
use crate::error::{DetectError, FrameStoreError};
use crate::frame::{crop_to_rgb, FrameShape};
use crate::frame_store::{FrameBuffer, SharedFrameStore};
use crate::geometry::BoundingBox;
use crate::metrics::EventsPerSecond;
use crate::region::DetectionRegion;
use crossbeam::channel::{Receiver, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A camera's connection to the detector pool. At most one request is
/// outstanding at a time.
pub struct DetectionClient {
    name: String,
    model_width: u32,
    model_height: u32,
    labelmap: Vec<String>,
    max_detections: usize,
    queue: DetectionQueue,
    completions: Receiver<u64>,
    latest: Arc<AtomicU64>,
    seq: u64,
    store: SharedFrameStore,
    input: FrameBuffer,
    timeout: Duration,
    fps: EventsPerSecond,
}

impl DetectionClient {
    pub fn new(
        name: &str,
        model: &ModelConfig,
        max_detections: usize,
        queue: DetectionQueue,
        signals: &DetectionSignals,
        store: SharedFrameStore,
        timeout: Duration,
    ) -> Result<Self, FrameStoreError> {
        let input_size = model.width as usize * model.height as usize * 3;
        let input = store.create_or_open(&input_buffer_name(name), input_size)?;
        store.create_or_open(&output_buffer_name(name), output_buffer_size(max_detections))?;
        let signal = signals.register(name);
        let seq = signal.latest.load(Ordering::Acquire);
        Ok(Self {
            name: name.to_string(),
            model_width: model.width,
            model_height: model.height,
            labelmap: model.labelmap.clone(),
            max_detections,
            queue,
            completions: signal.completions,
            latest: signal.latest,
            seq,
            store,
            input,
            timeout,
            fps: EventsPerSecond::new(),
        })
    }

    pub fn detection_fps(&mut self) -> f64 {
        self.fps.eps()
    }

    /// Run the detector on a model-sized tensor. Returns `(label, score,
    /// [y_min, x_min, y_max, x_max])` with coordinates relative to the tensor.
    pub fn detect(&mut self, tensor: &[u8]) -> Result<Vec<(String, f32, [f32; 4])>, DetectError> {
        let expected = self.model_width as usize * self.model_height as usize * 3;
        if tensor.len() != expected {
            return Err(DetectError::TensorSize {
                expected,
                actual: tensor.len(),
            });
        }

        // drop completions left behind by an abandoned worker
        while self.completions.try_recv().is_ok() {}

        self.seq += 1;
        let seq = self.seq;
        self.latest.store(seq, Ordering::Release);
        self.input.overwrite(tensor).map_err(|e| DetectError::Backend {
            details: e.to_string(),
        })?;
        let job = DetectionJob {
            connection: self.name.clone(),
            seq,
        };
        match self.queue.sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                return Err(DetectError::QueueUnavailable {
                    worker: self.name.clone(),
                })
            }
        }

        self.wait_for(seq)?;
        self.fps.update();

        let output_name = output_buffer_name(&self.name);
        let view = self
            .store
            .get(&output_name, (self.max_detections + 1, RESULT_ROW_BYTES))
            .map_err(|e| DetectError::Backend {
                details: e.to_string(),
            })?;
        let result = decode_result(&view.data());
        self.store.close(&output_name);

        let rows = match result {
            Some((written, rows)) if written == seq => rows,
            _ => {
                return Err(DetectError::StaleResult {
                    worker: self.name.clone(),
                    seq,
                })
            }
        };

        Ok(rows
            .into_iter()
            .take_while(|row| row.score > 0.0)
            .filter_map(|row| {
                let label = self.labelmap.get(row.class_id as usize)?;
                Some((label.clone(), row.score, [row.y_min, row.x_min, row.y_max, row.x_max]))
            })
            .collect())
    }

    /// Block until the worker reports job `seq`, skipping completions of
    /// earlier jobs that timed out
    fn wait_for(&self, seq: u64) -> Result<(), DetectError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(done) if done == seq => return Ok(()),
                Ok(stale) => debug!("{}: ignoring late result of job {}", self.name, stale),
                Err(_) => {
                    return Err(DetectError::Timeout {
                        worker: self.name.clone(),
                        timeout: self.timeout,
                    })
                }
            }
        }
    }

    /// Detect objects in `region` of an I420 frame and map them back to
    /// frame coordinates. Detections entirely outside the frame are dropped.
    pub fn detect_region(
        &mut self,
        frame: &[u8],
        shape: FrameShape,
        region: DetectionRegion,
    ) -> Result<Vec<Detection>, DetectError> {
        let tensor = crop_to_rgb(frame, shape, region.bbox, self.model_width, self.model_height);
        let raw = self.detect(&tensor)?;
        let detections: Vec<Detection> = raw
            .into_iter()
            .filter_map(|(label, score, rel)| {
                rescale(shape, &region.bbox, rel).map(|bbox| Detection::new(&label, score, bbox, region))
            })
            .collect();
        debug!(
            "{}: {} detections in region {:?}",
            self.name,
            detections.len(),
            region.bbox
        );
        Ok(detections)
    }

    /// Release the connection's buffers
    pub fn close(self) {
        self.store.delete(&input_buffer_name(&self.name));
        self.store.delete(&output_buffer_name(&self.name));
    }
}

/// Map tensor-relative `[y_min, x_min, y_max, x_max]` into frame pixels,
/// clamped to the frame
pub fn rescale(shape: FrameShape, region: &BoundingBox, rel: [f32; 4]) -> Option<BoundingBox> {
    let size = region.width() as f32;
    let (w, h) = (shape.width as i32, shape.height as i32);
    let y_min = (rel[0] * size) as i32 + region.y0;
    let x_min = (rel[1] * size) as i32 + region.x0;
    let y_max = (rel[2] * size) as i32 + region.y0;
    let x_max = (rel[3] * size) as i32 + region.x0;
    if x_min >= w || y_min >= h || x_max <= 0 || y_max <= 0 {
        return None;
    }
    let bbox = BoundingBox::new(x_min.max(0), y_min.max(0), x_max.min(w), y_max.min(h));
    if bbox.area() == 0 {
        None
    } else {
        Some(bbox)
    }
}
