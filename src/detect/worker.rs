use super::backend::{encode_result, DetectorFactory, ObjectDetector, RawDetection};
use super::{
    input_buffer_name, output_buffer_name, output_buffer_size, DetectionJob, DetectionQueue,
    DetectionSignals,
};
use crate::config::{DetectorConfig, ModelConfig};
use crate::frame::now_timestamp;
use crate::frame_store::SharedFrameStore;
use crate::metrics::DetectorMetrics;
use crossbeam::channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct WorkerThread {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Everything a worker thread needs, cloned into each (re)start
#[derive(Clone)]
struct WorkerContext {
    name: String,
    queue: DetectionQueue,
    signals: DetectionSignals,
    store: SharedFrameStore,
    metrics: Arc<DetectorMetrics>,
    factory: DetectorFactory,
    model_width: u32,
    model_height: u32,
    confidence_floor: f32,
    max_detections: usize,
}

/// Supervised detector worker. Restarting replaces the thread; a stuck
/// thread is abandoned and its late results are ignored by the client.
pub struct DetectorProcess {
    context: WorkerContext,
    parent_cancel: CancellationToken,
    thread: Mutex<Option<WorkerThread>>,
}

impl DetectorProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        config: &DetectorConfig,
        model: &ModelConfig,
        factory: DetectorFactory,
        queue: DetectionQueue,
        signals: DetectionSignals,
        store: SharedFrameStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context: WorkerContext {
                name: name.to_string(),
                queue,
                signals,
                store,
                metrics: Arc::new(DetectorMetrics::default()),
                factory,
                model_width: model.width,
                model_height: model.height,
                confidence_floor: config.confidence_floor,
                max_detections: config.max_detections,
            },
            parent_cancel: cancel,
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn metrics(&self) -> Arc<DetectorMetrics> {
        Arc::clone(&self.context.metrics)
    }

    /// Timestamp the in-flight detection started, 0 when idle
    pub fn detection_start(&self) -> f64 {
        self.context.metrics.detection_start.load()
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn start_or_restart(&self) -> std::io::Result<()> {
        let mut slot = self.thread.lock();
        if let Some(old) = slot.take() {
            old.cancel.cancel();
            if old.handle.is_finished() {
                let _ = old.handle.join();
            } else {
                warn!("Abandoning unresponsive detector thread {}", self.context.name);
            }
        }

        self.context.metrics.detection_start.store(0.0);
        let cancel = self.parent_cancel.child_token();
        let context = self.context.clone();
        let thread_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("detector:{}", self.context.name))
            .spawn(move || run_detector(context, thread_cancel))?;

        *slot = Some(WorkerThread { handle, cancel });
        info!("Detector {} started", self.context.name);
        Ok(())
    }

    /// Stop the worker, waiting briefly for it to exit
    pub fn stop(&self, grace: Duration) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        thread.cancel.cancel();
        let deadline = Instant::now() + grace;
        while !thread.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if thread.handle.is_finished() {
            let _ = thread.handle.join();
            info!("Detector {} stopped", self.context.name);
        } else {
            warn!("Detector {} did not stop within {:?}", self.context.name, grace);
        }
    }
}

fn run_detector(context: WorkerContext, cancel: CancellationToken) {
    let mut detector = match (context.factory)() {
        Ok(detector) => detector,
        Err(e) => {
            error!("Detector {} failed to initialise: {}", context.name, e);
            return;
        }
    };
    debug!("Detector {} using backend {}", context.name, detector.name());

    while !cancel.is_cancelled() {
        let job = match context.queue.receiver.recv_timeout(Duration::from_secs(1)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        run_job(&context, detector.as_mut(), &job);
    }
    debug!("Detector {} loop exited", context.name);
}

fn run_job(context: &WorkerContext, detector: &mut dyn ObjectDetector, job: &DetectionJob) {
    let connection = job.connection.as_str();
    // the client gave up on this job and has queued a newer one
    if !context.signals.is_current(connection, job.seq) {
        debug!("Detector {} skipping stale job {} for {}", context.name, job.seq, connection);
        return;
    }

    let input_name = input_buffer_name(connection);
    let dims = (context.model_height as usize, context.model_width as usize * 3);
    let tensor = match context.store.get(&input_name, dims) {
        Ok(view) => {
            let tensor = view.to_vec();
            context.store.close(&input_name);
            tensor
        }
        Err(e) => {
            warn!("Detector {} cannot read input for {}: {}", context.name, connection, e);
            return;
        }
    };

    context.metrics.detection_start.store(now_timestamp());
    let started = Instant::now();
    let result = detector.detect_raw(&tensor, context.model_width, context.model_height);
    context.metrics.record_inference(started.elapsed().as_secs_f64());
    context.metrics.detection_start.store(0.0);

    let detections: Vec<RawDetection> = match result {
        Ok(raw) => raw
            .into_iter()
            .filter(|d| d.score >= context.confidence_floor)
            .take(context.max_detections)
            .collect(),
        Err(e) => {
            // report nothing so the client is not left waiting
            error!("Detector {} failed on {}: {}", context.name, connection, e);
            Vec::new()
        }
    };

    if !context.signals.is_current(connection, job.seq) {
        debug!("Detector {} dropping late result of job {} for {}", context.name, job.seq, connection);
        return;
    }

    let output_name = output_buffer_name(connection);
    let encoded = encode_result(job.seq, &detections, context.max_detections);
    let written = context
        .store
        .create_or_open(&output_name, output_buffer_size(context.max_detections))
        .and_then(|out| out.overwrite(&encoded));
    if let Err(e) = written {
        warn!("Detector {} cannot write results for {}: {}", context.name, connection, e);
        return;
    }
    context.signals.notify(connection, job.seq);
}
