use crate::frame::{frame_name, FrameShape, FrameTime, MonotonicClock};
use crate::frame_store::SharedFrameStore;
use crate::metrics::{CameraMetrics, EventsPerSecond};
use crossbeam::channel::{Sender, TrySendError};
use std::io::{ErrorKind, Read};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why the capture loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEnd {
    Cancelled,
    /// The decode process closed its output
    EndOfStream,
    ReadFailed(String),
    /// Nobody consumes frames any more
    QueueClosed,
}

/// Where captured frames go
#[derive(Clone)]
pub struct FrameSink {
    pub camera: String,
    pub shape: FrameShape,
    pub store: SharedFrameStore,
    pub frames: Sender<FrameTime>,
    pub metrics: Arc<CameraMetrics>,
}

impl FrameSink {
    /// Store one frame and hand its timestamp to the processor. A full queue
    /// drops the frame instead of waiting.
    fn publish(&self, frame_time: FrameTime, bytes: &[u8]) -> Result<bool, CaptureEnd> {
        let name = frame_name(&self.camera, frame_time);
        let buffer = match self.store.create(&name, bytes.len()) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("{}: cannot store frame {:.6}: {}", self.camera, frame_time, e);
                return Ok(false);
            }
        };
        if let Err(e) = buffer.write_once(bytes) {
            warn!("{}: cannot write frame {:.6}: {}", self.camera, frame_time, e);
            self.store.delete(&name);
            return Ok(false);
        }

        match self.frames.try_send(frame_time) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.store.delete(&name);
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.store.delete(&name);
                Err(CaptureEnd::QueueClosed)
            }
        }
    }
}

/// Read fixed-size I420 frames from `source` until it ends or `cancel`
/// fires. Frames that find the queue full are skipped and counted.
pub fn capture_frames<R: Read>(
    source: &mut R,
    sink: &FrameSink,
    clock: &mut MonotonicClock,
    cancel: &CancellationToken,
) -> CaptureEnd {
    let frame_size = sink.shape.yuv_size();
    let mut bytes = vec![0u8; frame_size];
    let mut camera_fps = EventsPerSecond::new();
    let mut skipped_fps = EventsPerSecond::new();
    camera_fps.start();
    skipped_fps.start();
    info!("{}: capturing {} byte frames", sink.camera, frame_size);

    loop {
        if cancel.is_cancelled() {
            return CaptureEnd::Cancelled;
        }

        let frame_time = clock.next();
        sink.metrics.current_frame_time.store(frame_time);
        if let Err(e) = source.read_exact(&mut bytes) {
            if cancel.is_cancelled() {
                return CaptureEnd::Cancelled;
            }
            return match e.kind() {
                ErrorKind::UnexpectedEof => {
                    debug!("{}: decode output ended", sink.camera);
                    CaptureEnd::EndOfStream
                }
                _ => CaptureEnd::ReadFailed(e.to_string()),
            };
        }

        camera_fps.update();
        sink.metrics.camera_fps.store(camera_fps.eps());
        sink.metrics.frames_captured.fetch_add(1, Ordering::Relaxed);

        let published = if sink.frames.is_full() {
            false
        } else {
            match sink.publish(frame_time, &bytes) {
                Ok(published) => published,
                Err(end) => return end,
            }
        };
        if !published {
            skipped_fps.update();
            sink.metrics.frames_skipped.fetch_add(1, Ordering::Relaxed);
            trace!("{}: skipped frame {:.6}", sink.camera, frame_time);
        }
        sink.metrics.skipped_fps.store(skipped_fps.eps());
    }
}
