//! Per-camera processing: motion, region scheduling, detection and tracking
//! for every frame the capture stage publishes.

pub mod processor;

use crate::detect::{Detection, DetectionClient};
use crate::error::DetectError;
use crate::frame::FrameShape;
use crate::region::DetectionRegion;

pub use processor::{CameraProcessor, ProcessorLinks};

/// Runs the object detector on one region of a frame
pub trait RegionDetector: Send {
    fn detect_region(
        &mut self,
        frame: &[u8],
        shape: FrameShape,
        region: DetectionRegion,
    ) -> Result<Vec<Detection>, DetectError>;

    /// Detector calls per second
    fn detection_fps(&mut self) -> f64;

    /// Release whatever the detector holds for this camera
    fn close(self: Box<Self>) {}
}

impl RegionDetector for DetectionClient {
    fn detect_region(
        &mut self,
        frame: &[u8],
        shape: FrameShape,
        region: DetectionRegion,
    ) -> Result<Vec<Detection>, DetectError> {
        DetectionClient::detect_region(self, frame, shape, region)
    }

    fn detection_fps(&mut self) -> f64 {
        DetectionClient::detection_fps(self)
    }

    fn close(self: Box<Self>) {
        DetectionClient::close(*self)
    }
}
