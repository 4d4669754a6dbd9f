//! Motion detection over the luma plane of I420 frames.

use crate::config::MotionConfig;
use crate::frame::FrameShape;
use crate::geometry::BoundingBox;
use image::imageops::{resize, FilterType};
use image::{GrayImage, Luma};
use imageproc::{
    contrast::threshold,
    distance_transform::Norm,
    filter::gaussian_blur_f32,
    morphology::dilate,
    region_labelling::{connected_components, Connectivity},
};
use std::collections::HashMap;
use tracing::{debug, info};

/// Share of changed pixels that means the scene itself changed (lighting,
/// camera moved) rather than something moving in it
const RECALIBRATE_RATIO: f32 = 0.7;

/// Finds moving areas in consecutive frames of one camera
pub trait MotionDetector: Send {
    /// Boxes of changed areas in frame pixel coordinates
    fn detect(&mut self, frame: &[u8]) -> Vec<BoundingBox>;

    /// True while the background is still settling; stationary suppression
    /// is disabled meanwhile
    fn is_calibrating(&self) -> bool;
}

/// Running-average background subtraction at reduced resolution
pub struct FrameDeltaMotionDetector {
    config: MotionConfig,
    shape: FrameShape,
    motion_width: u32,
    motion_height: u32,
    average: Option<Vec<f32>>,
    calibration_left: u32,
}

impl FrameDeltaMotionDetector {
    pub fn new(shape: FrameShape, config: MotionConfig) -> Self {
        let motion_height = config.frame_height.clamp(1, shape.height.max(1));
        let scale = motion_height as f32 / shape.height.max(1) as f32;
        let motion_width = ((shape.width as f32 * scale) as u32).max(1);
        info!(
            "Motion detection at {}x{} for {}x{} frames",
            motion_width, motion_height, shape.width, shape.height
        );
        Self {
            calibration_left: config.calibration_frames,
            config,
            shape,
            motion_width,
            motion_height,
            average: None,
        }
    }

    pub fn motion_dims(&self) -> (u32, u32) {
        (self.motion_width, self.motion_height)
    }

    fn luma(&self, frame: &[u8]) -> Option<GrayImage> {
        let plane = self.shape.width as usize * self.shape.height as usize;
        let luma = GrayImage::from_raw(self.shape.width, self.shape.height, frame.get(..plane)?.to_vec())?;
        let small = resize(&luma, self.motion_width, self.motion_height, FilterType::Triangle);
        Some(gaussian_blur_f32(&small, 1.0))
    }

    fn start_calibration(&mut self) {
        self.calibration_left = self.config.calibration_frames.max(1);
    }

    fn update_average(&mut self, current: &GrayImage) {
        let alpha = if self.calibration_left > 0 {
            0.2
        } else {
            self.config.frame_alpha
        };
        let average = self
            .average
            .get_or_insert_with(|| current.pixels().map(|p| p[0] as f32).collect());
        for (avg, px) in average.iter_mut().zip(current.pixels()) {
            *avg = *avg * (1.0 - alpha) + px[0] as f32 * alpha;
        }
    }

    fn to_frame_box(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> BoundingBox {
        let sx = self.shape.width as f32 / self.motion_width as f32;
        let sy = self.shape.height as f32 / self.motion_height as f32;
        BoundingBox::new(
            (x0 as f32 * sx) as i32,
            (y0 as f32 * sy) as i32,
            (((x1 + 1) as f32 * sx) as i32).min(self.shape.width as i32),
            (((y1 + 1) as f32 * sy) as i32).min(self.shape.height as i32),
        )
    }
}

impl MotionDetector for FrameDeltaMotionDetector {
    fn detect(&mut self, frame: &[u8]) -> Vec<BoundingBox> {
        let Some(current) = self.luma(frame) else {
            debug!("Frame too short for motion detection");
            return Vec::new();
        };

        let Some(average) = self.average.as_ref() else {
            self.update_average(&current);
            return Vec::new();
        };

        let mut delta = GrayImage::new(self.motion_width, self.motion_height);
        for ((out, px), avg) in delta.pixels_mut().zip(current.pixels()).zip(average.iter()) {
            *out = Luma([(px[0] as f32 - avg).abs().min(255.0) as u8]);
        }
        let mask = dilate(&threshold(&delta, self.config.threshold), Norm::LInf, 2);

        let changed = mask.pixels().filter(|p| p[0] > 0).count();
        let total = (self.motion_width * self.motion_height) as usize;
        let recalibrate = changed as f32 > total as f32 * RECALIBRATE_RATIO;
        if recalibrate {
            debug!("{} of {} pixels changed, recalibrating", changed, total);
            self.start_calibration();
        }

        let boxes = if self.calibration_left > 0 {
            if !recalibrate {
                self.calibration_left -= 1;
            }
            Vec::new()
        } else {
            let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
            // label -> (x0, y0, x1, y1, pixels)
            let mut blobs: HashMap<u32, (u32, u32, u32, u32, usize)> = HashMap::new();
            for (x, y, label) in labels.enumerate_pixels() {
                if label[0] == 0 {
                    continue;
                }
                let blob = blobs.entry(label[0]).or_insert((x, y, x, y, 0));
                blob.0 = blob.0.min(x);
                blob.1 = blob.1.min(y);
                blob.2 = blob.2.max(x);
                blob.3 = blob.3.max(y);
                blob.4 += 1;
            }
            let mut boxes: Vec<BoundingBox> = blobs
                .into_values()
                .filter(|blob| blob.4 > self.config.contour_area)
                .map(|(x0, y0, x1, y1, _)| self.to_frame_box(x0, y0, x1, y1))
                .collect();
            boxes.sort_by_key(|b| (b.y0, b.x0));
            boxes
        };

        self.update_average(&current);
        boxes
    }

    fn is_calibrating(&self) -> bool {
        self.calibration_left > 0
    }
}
