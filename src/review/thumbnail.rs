use crate::frame::{crop_to_rgb, FrameShape};
use crate::geometry::BoundingBox;
use image::error::{ParameterError, ParameterErrorKind};
use image::{ImageError, ImageFormat, ImageResult, RgbImage};
use std::path::{Path, PathBuf};

/// Margin around the active objects
const CROP_MULTIPLIER: f32 = 1.25;
const MIN_CROP_SIZE: i32 = 200;

/// A 16:9 crop of the frame centered on `area`, or `None` when the frame
/// cannot hold one large enough.
pub fn crop_16_9(shape: FrameShape, area: BoundingBox) -> Option<BoundingBox> {
    let (frame_w, frame_h) = (shape.width as i32, shape.height as i32);
    let mut w = ((area.width() as f32 * CROP_MULTIPLIER) as i32).max(MIN_CROP_SIZE);
    let mut h = ((area.height() as f32 * CROP_MULTIPLIER) as i32).max(MIN_CROP_SIZE);
    if w * 9 >= h * 16 {
        h = w * 9 / 16;
    } else {
        w = h * 16 / 9;
    }
    w = w / 4 * 4;
    h = h / 4 * 4;
    if w > frame_w || h > frame_h {
        return None;
    }

    let (cx, cy) = area.center();
    let x0 = ((cx - w as f32 / 2.0) as i32).clamp(0, frame_w - w);
    let y0 = ((cy - h as f32 / 2.0) as i32).clamp(0, frame_h - h);
    Some(BoundingBox::new(x0, y0, x0 + w, y0 + h))
}

/// Writes segment thumbnails as JPEG under `<clips>/review`
#[derive(Debug, Clone)]
pub struct ThumbnailWriter {
    dir: PathBuf,
    height: u32,
}

impl ThumbnailWriter {
    pub fn new(clips_dir: &Path, height: u32) -> Self {
        Self {
            dir: clips_dir.join("review"),
            height: height.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    /// Scale `area` of an I420 frame to the thumbnail height and save it
    pub fn write(&self, path: &Path, frame: &[u8], shape: FrameShape, area: BoundingBox) -> ImageResult<()> {
        let area = area.clamp_to(shape.width, shape.height);
        let width = (self.height as i64 * area.width().max(1) as i64 / area.height().max(1) as i64).max(1) as u32;
        let rgb = crop_to_rgb(frame, shape, area, width, self.height);
        let image = RgbImage::from_raw(width, self.height, rgb).ok_or_else(|| {
            ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::DimensionMismatch))
        })?;
        image.save_with_format(path, ImageFormat::Jpeg)
    }
}
