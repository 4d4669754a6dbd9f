use crate::geometry::BoundingBox;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame timestamps are seconds since the Unix epoch
pub type FrameTime = f64;

/// Dimensions of a decoded camera frame. Frames travel as planar I420,
/// so the buffer is `height * 3 / 2` rows of `width` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Rows in the I420 buffer (luma plus both chroma planes)
    pub fn yuv_rows(&self) -> usize {
        self.height as usize * 3 / 2
    }

    /// Bytes per I420 frame
    pub fn yuv_size(&self) -> usize {
        self.yuv_rows() * self.width as usize
    }

    /// `(rows, cols)` as used when opening a frame from the store
    pub fn yuv_dims(&self) -> (usize, usize) {
        (self.yuv_rows(), self.width as usize)
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(0, 0, self.width as i32, self.height as i32)
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

/// Name under which a captured frame is stored
pub fn frame_name(camera: &str, frame_time: FrameTime) -> String {
    format!("{}{:.6}", camera, frame_time)
}

pub fn now_timestamp() -> FrameTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Hands out strictly increasing frame timestamps even when the wall clock
/// stalls or steps backwards, so every frame gets a unique name.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: FrameTime,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> FrameTime {
        self.next_from(now_timestamp())
    }

    pub fn next_from(&mut self, wall: FrameTime) -> FrameTime {
        // frame names carry microsecond precision
        let ts = if wall > self.last + 1e-6 {
            wall
        } else {
            self.last + 1e-6
        };
        self.last = ts;
        ts
    }
}

/// Convert one I420 pixel to RGB (BT.601, full range)
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Crop `area` out of an I420 frame and scale it to `out_width` x `out_height`
/// interleaved RGB with nearest-neighbour sampling. Parts of `area` that fall
/// outside the frame are padded black.
pub fn crop_to_rgb(
    frame: &[u8],
    shape: FrameShape,
    area: BoundingBox,
    out_width: u32,
    out_height: u32,
) -> Vec<u8> {
    let (w, h) = (shape.width as i64, shape.height as i64);
    let luma = (w * h) as usize;
    let chroma_w = (w / 2).max(1);
    let chroma = (chroma_w * (h / 2).max(1)) as usize;
    let mut out = vec![0u8; out_width as usize * out_height as usize * 3];
    let (aw, ah) = (area.width().max(1) as i64, area.height().max(1) as i64);

    for oy in 0..out_height as i64 {
        let sy = area.y0 as i64 + oy * ah / out_height as i64;
        if sy < 0 || sy >= h {
            continue;
        }
        for ox in 0..out_width as i64 {
            let sx = area.x0 as i64 + ox * aw / out_width as i64;
            if sx < 0 || sx >= w {
                continue;
            }
            let y_idx = (sy * w + sx) as usize;
            let c_idx = ((sy / 2) * chroma_w + sx / 2) as usize;
            let (Some(&yv), Some(&uv), Some(&vv)) = (
                frame.get(y_idx),
                frame.get(luma + c_idx),
                frame.get(luma + chroma + c_idx),
            ) else {
                continue;
            };
            let o = ((oy * out_width as i64 + ox) * 3) as usize;
            out[o..o + 3].copy_from_slice(&yuv_to_rgb(yv, uv, vv));
        }
    }
    out
}
