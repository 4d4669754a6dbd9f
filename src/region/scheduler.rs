use super::cluster::{
    get_cluster_candidates, get_cluster_region, get_encompassing_square, merge_overlapping,
};
use super::grid::RegionGrid;
use super::{DetectionRegion, RegionSource};
use crate::config::RegionPolicy;
use crate::frame::{FrameShape, FrameTime};
use crate::geometry::{enclosing, BoundingBox};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Everything the scheduler looks at for one frame
#[derive(Debug, Clone, Copy)]
pub struct SchedulerInputs<'a> {
    /// Estimates of non-stationary tracks plus boxes not yet tracked
    pub object_boxes: &'a [BoundingBox],
    pub motion_boxes: &'a [BoundingBox],
    /// Motion is ignored while the motion detector calibrates
    pub motion_calibrating: bool,
}

/// Sweep over the frame run at startup and after long inactivity, so
/// objects that were present before motion started still get found.
#[derive(Debug, Default)]
pub struct StartupScan {
    pending_grid: Vec<DetectionRegion>,
    tiles: VecDeque<DetectionRegion>,
}

impl StartupScan {
    pub fn armed(shape: FrameShape, min_size: i32, grid: &RegionGrid) -> Self {
        Self {
            pending_grid: grid.startup_regions(shape, min_size),
            tiles: tiles(shape, min_size).into(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.pending_grid.is_empty() || !self.tiles.is_empty()
    }

    /// Regions for the next frame: the grid-derived regions all at once,
    /// then one tile per frame
    pub fn next_batch(&mut self) -> Vec<DetectionRegion> {
        let mut batch = std::mem::take(&mut self.pending_grid);
        if let Some(tile) = self.tiles.pop_front() {
            batch.push(tile);
        }
        batch
    }

    pub fn remaining_tiles(&self) -> usize {
        self.tiles.len()
    }
}

/// Deterministic row-major covering of the frame with `size` squares
fn tiles(shape: FrameShape, size: i32) -> Vec<DetectionRegion> {
    let offsets = |limit: i32| -> Vec<i32> {
        if limit <= size {
            return vec![0];
        }
        let mut out: Vec<i32> = (0..limit - size).step_by(size as usize).collect();
        out.push(limit - size);
        out.dedup();
        out
    };
    let xs = offsets(shape.width as i32);
    let ys = offsets(shape.height as i32);
    ys.iter()
        .flat_map(|&y| {
            xs.iter().map(move |&x| {
                DetectionRegion::new(
                    BoundingBox::new(x, y, x + size, y + size),
                    RegionSource::Startup,
                )
            })
        })
        .collect()
}

/// Chooses the regions the detector runs on each frame
pub struct RegionScheduler {
    camera: String,
    shape: FrameShape,
    min_size: i32,
    policy: RegionPolicy,
    grid: RegionGrid,
    startup: StartupScan,
    rescan_after: f64,
    last_activity: Option<FrameTime>,
}

impl RegionScheduler {
    pub fn new(
        camera: &str,
        shape: FrameShape,
        min_size: i32,
        policy: RegionPolicy,
        rescan_after: f64,
        grid: RegionGrid,
    ) -> Self {
        let startup = StartupScan::armed(shape, min_size, &grid);
        Self {
            camera: camera.to_string(),
            shape,
            min_size,
            policy,
            grid,
            startup,
            rescan_after,
            last_activity: None,
        }
    }

    pub fn min_size(&self) -> i32 {
        self.min_size
    }

    pub fn grid(&self) -> &RegionGrid {
        &self.grid
    }

    pub fn set_grid(&mut self, grid: RegionGrid) {
        self.grid = grid;
    }

    pub fn set_policy(&mut self, policy: RegionPolicy) {
        self.policy = policy;
    }

    pub fn startup_active(&self) -> bool {
        self.startup.is_active()
    }

    /// Note detections at `frame_time` and feed their sizes to the grid
    pub fn record_detections(&mut self, frame_time: FrameTime, boxes: &[BoundingBox]) {
        if boxes.is_empty() {
            return;
        }
        self.last_activity = Some(frame_time);
        for bbox in boxes {
            self.grid.record(self.shape, bbox);
        }
    }

    pub fn schedule(&mut self, frame_time: FrameTime, inputs: SchedulerInputs<'_>) -> Vec<DetectionRegion> {
        self.maybe_rearm(frame_time);

        let mut regions: Vec<DetectionRegion> =
            get_cluster_candidates(self.shape, self.min_size, inputs.object_boxes)
                .iter()
                .map(|cluster| {
                    DetectionRegion::new(
                        get_cluster_region(self.shape, self.min_size, cluster, inputs.object_boxes),
                        RegionSource::Tracked,
                    )
                })
                .collect();

        if !inputs.motion_calibrating {
            let tracked: Vec<BoundingBox> = regions.iter().map(|r| r.bbox).collect();
            let standalone: Vec<BoundingBox> = inputs
                .motion_boxes
                .iter()
                .filter(|b| !b.is_inside_any(&tracked))
                .copied()
                .collect();
            for cluster in get_cluster_candidates(self.shape, self.min_size, &standalone) {
                let members: Vec<BoundingBox> = cluster.iter().map(|&i| standalone[i]).collect();
                if let Some(bounds) = enclosing(&members) {
                    regions.push(DetectionRegion::new(
                        self.grid.get_region_from_grid(self.shape, &bounds, self.min_size),
                        RegionSource::Motion,
                    ));
                }
            }
        }

        if self.startup.is_active() {
            let batch = self.startup.next_batch();
            debug!(
                "{}: startup scan adds {} regions, {} tiles left",
                self.camera,
                batch.len(),
                self.startup.remaining_tiles()
            );
            regions.extend(batch);
        }

        let regions = merge_overlapping(self.shape, regions, self.min_size);
        match self.policy {
            RegionPolicy::Multi => regions,
            RegionPolicy::Single if regions.len() > 1 => {
                get_encompassing_square(self.shape, &regions, self.min_size)
                    .into_iter()
                    .collect()
            }
            RegionPolicy::Single => regions,
        }
    }

    fn maybe_rearm(&mut self, frame_time: FrameTime) {
        if self.startup.is_active() {
            return;
        }
        let idle_since = *self.last_activity.get_or_insert(frame_time);
        if frame_time - idle_since > self.rescan_after {
            info!(
                "{}: no detections for {:.0}s, rescanning the frame",
                self.camera,
                frame_time - idle_since
            );
            self.startup = StartupScan::armed(self.shape, self.min_size, &self.grid);
            self.last_activity = Some(frame_time);
        }
    }
}
