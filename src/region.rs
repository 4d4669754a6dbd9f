//! Detection region selection.
//!
//! The detector only ever sees square crops of the frame. Each tick the
//! scheduler turns tracked objects, motion and the startup scan into a small
//! set of squares, each at least the model input size.

pub mod cluster;
pub mod grid;
pub mod scheduler;

use crate::geometry::BoundingBox;
use serde::{Deserialize, Serialize};

pub use cluster::{
    calculate_region, get_cluster_boundary, get_cluster_candidates, get_cluster_region,
    get_encompassing_square, merge_overlapping, min_region_size,
};
pub use grid::{GridCell, RegionGrid, RegionGridRegistry, RegionGridRequest, GRID_SIZE};
pub use scheduler::{RegionScheduler, SchedulerInputs, StartupScan};

/// Why a region was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionSource {
    /// Covers active tracked objects
    Tracked,
    /// Covers motion not explained by tracked objects
    Motion,
    /// Part of the startup or rescan sweep
    Startup,
}

/// Square crop handed to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRegion {
    pub bbox: BoundingBox,
    pub source: RegionSource,
}

impl DetectionRegion {
    pub fn new(bbox: BoundingBox, source: RegionSource) -> Self {
        Self { bbox, source }
    }

    pub fn size(&self) -> i32 {
        self.bbox.width()
    }
}
