use super::cluster::calculate_region;
use super::{DetectionRegion, RegionSource};
use crate::bus::{InterProcessCommunicator, REGION_GRID_TOPIC};
use crate::frame::FrameShape;
use crate::geometry::BoundingBox;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cells per side of the region grid
pub const GRID_SIZE: usize = 8;

const MAX_SAMPLES_PER_CELL: usize = 100;

/// Object sizes seen in one grid cell, as fractions of the frame width
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub sizes: Vec<f32>,
    pub mean: f32,
    pub std_dev: f32,
}

impl GridCell {
    fn add(&mut self, size: f32) {
        self.sizes.push(size);
        if self.sizes.len() > MAX_SAMPLES_PER_CELL {
            self.sizes.remove(0);
        }
        let n = self.sizes.len() as f32;
        self.mean = self.sizes.iter().sum::<f32>() / n;
        let variance = self.sizes.iter().map(|s| (s - self.mean).powi(2)).sum::<f32>() / n;
        self.std_dev = variance.sqrt();
    }
}

/// Typical object size per cell of an 8x8 grid over the frame. Used to size
/// motion regions and to seed the startup scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionGrid {
    cells: Vec<GridCell>,
}

impl Default for RegionGrid {
    fn default() -> Self {
        Self {
            cells: vec![GridCell::default(); GRID_SIZE * GRID_SIZE],
        }
    }
}

impl RegionGrid {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell_index(shape: FrameShape, x: f32, y: f32) -> usize {
        let gx = ((x / shape.width as f32) * GRID_SIZE as f32) as isize;
        let gy = ((y / shape.height as f32) * GRID_SIZE as f32) as isize;
        let gx = gx.clamp(0, GRID_SIZE as isize - 1) as usize;
        let gy = gy.clamp(0, GRID_SIZE as isize - 1) as usize;
        gy * GRID_SIZE + gx
    }

    pub fn cell(&self, shape: FrameShape, x: f32, y: f32) -> &GridCell {
        &self.cells[Self::cell_index(shape, x, y)]
    }

    /// Add a detected object box as a size sample for the cell under its centre
    pub fn record(&mut self, shape: FrameShape, bbox: &BoundingBox) {
        let (cx, cy) = bbox.center();
        let size = bbox.width().max(bbox.height()) as f32 / shape.width as f32;
        self.cells[Self::cell_index(shape, cx, cy)].add(size);
    }

    pub fn sample_count(&self) -> usize {
        self.cells.iter().map(|c| c.sizes.len()).sum()
    }

    /// Region for a cluster of motion boxes, grown to the size objects usually
    /// have at that spot in the frame
    pub fn get_region_from_grid(
        &self,
        shape: FrameShape,
        cluster: &BoundingBox,
        min_size: i32,
    ) -> BoundingBox {
        let cell = self.cell(shape, cluster.x0 as f32, cluster.y0 as f32);
        if cell.sizes.len() < 2 {
            return calculate_region(shape, cluster, min_size, 2.0);
        }

        let calc_size = cluster.width().max(cluster.height()) as f32 / shape.width as f32;
        if calc_size >= cell.mean - cell.std_dev {
            // already within or above the expected size
            return calculate_region(shape, cluster, min_size, 2.0);
        }

        let expected = (cell.mean * shape.width as f32) as i32;
        let (cx, cy) = cluster.center();
        let half = expected / 2;
        let grown = BoundingBox::new(
            (cx as i32 - half).max(0),
            (cy as i32 - half).max(0),
            (cx as i32 + half).min(shape.width as i32),
            (cy as i32 + half).min(shape.height as i32),
        );
        calculate_region(shape, &grown.union(cluster), min_size, 1.35)
    }

    /// Regions around the busiest cells, most samples first, at most 8
    pub fn startup_regions(&self, shape: FrameShape, min_size: i32) -> Vec<DetectionRegion> {
        let mut ranked: Vec<(usize, &GridCell)> = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.sizes.len() >= 2)
            .collect();
        ranked.sort_by(|a, b| b.1.sizes.len().cmp(&a.1.sizes.len()).then(a.0.cmp(&b.0)));

        let cell_w = shape.width as f32 / GRID_SIZE as f32;
        let cell_h = shape.height as f32 / GRID_SIZE as f32;
        ranked
            .into_iter()
            .take(8)
            .map(|(index, cell)| {
                let gx = (index % GRID_SIZE) as f32;
                let gy = (index / GRID_SIZE) as f32;
                let (cx, cy) = ((gx + 0.5) * cell_w, (gy + 0.5) * cell_h);
                let half = cell.mean * shape.width as f32 / 2.0;
                let object = BoundingBox::new(
                    (cx - half) as i32,
                    (cy - half) as i32,
                    (cx + half) as i32,
                    (cy + half) as i32,
                );
                DetectionRegion::new(
                    calculate_region(shape, &object, min_size, 2.0),
                    RegionSource::Startup,
                )
            })
            .collect()
    }
}

/// Body of a `REGION_GRID_TOPIC` request. A processor sends its learned
/// grid on refresh and nothing on startup; the reply is the stored grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionGridRequest {
    pub camera: String,
    #[serde(default)]
    pub grid: Option<RegionGrid>,
}

/// Latest region grid per camera, served over the request/response bus
#[derive(Clone, Default)]
pub struct RegionGridRegistry {
    grids: Arc<RwLock<HashMap<String, RegionGrid>>>,
}

impl RegionGridRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, camera: &str) -> RegionGrid {
        self.grids.read().get(camera).cloned().unwrap_or_default()
    }

    pub fn update(&self, camera: &str, grid: RegionGrid) {
        self.grids.write().insert(camera.to_string(), grid);
    }

    /// Load persisted grids, starting empty when the file is missing or bad
    pub fn load(path: &Path) -> Self {
        let registry = Self::new();
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, RegionGrid>>(&text) {
                Ok(grids) => {
                    info!("Loaded region grids for {} cameras", grids.len());
                    *registry.grids.write() = grids;
                }
                Err(e) => warn!("Ignoring unreadable region grids at {}: {}", path.display(), e),
            },
            Err(e) => debug!("No region grids at {}: {}", path.display(), e),
        }
        registry
    }

    /// Answer a grid request, storing the grid it carries first
    pub fn handle_request(&self, request: RegionGridRequest) -> RegionGrid {
        if let Some(grid) = request.grid {
            debug!("{}: region grid updated with {} samples", request.camera, grid.sample_count());
            self.update(&request.camera, grid);
        }
        self.get(&request.camera)
    }

    /// Serve `REGION_GRID_TOPIC` from this registry
    pub fn serve(&self, communicator: &InterProcessCommunicator) {
        let registry = self.clone();
        communicator.register(REGION_GRID_TOPIC, move |payload| {
            let request: RegionGridRequest =
                serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
            serde_json::to_value(registry.handle_request(request)).map_err(|e| e.to_string())
        });
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(&*self.grids.read())?;
        std::fs::write(path, text)
    }
}
