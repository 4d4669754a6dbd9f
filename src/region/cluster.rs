use super::{DetectionRegion, RegionSource};
use crate::frame::FrameShape;
use crate::geometry::{enclosing, BoundingBox};

/// Regions are never smaller than the model input, so the detector never
/// upsamples a crop
pub fn min_region_size(model_width: u32, model_height: u32) -> i32 {
    model_width.max(model_height) as i32
}

/// Square region centred on a box, `multiplier` times its longer side,
/// never smaller than `min_size`, shifted to stay inside the frame where the
/// frame is large enough.
pub fn calculate_region(
    shape: FrameShape,
    bbox: &BoundingBox,
    min_size: i32,
    multiplier: f32,
) -> BoundingBox {
    let longest = bbox.width().max(bbox.height()) as f32;
    let size = ((longest * multiplier) as i32 / 4 * 4).max(min_size);
    let x = place(bbox.x0, bbox.x1, size, shape.width as i32);
    let y = place(bbox.y0, bbox.y1, size, shape.height as i32);
    BoundingBox::new(x, y, x + size, y + size)
}

fn place(lo: i32, hi: i32, size: i32, limit: i32) -> i32 {
    let offset = ((hi - lo) as f32 / 2.0 + lo as f32 - size as f32 / 2.0) as i32;
    if offset < 0 {
        0
    } else if offset > limit - size {
        (limit - size).max(0)
    } else {
        offset
    }
}

/// Area around a box inside which neighbouring boxes could share its region
pub fn get_cluster_boundary(bbox: &BoundingBox, min_size: i32) -> BoundingBox {
    let max_x = (min_size as f32 - bbox.width() as f32 * 1.1) as i32;
    let max_y = (min_size as f32 - bbox.height() as f32 * 1.1) as i32;
    BoundingBox::new(
        (bbox.x0 - max_x).max(0),
        (bbox.y0 - max_y).max(0),
        bbox.x1 + max_x,
        bbox.y1 + max_y,
    )
}

/// Region covering every box referenced by `cluster`
pub fn get_cluster_region(
    shape: FrameShape,
    min_size: i32,
    cluster: &[usize],
    boxes: &[BoundingBox],
) -> BoundingBox {
    let members: Vec<BoundingBox> = cluster.iter().map(|&i| boxes[i]).collect();
    let bounds = enclosing(&members).unwrap_or_else(|| shape.bounds());
    calculate_region(shape, &bounds, min_size, 1.35)
}

/// Greedily group boxes that can share one region. A box joins a cluster
/// only when it lies in the first box's cluster boundary and no member would
/// shrink below 5% of a region larger than the minimum.
pub fn get_cluster_candidates(
    shape: FrameShape,
    min_size: i32,
    boxes: &[BoundingBox],
) -> Vec<Vec<usize>> {
    let mut used = vec![false; boxes.len()];
    let mut candidates = Vec::new();

    for current in 0..boxes.len() {
        if used[current] {
            continue;
        }
        used[current] = true;
        let mut cluster = vec![current];
        let boundary = get_cluster_boundary(&boxes[current], min_size);

        for compare in 0..boxes.len() {
            if used[compare] || !boxes[compare].is_inside(&boundary) {
                continue;
            }

            let mut potential = cluster.clone();
            potential.push(compare);
            let region = get_cluster_region(shape, min_size, &potential, boxes);

            let should_cluster = region.width() <= min_size
                || potential.iter().all(|&i| {
                    boxes[i].area() as f64 / region.area().max(1) as f64 >= 0.05
                });
            if should_cluster {
                cluster.push(compare);
                used[compare] = true;
            }
        }
        candidates.push(cluster);
    }
    candidates
}

/// Square enclosing every region, side rounded up to a multiple of 4
pub fn get_encompassing_square(
    shape: FrameShape,
    regions: &[DetectionRegion],
    min_size: i32,
) -> Option<DetectionRegion> {
    let boxes: Vec<BoundingBox> = regions.iter().map(|r| r.bbox).collect();
    let bounds = enclosing(&boxes)?;
    let side = bounds.width().max(bounds.height());
    let size = ((side + 3) / 4 * 4).max(min_size);
    let x = place(bounds.x0, bounds.x1, size, shape.width as i32);
    let y = place(bounds.y0, bounds.y1, size, shape.height as i32);
    Some(DetectionRegion::new(
        BoundingBox::new(x, y, x + size, y + size),
        merged_source(regions.iter().map(|r| r.source)),
    ))
}

fn merged_source(sources: impl Iterator<Item = RegionSource>) -> RegionSource {
    let mut result = None;
    for source in sources {
        result = match (result, source) {
            (_, RegionSource::Motion) | (Some(RegionSource::Motion), _) => Some(RegionSource::Motion),
            (None, s) => Some(s),
            (Some(existing), _) => Some(existing),
        };
    }
    result.unwrap_or(RegionSource::Tracked)
}

/// Merge overlapping regions while one square over both costs no more area
/// than the pair. Repeats until no pair qualifies.
pub fn merge_overlapping(
    shape: FrameShape,
    mut regions: Vec<DetectionRegion>,
    min_size: i32,
) -> Vec<DetectionRegion> {
    loop {
        let mut merged_any = false;
        'search: for i in 0..regions.len() {
            for j in (i + 1)..regions.len() {
                let (a, b) = (regions[i], regions[j]);
                if !a.bbox.intersects(&b.bbox) {
                    continue;
                }
                let Some(candidate) = get_encompassing_square(shape, &[a, b], min_size) else {
                    continue;
                };
                if candidate.bbox.area() <= a.bbox.area() + b.bbox.area() {
                    regions[i] = candidate;
                    regions.remove(j);
                    merged_any = true;
                    break 'search;
                }
            }
        }
        if !merged_any {
            return regions;
        }
    }
}
