use crate::config::ZoneConfig;
use crate::geometry::BoundingBox;
use std::collections::BTreeMap;

/// Polygon zone; objects are in it when their bottom-center point is
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    polygon: Vec<(f32, f32)>,
    objects: Vec<String>,
}

impl Zone {
    pub fn new(name: &str, config: &ZoneConfig) -> Self {
        Self {
            name: name.to_string(),
            polygon: config
                .coordinates
                .iter()
                .map(|&(x, y)| (x as f32, y as f32))
                .collect(),
            objects: config.objects.clone(),
        }
    }

    pub fn accepts(&self, label: &str) -> bool {
        self.objects.is_empty() || self.objects.iter().any(|o| o == label)
    }

    pub fn contains(&self, label: &str, bbox: &BoundingBox) -> bool {
        self.accepts(label) && point_in_polygon(bbox.bottom_center(), &self.polygon)
    }
}

/// All zones of a camera, in name order
#[derive(Debug, Clone, Default)]
pub struct ZoneSet {
    zones: Vec<Zone>,
}

impl ZoneSet {
    pub fn from_config(zones: &BTreeMap<String, ZoneConfig>) -> Self {
        Self {
            zones: zones.iter().map(|(name, zone)| Zone::new(name, zone)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Names of the zones `bbox` is currently in
    pub fn membership(&self, label: &str, bbox: &BoundingBox) -> Vec<String> {
        self.zones
            .iter()
            .filter(|z| z.contains(label, bbox))
            .map(|z| z.name.clone())
            .collect()
    }
}

/// Even-odd ray casting test
pub fn point_in_polygon(point: (f32, f32), polygon: &[(f32, f32)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (px, py) = point;
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
