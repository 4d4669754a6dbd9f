use super::Detection;
use crate::config::{ObjectFilter, ObjectsConfig};
use std::cmp::Ordering;

fn passes(detection: &Detection, filter: &ObjectFilter) -> bool {
    detection.score >= filter.min_score
        && detection.area >= filter.min_area
        && detection.area <= filter.max_area
        && detection.ratio >= filter.min_ratio
        && detection.ratio <= filter.max_ratio
}

/// Keep detections of tracked labels that pass their label's filter
pub fn filter_detections(detections: Vec<Detection>, objects: &ObjectsConfig) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| objects.track.iter().any(|label| *label == d.label))
        .filter(|d| match objects.filters.get(&d.label) {
            Some(filter) => passes(d, filter),
            None => passes(d, &ObjectFilter::default()),
        })
        .collect()
}

/// Collapse duplicate detections of the same object coming from overlapping
/// regions: per label, keep the best-scoring box and drop boxes overlapping
/// it by more than `iou_threshold`.
pub fn reduce_detections(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then(a.bbox.x0.cmp(&b.bbox.x0))
            .then(a.bbox.y0.cmp(&b.bbox.y0))
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let duplicate = kept
            .iter()
            .any(|k| k.label == detection.label && k.bbox.iou(&detection.bbox) > iou_threshold);
        if !duplicate {
            kept.push(detection);
        }
    }
    kept
}

/// Labels that describe another object rather than being tracked on their own
const ATTRIBUTE_LABEL_MAP: &[(&str, &[&str])] = &[
    ("person", &["face", "amazon"]),
    ("car", &["amazon", "fedex", "license_plate", "ups"]),
];

pub fn is_attribute_label(label: &str) -> bool {
    ATTRIBUTE_LABEL_MAP
        .iter()
        .any(|(_, attributes)| attributes.contains(&label))
}

/// Whether `attribute` can describe an object labelled `object_label`
pub fn attribute_applies(object_label: &str, attribute: &str) -> bool {
    ATTRIBUTE_LABEL_MAP
        .iter()
        .any(|(label, attributes)| *label == object_label && attributes.contains(&attribute))
}
