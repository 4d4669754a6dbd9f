//! Review segments: bounded windows of camera activity an operator reviews.
//!
//! The maintainer consumes detection payloads from the bus, keeps at most one
//! open segment per camera and reports every transition to the event bus and
//! the segment store.

pub mod maintainer;
pub mod segment;
pub mod store;
pub mod thumbnail;

use crate::frame::FrameTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use maintainer::ReviewSegmentMaintainer;
pub use segment::PendingReviewSegment;
pub use store::{JsonLinesSegmentStore, SegmentStore};
pub use thumbnail::{crop_16_9, ThumbnailWriter};

/// Ordered so that `max` escalates and never downgrades
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Detection,
    Alert,
}

impl SeverityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Detection => "detection",
            SeverityLevel::Alert => "alert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewEventKind {
    New,
    Update,
    End,
}

impl ReviewEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewEventKind::New => "new",
            ReviewEventKind::Update => "update",
            ReviewEventKind::End => "end",
        }
    }
}

/// What a segment saw, flattened for storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    /// Object and event ids
    pub detections: Vec<String>,
    /// Distinct labels of those detections
    pub objects: Vec<String>,
    pub sub_labels: Vec<String>,
    pub zones: Vec<String>,
    pub audio: Vec<String>,
}

/// Snapshot of a segment as persisted and published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSegmentRecord {
    pub id: String,
    pub camera: String,
    pub start_time: FrameTime,
    /// Set once the segment ended
    pub end_time: Option<FrameTime>,
    pub severity: SeverityLevel,
    pub thumb_path: PathBuf,
    pub data: SegmentData,
}

#[cfg(test)]
mod tests;
