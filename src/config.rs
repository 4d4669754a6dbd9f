use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::frame::FrameShape;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EdgewatchConfig {
    #[serde(default)]
    pub model: ModelConfig,

    /// Detector workers keyed by name
    #[serde(default = "default_detectors")]
    pub detectors: BTreeMap<String, DetectorConfig>,

    #[serde(default)]
    pub review: ReviewTimingConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub cameras: BTreeMap<String, CameraConfig>,
}

impl Default for EdgewatchConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            detectors: default_detectors(),
            review: ReviewTimingConfig::default(),
            watchdog: WatchdogConfig::default(),
            bus: BusConfig::default(),
            paths: PathsConfig::default(),
            cameras: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// Model input width in pixels
    #[serde(default = "default_model_size")]
    pub width: u32,

    /// Model input height in pixels
    #[serde(default = "default_model_size")]
    pub height: u32,

    /// Label for each class id, indexed by id
    #[serde(default = "default_labelmap")]
    pub labelmap: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            width: default_model_size(),
            height: default_model_size(),
            labelmap: default_labelmap(),
        }
    }
}

impl ModelConfig {
    pub fn label(&self, class_id: usize) -> Option<&str> {
        self.labelmap.get(class_id).map(String::as_str)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorKind {
    /// Reports nothing. Useful for exercising capture and motion alone.
    Null,
    /// External model server speaking the tensor protocol over stdin/stdout
    Process { command: Vec<String> },
}

impl Default for DetectorKind {
    fn default() -> Self {
        DetectorKind::Null
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    #[serde(default)]
    pub kind: DetectorKind,

    /// Detections scoring below this are discarded by the worker
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,

    /// Result rows produced per request
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::default(),
            confidence_floor: default_confidence_floor(),
            max_detections: default_max_detections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReviewTimingConfig {
    /// Seconds of inactivity after which an alert segment closes
    #[serde(default = "default_alert_grace")]
    pub alert_grace_secs: f64,

    /// Seconds of inactivity after which a detection segment closes
    #[serde(default = "default_detection_grace")]
    pub detection_grace_secs: f64,

    /// Height of segment thumbnails in pixels
    #[serde(default = "default_thumbnail_height")]
    pub thumbnail_height: u32,
}

impl Default for ReviewTimingConfig {
    fn default() -> Self {
        Self {
            alert_grace_secs: default_alert_grace(),
            detection_grace_secs: default_detection_grace(),
            thumbnail_height: default_thumbnail_height(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchdogConfig {
    /// Seconds between liveness checks
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,

    /// Delay before the first detector check
    #[serde(default = "default_watchdog_interval")]
    pub startup_delay_secs: u64,

    /// A detection running longer than this is considered stuck
    #[serde(default = "default_detection_stuck")]
    pub detection_stuck_secs: f64,

    /// Restarts tolerated within `restart_window_secs` before backing off
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Upper bound for the restart backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
            startup_delay_secs: default_watchdog_interval(),
            detection_stuck_secs: default_detection_stuck(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusConfig {
    /// Timeout for request/response calls and detector round trips
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Capacity of the detections fan-out channel per subscriber
    #[serde(default = "default_bus_capacity")]
    pub detection_capacity: usize,

    /// Capacity of the pipeline event broadcast channel
    #[serde(default = "default_bus_capacity")]
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            detection_capacity: default_bus_capacity(),
            event_capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    /// Where recording outputs drop their segments
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Thumbnails go under `<clips_dir>/review`
    #[serde(default = "default_clips_dir")]
    pub clips_dir: PathBuf,

    /// Review segment log (JSON lines)
    #[serde(default = "default_review_log")]
    pub review_log: PathBuf,
}

impl PathsConfig {
    /// Region grids persisted between runs
    pub fn region_grids(&self) -> PathBuf {
        self.cache_dir.join("region_grids.json")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            clips_dir: default_clips_dir(),
            review_log: default_review_log(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Filled from the table key
    #[serde(skip)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub ffmpeg: FfmpegConfig,

    /// Bounded queue between capture and processing
    #[serde(default = "default_frame_queue_size")]
    pub frame_queue_size: usize,

    /// Frames kept alive after processing for thumbnails
    #[serde(default = "default_frame_retention")]
    pub frame_retention: usize,

    #[serde(default)]
    pub detect: DetectConfig,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub objects: ObjectsConfig,

    #[serde(default)]
    pub zones: BTreeMap<String, ZoneConfig>,

    #[serde(default)]
    pub review: CameraReviewConfig,

    #[serde(default)]
    pub record: RecordConfig,

    #[serde(default)]
    pub snapshots: SnapshotsConfig,

    #[serde(default)]
    pub pose: PoseConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            ffmpeg: FfmpegConfig::default(),
            frame_queue_size: default_frame_queue_size(),
            frame_retention: default_frame_retention(),
            detect: DetectConfig::default(),
            motion: MotionConfig::default(),
            objects: ObjectsConfig::default(),
            zones: BTreeMap::new(),
            review: CameraReviewConfig::default(),
            record: RecordConfig::default(),
            snapshots: SnapshotsConfig::default(),
            pose: PoseConfig::default(),
        }
    }
}

impl CameraConfig {
    pub fn frame_shape(&self) -> FrameShape {
        FrameShape::new(self.detect.width, self.detect.height)
    }

    /// Full command line for the decode process feeding the detect role
    pub fn detect_command(&self) -> Vec<String> {
        if let Some(cmd) = &self.ffmpeg.detect_command {
            return cmd.clone();
        }
        let mut cmd = vec![
            self.ffmpeg.binary.clone(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
        ];
        cmd.extend(self.ffmpeg.input_args.iter().cloned());
        cmd.push("-i".to_string());
        cmd.push(self.ffmpeg.input.clone());
        cmd.extend([
            "-r".to_string(),
            self.detect.fps.to_string(),
            "-s".to_string(),
            format!("{}x{}", self.detect.width, self.detect.height),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "pipe:".to_string(),
        ]);
        cmd
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub binary: String,

    /// Stream URL or device
    #[serde(default)]
    pub input: String,

    #[serde(default)]
    pub input_args: Vec<String>,

    /// Replaces the generated decode command entirely
    #[serde(default)]
    pub detect_command: Option<Vec<String>>,

    /// Additional processes (recording, restreaming) supervised alongside
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Restart when no frame arrives for this long
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: f64,

    /// Restart when the measured fps exceeds the target by this margin
    #[serde(default = "default_fps_margin")]
    pub fps_margin: f64,

    /// Restart a recording output whose newest artifact is older than this
    #[serde(default = "default_output_stall")]
    pub output_stall_secs: u64,

    /// Grace between the polite and forced stop of a subprocess
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_ffmpeg_binary(),
            input: String::new(),
            input_args: Vec::new(),
            detect_command: None,
            outputs: Vec::new(),
            retry_interval_secs: default_retry_interval(),
            frame_timeout_secs: default_frame_timeout(),
            fps_margin: default_fps_margin(),
            output_stall_secs: default_output_stall(),
            terminate_grace_secs: default_terminate_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub command: Vec<String>,

    #[serde(default)]
    pub roles: Vec<String>,
}

impl OutputConfig {
    pub fn records(&self) -> bool {
        self.roles.iter().any(|r| r == "record")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegionPolicy {
    /// Run the detector on every scheduled region
    #[default]
    Multi,
    /// Collapse regions into one encompassing square
    Single,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    #[default]
    Iou,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_detect_width")]
    pub width: u32,

    #[serde(default = "default_detect_height")]
    pub height: u32,

    #[serde(default = "default_detect_fps")]
    pub fps: u32,

    /// Frames a track may go undetected before removal
    #[serde(default)]
    pub max_disappeared: Option<u32>,

    /// Detections before a new track is reported
    #[serde(default)]
    pub min_initialized: Option<u32>,

    #[serde(default)]
    pub stationary: StationaryConfig,

    #[serde(default)]
    pub region_policy: RegionPolicy,

    #[serde(default)]
    pub tracker: TrackerKind,

    /// Seconds without detections before the startup scan runs again
    #[serde(default = "default_rescan_after")]
    pub rescan_after_secs: f64,

    /// Frames between region grid refreshes
    #[serde(default = "default_grid_refresh")]
    pub grid_refresh_frames: u64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: default_detect_width(),
            height: default_detect_height(),
            fps: default_detect_fps(),
            max_disappeared: None,
            min_initialized: None,
            stationary: StationaryConfig::default(),
            region_policy: RegionPolicy::default(),
            tracker: TrackerKind::default(),
            rescan_after_secs: default_rescan_after(),
            grid_refresh_frames: default_grid_refresh(),
        }
    }
}

impl DetectConfig {
    pub fn max_disappeared(&self) -> u32 {
        self.max_disappeared.unwrap_or(self.fps * 5)
    }

    pub fn min_initialized(&self) -> u32 {
        self.min_initialized.unwrap_or(0)
    }

    pub fn stationary_threshold(&self) -> u32 {
        self.stationary.threshold.unwrap_or(self.fps * 10)
    }

    pub fn stationary_interval(&self) -> u32 {
        self.stationary.interval.unwrap_or(self.fps * 10)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StationaryConfig {
    /// Motionless frames before a track counts as stationary
    #[serde(default)]
    pub threshold: Option<u32>,

    /// Every N frames stationary tracks are re-detected anyway
    #[serde(default)]
    pub interval: Option<u32>,

    #[serde(default)]
    pub max_frames: StationaryMaxFrames,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StationaryMaxFrames {
    /// Stationary tracks older than this many motionless frames are expired
    #[serde(default)]
    pub default: Option<u32>,

    #[serde(default)]
    pub objects: BTreeMap<String, u32>,
}

impl StationaryMaxFrames {
    pub fn for_label(&self, label: &str) -> Option<u32> {
        self.objects.get(label).copied().or(self.default)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-pixel luma delta counted as change
    #[serde(default = "default_motion_threshold")]
    pub threshold: u8,

    /// Minimum changed pixels in a blob, at motion resolution
    #[serde(default = "default_motion_contour_area")]
    pub contour_area: usize,

    /// Height frames are scaled to before comparison
    #[serde(default = "default_motion_frame_height")]
    pub frame_height: u32,

    #[serde(default = "default_motion_frame_alpha")]
    pub frame_alpha: f32,

    /// Frames used to settle the background before reporting
    #[serde(default = "default_motion_calibration_frames")]
    pub calibration_frames: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_motion_threshold(),
            contour_area: default_motion_contour_area(),
            frame_height: default_motion_frame_height(),
            frame_alpha: default_motion_frame_alpha(),
            calibration_frames: default_motion_calibration_frames(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ObjectsConfig {
    /// Labels kept after detection
    #[serde(default = "default_tracked_labels")]
    pub track: Vec<String>,

    #[serde(default)]
    pub filters: BTreeMap<String, ObjectFilter>,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            track: default_tracked_labels(),
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ObjectFilter {
    #[serde(default)]
    pub min_area: i64,

    #[serde(default = "default_max_area")]
    pub max_area: i64,

    #[serde(default)]
    pub min_ratio: f32,

    #[serde(default = "default_max_ratio")]
    pub max_ratio: f32,

    /// Minimum single-frame score
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Median score below which a track is a false positive
    #[serde(default = "default_track_threshold")]
    pub threshold: f32,
}

impl Default for ObjectFilter {
    fn default() -> Self {
        Self {
            min_area: 0,
            max_area: default_max_area(),
            min_ratio: 0.0,
            max_ratio: default_max_ratio(),
            min_score: default_min_score(),
            threshold: default_track_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ZoneConfig {
    /// Polygon vertices in frame pixels
    pub coordinates: Vec<(i32, i32)>,

    /// Labels that may enter the zone, empty for all
    #[serde(default)]
    pub objects: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CameraReviewConfig {
    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub detections: DetectionsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlertsConfig {
    #[serde(default = "default_alert_labels")]
    pub labels: Vec<String>,

    #[serde(default)]
    pub required_zones: Vec<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            labels: default_alert_labels(),
            required_zones: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DetectionsConfig {
    /// Labels that produce detection segments, `None` for any label
    #[serde(default)]
    pub labels: Option<Vec<String>>,

    #[serde(default)]
    pub required_zones: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SnapshotsConfig {
    /// Write a thumbnail for each review segment
    #[serde(default = "default_true")]
    pub thumbnails: bool,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self { thumbnails: true }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoseConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Label whose tracks get pose estimation
    #[serde(default = "default_pose_label")]
    pub label: String,

    /// Keypoint frames handed to the action classifier
    #[serde(default = "default_pose_window")]
    pub window: usize,

    /// Classified action that escalates a segment to alert
    #[serde(default = "default_alert_action")]
    pub alert_action: String,

    #[serde(default = "default_min_action_score")]
    pub min_action_score: f32,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            label: default_pose_label(),
            window: default_pose_window(),
            alert_action: default_alert_action(),
            min_action_score: default_min_action_score(),
        }
    }
}

impl EdgewatchConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("edgewatch.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .add_source(File::with_name(&path_str).required(false))
            // EDGEWATCH__REVIEW__ALERT_GRACE_SECS=60
            .add_source(Environment::with_prefix("EDGEWATCH").separator("__"))
            .build()?;

        let config = Self::finish(settings.try_deserialize()?);
        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(Self::finish(settings.try_deserialize()?))
    }

    fn finish(mut config: EdgewatchConfig) -> Self {
        for (name, camera) in config.cameras.iter_mut() {
            camera.name = name.clone();
        }
        config
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.values().filter(|c| c.enabled)
    }

    /// Result rows per request, shared by every detector
    pub fn max_detections(&self) -> usize {
        self.detectors
            .values()
            .next()
            .map(|d| d.max_detections)
            .unwrap_or_else(default_max_detections)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.width == 0 || self.model.height == 0 {
            return Err(ConfigError::Message(
                "Model dimensions must be greater than 0".to_string(),
            ));
        }

        if self.detectors.is_empty() {
            return Err(ConfigError::Message(
                "At least one detector must be configured".to_string(),
            ));
        }

        let max_detections = self.max_detections();
        for (name, detector) in &self.detectors {
            // workers share one result buffer layout per camera
            if detector.max_detections != max_detections || max_detections == 0 {
                return Err(ConfigError::Message(format!(
                    "Detector {} max_detections must be non-zero and equal across detectors",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&detector.confidence_floor) {
                return Err(ConfigError::Message(format!(
                    "Detector {} confidence_floor must be within 0..=1",
                    name
                )));
            }
            if let DetectorKind::Process { command } = &detector.kind {
                if command.is_empty() {
                    return Err(ConfigError::Message(format!(
                        "Detector {} command must not be empty",
                        name
                    )));
                }
            }
        }

        if self.review.alert_grace_secs <= 0.0 || self.review.detection_grace_secs <= 0.0 {
            return Err(ConfigError::Message(
                "Review grace windows must be greater than 0".to_string(),
            ));
        }

        if self.watchdog.interval_secs == 0 {
            return Err(ConfigError::Message(
                "Watchdog interval must be greater than 0".to_string(),
            ));
        }

        for camera in self.cameras.values() {
            camera.validate(&self.model)?;
        }

        Ok(())
    }
}

impl CameraConfig {
    fn validate(&self, model: &ModelConfig) -> Result<(), ConfigError> {
        let name = &self.name;
        if self.detect.width == 0 || self.detect.height == 0 {
            return Err(ConfigError::Message(format!(
                "Camera {} detect resolution must be greater than 0",
                name
            )));
        }
        // I420 needs even dimensions
        if self.detect.width % 2 != 0 || self.detect.height % 2 != 0 {
            return Err(ConfigError::Message(format!(
                "Camera {} detect resolution must be even",
                name
            )));
        }
        if self.detect.width < model.width || self.detect.height < model.height {
            return Err(ConfigError::Message(format!(
                "Camera {} detect resolution is smaller than the model input",
                name
            )));
        }
        if self.detect.fps == 0 {
            return Err(ConfigError::Message(format!(
                "Camera {} detect fps must be greater than 0",
                name
            )));
        }
        if self.frame_queue_size == 0 {
            return Err(ConfigError::Message(format!(
                "Camera {} frame_queue_size must be greater than 0",
                name
            )));
        }
        if self.enabled && self.ffmpeg.input.is_empty() && self.ffmpeg.detect_command.is_none() {
            return Err(ConfigError::Message(format!(
                "Camera {} needs ffmpeg.input or ffmpeg.detect_command",
                name
            )));
        }
        for zone in self.review.alerts.required_zones.iter().chain(&self.review.detections.required_zones) {
            if !self.zones.contains_key(zone) {
                return Err(ConfigError::Message(format!(
                    "Camera {} review references unknown zone {}",
                    name, zone
                )));
            }
        }
        for (zone_name, zone) in &self.zones {
            if zone.coordinates.len() < 3 {
                return Err(ConfigError::Message(format!(
                    "Zone {} on camera {} needs at least 3 points",
                    zone_name, name
                )));
            }
        }
        if self.pose.enabled && !(1..=crate::track::KEYPOINT_HISTORY).contains(&self.pose.window) {
            return Err(ConfigError::Message(format!(
                "Camera {} pose window must be within 1..={}",
                name,
                crate::track::KEYPOINT_HISTORY
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_model_size() -> u32 {
    320
}

fn default_labelmap() -> Vec<String> {
    [
        "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
        "traffic light", "fire hydrant", "street sign", "stop sign", "parking meter", "bench",
        "bird", "cat", "dog", "horse", "sheep", "cow",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_detectors() -> BTreeMap<String, DetectorConfig> {
    let mut detectors = BTreeMap::new();
    detectors.insert("cpu".to_string(), DetectorConfig::default());
    detectors
}

fn default_confidence_floor() -> f32 {
    0.4
}

fn default_max_detections() -> usize {
    20
}

fn default_alert_grace() -> f64 {
    120.0
}

fn default_detection_grace() -> f64 {
    30.0
}

fn default_thumbnail_height() -> u32 {
    180
}

fn default_watchdog_interval() -> u64 {
    10
}

fn default_detection_stuck() -> f64 {
    10.0
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_window() -> u64 {
    300
}

fn default_max_backoff() -> u64 {
    120
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_bus_capacity() -> usize {
    256
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_clips_dir() -> PathBuf {
    PathBuf::from("./clips")
}

fn default_review_log() -> PathBuf {
    PathBuf::from("./clips/review/segments.jsonl")
}

fn default_frame_queue_size() -> usize {
    2
}

fn default_frame_retention() -> usize {
    2
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_retry_interval() -> u64 {
    10
}

fn default_frame_timeout() -> f64 {
    20.0
}

fn default_fps_margin() -> f64 {
    10.0
}

fn default_output_stall() -> u64 {
    120
}

fn default_terminate_grace() -> u64 {
    30
}

fn default_detect_width() -> u32 {
    1280
}

fn default_detect_height() -> u32 {
    720
}

fn default_detect_fps() -> u32 {
    5
}

fn default_rescan_after() -> f64 {
    300.0
}

fn default_grid_refresh() -> u64 {
    3000
}

fn default_motion_threshold() -> u8 {
    30
}

fn default_motion_contour_area() -> usize {
    10
}

fn default_motion_frame_height() -> u32 {
    100
}

fn default_motion_frame_alpha() -> f32 {
    0.01
}

fn default_motion_calibration_frames() -> u32 {
    30
}

fn default_tracked_labels() -> Vec<String> {
    vec!["person".to_string()]
}

fn default_max_area() -> i64 {
    24_000_000
}

fn default_max_ratio() -> f32 {
    24_000_000.0
}

fn default_min_score() -> f32 {
    0.5
}

fn default_track_threshold() -> f32 {
    0.7
}

fn default_alert_labels() -> Vec<String> {
    vec!["car".to_string(), "person".to_string()]
}

fn default_pose_label() -> String {
    "person".to_string()
}

fn default_pose_window() -> usize {
    30
}

fn default_alert_action() -> String {
    "fall".to_string()
}

fn default_min_action_score() -> f32 {
    0.5
}
