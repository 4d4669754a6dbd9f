use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdgewatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame store error: {0}")]
    FrameStore(#[from] FrameStoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Detection error: {0}")]
    Detect(#[from] DetectError),

    #[error("Review store error: {0}")]
    Store(#[from] StoreError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl EdgewatchError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Transient errors are recovered locally by skipping the unit of work
    /// or restarting the owning subprocess.
    pub fn is_transient(&self) -> bool {
        match self {
            EdgewatchError::FrameStore(e) => e.is_transient(),
            EdgewatchError::Bus(BusError::Timeout { .. }) => true,
            EdgewatchError::Capture(_) => true,
            EdgewatchError::Detect(e) => e.is_transient(),
            EdgewatchError::Store(_) => true,
            EdgewatchError::Io(_) => true,
            EdgewatchError::Config(_) => false,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameStoreError {
    #[error("buffer {name} not found")]
    NotFound { name: String },

    #[error("buffer {name} already exists")]
    AlreadyExists { name: String },

    #[error("buffer {name} has {actual} bytes, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("buffer {name} was already written")]
    Sealed { name: String },
}

impl FrameStoreError {
    /// A size mismatch means a frame name was reused with a different layout,
    /// which the owning stage cannot recover from by skipping.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FrameStoreError::ShapeMismatch { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("request on {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("no responder registered for {topic}")]
    NoHandler { topic: String },

    #[error("responder for {topic} failed: {details}")]
    HandlerFailed { topic: String, details: String },

    #[error("bus disconnected")]
    Disconnected,

    #[error("failed to decode payload on {topic}: {details}")]
    Decode { topic: String, details: String },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ingest command is empty")]
    EmptyCommand,

    #[error("ingest process has no stdout pipe")]
    StdoutUnavailable,

    #[error("failed to terminate process {pid}: {details}")]
    Terminate { pid: u32, details: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectError {
    #[error("detector {worker} did not respond within {timeout:?}")]
    Timeout { worker: String, timeout: Duration },

    #[error("result for {worker} job {seq} was overwritten by an abandoned job")]
    StaleResult { worker: String, seq: u64 },

    #[error("detection queue for {worker} is unavailable")]
    QueueUnavailable { worker: String },

    #[error("detector backend failed: {details}")]
    Backend { details: String },

    #[error("tensor of {actual} bytes does not match model input of {expected}")]
    TensorSize { expected: usize, actual: usize },
}

impl DetectError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, DetectError::TensorSize { .. })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write review record to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode review record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EdgewatchError>;
