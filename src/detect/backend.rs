use super::RESULT_ROW_BYTES;
use crate::config::{DetectorConfig, DetectorKind};
use crate::error::DetectError;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{info, warn};

/// Raw model output with coordinates normalised to the tensor (0..1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub score: f32,
    pub y_min: f32,
    pub x_min: f32,
    pub y_max: f32,
    pub x_max: f32,
}

/// Detector backend. Receives an interleaved RGB tensor of the model size.
pub trait ObjectDetector: Send {
    fn name(&self) -> &str;

    fn detect_raw(
        &mut self,
        tensor: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<RawDetection>, DetectError>;
}

/// Builds a fresh backend each time a worker (re)starts
pub type DetectorFactory = Arc<dyn Fn() -> Result<Box<dyn ObjectDetector>, DetectError> + Send + Sync>;

pub fn factory_for(config: &DetectorConfig) -> DetectorFactory {
    match config.kind.clone() {
        DetectorKind::Null => Arc::new(|| Ok(Box::new(NullDetector) as Box<dyn ObjectDetector>)),
        DetectorKind::Process { command } => Arc::new(move || {
            ExternalProcessDetector::spawn(&command).map(|d| Box::new(d) as Box<dyn ObjectDetector>)
        }),
    }
}

/// Backend that never finds anything
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    fn detect_raw(&mut self, _tensor: &[u8], _w: u32, _h: u32) -> Result<Vec<RawDetection>, DetectError> {
        Ok(Vec::new())
    }
}

/// Model server running as a child process.
///
/// Request: `u32 width`, `u32 height` (little endian) followed by
/// `width * height * 3` RGB bytes on stdin.
/// Response: `u32 count` followed by `count` rows of six little-endian `f32`
/// values `[class_id, score, y_min, x_min, y_max, x_max]` on stdout.
pub struct ExternalProcessDetector {
    command: Vec<String>,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ExternalProcessDetector {
    pub fn spawn(command: &[String]) -> Result<Self, DetectError> {
        let (program, args) = command.split_first().ok_or_else(|| DetectError::Backend {
            details: "empty detector command".to_string(),
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DetectError::Backend {
                details: format!("failed to start {}: {}", program, e),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(DetectError::Backend {
                details: "detector process has no stdio pipes".to_string(),
            });
        };
        info!("Started detector process {} (pid {})", program, child.id());
        Ok(Self {
            command: command.to_vec(),
            child,
            stdin,
            stdout,
        })
    }

    fn exchange(&mut self, tensor: &[u8], width: u32, height: u32) -> std::io::Result<Vec<RawDetection>> {
        self.stdin.write_all(&width.to_le_bytes())?;
        self.stdin.write_all(&height.to_le_bytes())?;
        self.stdin.write_all(tensor)?;
        self.stdin.flush()?;

        let mut word = [0u8; 4];
        self.stdout.read_exact(&mut word)?;
        let count = u32::from_le_bytes(word) as usize;
        let mut rows = vec![0u8; count * 6 * 4];
        self.stdout.read_exact(&mut rows)?;
        Ok(decode_rows(&rows))
    }
}

impl ObjectDetector for ExternalProcessDetector {
    fn name(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("process")
    }

    fn detect_raw(&mut self, tensor: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>, DetectError> {
        self.exchange(tensor, width, height).map_err(|e| {
            if let Ok(Some(status)) = self.child.try_wait() {
                warn!("Detector process exited with {}", status);
            }
            DetectError::Backend {
                details: format!("detector process i/o failed: {}", e),
            }
        })
    }
}

impl Drop for ExternalProcessDetector {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Decode little-endian `f32` rows of `[class, score, y0, x0, y1, x1]`
pub fn decode_rows(bytes: &[u8]) -> Vec<RawDetection> {
    bytes
        .chunks_exact(6 * 4)
        .map(|row| {
            let v = |i: usize| f32::from_le_bytes([row[i * 4], row[i * 4 + 1], row[i * 4 + 2], row[i * 4 + 3]]);
            RawDetection {
                class_id: v(0).max(0.0) as u32,
                score: v(1),
                y_min: v(2),
                x_min: v(3),
                y_max: v(4),
                x_max: v(5),
            }
        })
        .collect()
}

/// Encode detections into exactly `rows` result rows, zero padded
pub fn encode_rows(detections: &[RawDetection], rows: usize) -> Vec<u8> {
    let mut out = vec![0u8; rows * 6 * 4];
    for (slot, det) in out.chunks_exact_mut(6 * 4).zip(detections.iter()) {
        let values = [
            det.class_id as f32,
            det.score,
            det.y_min,
            det.x_min,
            det.y_max,
            det.x_max,
        ];
        for (i, value) in values.iter().enumerate() {
            slot[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
    out
}

/// Encode a result buffer: a header row carrying `seq` followed by
/// `rows` result rows
pub fn encode_result(seq: u64, detections: &[RawDetection], rows: usize) -> Vec<u8> {
    let mut out = vec![0u8; RESULT_ROW_BYTES];
    out[..8].copy_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&encode_rows(detections, rows));
    out
}

/// Split a result buffer into its job sequence number and rows
pub fn decode_result(bytes: &[u8]) -> Option<(u64, Vec<RawDetection>)> {
    if bytes.len() < RESULT_ROW_BYTES {
        return None;
    }
    let (header, rows) = bytes.split_at(RESULT_ROW_BYTES);
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&header[..8]);
    Some((u64::from_le_bytes(seq), decode_rows(rows)))
}
