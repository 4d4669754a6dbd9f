use crate::pipeline::CameraProcessor;
use crate::watchdog::SupervisedWorker;
use parking_lot::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A camera processing loop on its own thread. The loop owns its tracker
/// state, so it cannot be replaced alone: the watchdog escalates instead.
pub struct ProcessorThread {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ProcessorThread {
    pub fn spawn(processor: CameraProcessor, cancel: CancellationToken) -> std::io::Result<Self> {
        let name = format!("camera:{}", processor.name());
        let thread_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || processor.run(thread_cancel))?;
        Ok(Self {
            name,
            handle: Mutex::new(Some(handle)),
            cancel,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Wait up to `timeout` for the loop to return. True once joined.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if !self.is_finished() {
            return false;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
        true
    }
}

impl SupervisedWorker for ProcessorThread {
    fn name(&self) -> &str {
        &self.name
    }

    fn busy_since(&self) -> f64 {
        0.0
    }

    /// A loop that returned while not asked to stop has died
    fn is_alive(&self) -> bool {
        self.cancel.is_cancelled() || !self.is_finished()
    }

    fn restart(&self) -> bool {
        false
    }
}
