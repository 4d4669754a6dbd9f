use crate::error::CaptureError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lines of subprocess output kept for the crash report
pub const LOG_PIPE_LINES: usize = 100;

/// Forwards a subprocess's stderr into the log and remembers the tail of it,
/// so the output leading up to a crash can be reported.
#[derive(Clone)]
pub struct LogPipe {
    label: String,
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogPipe {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_PIPE_LINES))),
        }
    }

    /// Read `source` line by line on a background thread
    pub fn attach<R: Read + Send + 'static>(&self, source: R) -> std::io::Result<()> {
        let pipe = self.clone();
        std::thread::Builder::new()
            .name(format!("logpipe:{}", self.label))
            .spawn(move || {
                for line in BufReader::new(source).lines() {
                    match line {
                        Ok(line) => pipe.push(line),
                        Err(_) => break,
                    }
                }
            })?;
        Ok(())
    }

    pub fn push(&self, line: String) {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            return;
        }
        debug!(process = %self.label, "{}", line);
        let mut lines = self.lines.lock();
        if lines.len() == LOG_PIPE_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Log the retained output at error level and forget it
    pub fn dump(&self) {
        let lines: Vec<String> = self.lines.lock().drain(..).collect();
        if lines.is_empty() {
            return;
        }
        error!("{} exited, last output:", self.label);
        for line in lines {
            error!(process = %self.label, "{}", line);
        }
    }
}

/// A subprocess owned by the capture stage: the decode process feeding
/// frames, or a side-channel output such as a recorder.
pub struct ManagedProcess {
    label: String,
    child: Child,
    log: LogPipe,
}

impl ManagedProcess {
    /// Start `command`. With `capture_stdout` the caller reads frames from
    /// the process; otherwise stdout is discarded.
    pub fn spawn(label: &str, command: &[String], capture_stdout: bool) -> Result<Self, CaptureError> {
        let (program, args) = command.split_first().ok_or(CaptureError::EmptyCommand)?;
        let stdout = if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                command: command.join(" "),
                source,
            })?;

        let log = LogPipe::new(label);
        if let Some(stderr) = child.stderr.take() {
            if let Err(e) = log.attach(stderr) {
                warn!("{}: stderr will not be logged: {}", label, e);
            }
        }
        info!("{}: started {} (pid {})", label, program, child.id());
        Ok(Self {
            label: label.to_string(),
            child,
            log,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn log(&self) -> &LogPipe {
        &self.log
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, CaptureError> {
        self.child.stdout.take().ok_or(CaptureError::StdoutUnavailable)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the process to stop with SIGTERM and kill it once `grace` runs out
    pub fn terminate(&mut self, grace: Duration) -> Result<(), CaptureError> {
        if !self.is_running() {
            self.log.dump();
            return Ok(());
        }

        let pid = self.child.id();
        info!("{}: terminating pid {}", self.label, pid);
        // SAFETY: kill only sends a signal to a pid we own and have not reaped
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                "{}: SIGTERM failed: {}",
                self.label,
                std::io::Error::last_os_error()
            );
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("{}: exited with {}", self.label, status);
                    return Ok(());
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    return Err(CaptureError::Terminate {
                        pid,
                        details: e.to_string(),
                    })
                }
            }
        }

        warn!("{}: pid {} ignored SIGTERM, killing", self.label, pid);
        self.child.kill().map_err(|e| CaptureError::Terminate {
            pid,
            details: e.to_string(),
        })?;
        self.child.wait().map_err(|e| CaptureError::Terminate {
            pid,
            details: e.to_string(),
        })?;
        Ok(())
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
