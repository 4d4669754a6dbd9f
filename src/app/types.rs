/// Component lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Why the pipeline is stopping
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    Signal(String),
    /// A component published a shutdown request on the event bus
    Requested(String),
    /// A watchdog could not recover a worker on its own
    Escalation(String),
    Error(String),
}

/// What the binary should do once the pipeline has stopped
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Exit(i32),
    /// Build a fresh pipeline and start again
    Restart(String),
}
