mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;
mod workers;


pub use orchestrator::EdgewatchOrchestrator;
pub use runtime::publish_fragments;
pub use types::{ComponentState, RunOutcome, ShutdownReason};
pub use workers::ProcessorThread;
