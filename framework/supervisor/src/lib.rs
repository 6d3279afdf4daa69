//! Process lifecycle supervision for Flame Tunnel runs.
//!
//! A [ProcessSupervisor] owns the server, load generator and profiler processes of a run. Every
//! spawned process is registered so that [ProcessSupervisor::cleanup_all] can tear the whole run
//! down, whichever way it ends.

mod process;
mod supervisor;

pub use process::{ManagedProcess, ProcessKey, ProcessState, Role, WaitOutcome};
pub use supervisor::{
    CleanupReport, ProcessSupervisor, SupervisorError, SupervisorResult, DEFAULT_SERVER_WARMUP,
    DEFAULT_STOP_GRACE,
};
