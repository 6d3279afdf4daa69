use std::fmt::{Display, Formatter};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// The part a spawned process plays in a profiling run.
///
/// At most one process per role may be active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The target that gets profiled.
    Server,
    /// Drives traffic at the server while the profiler is attached.
    LoadGenerator,
    /// The sampling profiler attached to the server.
    Profiler,
}

impl Role {
    /// Log target used for the output forwarded from a process with this role.
    pub fn log_target(&self) -> &'static str {
        match self {
            Role::Server => "flame_tunnel::server",
            Role::LoadGenerator => "flame_tunnel::load_generator",
            Role::Profiler => "flame_tunnel::profiler",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::LoadGenerator => write!(f, "load generator"),
            Role::Profiler => write!(f, "profiler"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned but still inside its warm-up window.
    Starting,
    Running,
    /// Confirmed stopped by the supervisor. Only seen on the snapshots of a cleanup report, a
    /// stopped process is no longer registered.
    Stopped,
    /// Exited on its own with a failure status.
    Failed,
}

impl ProcessState {
    /// Whether the process counts towards the one-per-role limit.
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

/// Identifies a process within one supervisor, independent of OS pid reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey(String);

impl ProcessKey {
    pub(crate) fn generate() -> Self {
        Self(nanoid::nanoid!())
    }
}

/// A snapshot of a process owned by a [crate::ProcessSupervisor].
///
/// The supervisor holds the authoritative state. Use [crate::ProcessSupervisor::state] to read the
/// current state rather than relying on the state captured in a snapshot.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    key: ProcessKey,
    role: Role,
    pid: u32,
    started_at: DateTime<Utc>,
    spawned: Instant,
    state: ProcessState,
}

impl ManagedProcess {
    pub(crate) fn new(role: Role, pid: u32, state: ProcessState) -> Self {
        Self {
            key: ProcessKey::generate(),
            role,
            pid,
            started_at: Utc::now(),
            spawned: Instant::now(),
            state,
        }
    }

    pub fn key(&self) -> &ProcessKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Time since the process was spawned.
    pub fn elapsed(&self) -> Duration {
        self.spawned.elapsed()
    }

    pub(crate) fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }
}

impl Display for ManagedProcess {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} process {}", self.role, self.pid)
    }
}

/// Result of waiting for a process with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(ExitStatus),
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_starting_and_running_are_active() {
        assert!(ProcessState::Starting.is_active());
        assert!(ProcessState::Running.is_active());
        assert!(!ProcessState::Stopped.is_active());
        assert!(!ProcessState::Failed.is_active());
    }

    #[test]
    fn keys_are_unique_per_process() {
        let a = ManagedProcess::new(Role::Profiler, 10, ProcessState::Running);
        let b = ManagedProcess::new(Role::Profiler, 10, ProcessState::Running);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.to_string(), "profiler process 10");
    }
}
