//! Owns every process spawned during a run and guarantees they can all be torn down.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::process::{ManagedProcess, ProcessKey, ProcessState, Role, WaitOutcome};

/// How long the server is given after spawn before it can be declared dead.
pub const DEFAULT_SERVER_WARMUP: Duration = Duration::from_secs(2);

/// How long a process is given to acknowledge a termination signal before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn {role} '{program}': {source}")]
    Spawn {
        role: Role,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("a {role} is already active (pid {pid})")]
    RoleOccupied { role: Role, pid: u32 },
    #[error("{role} process {pid} is not registered with the supervisor")]
    NotRegistered { role: Role, pid: u32 },
    #[error("{role} process {pid} exited during its warm-up period")]
    NotReady { role: Role, pid: u32 },
    #[error("failed to wait for {role} process {pid}: {source}")]
    Wait {
        role: Role,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("{role} process {pid} did not acknowledge termination within {grace:?}")]
    StopUnacknowledged { role: Role, pid: u32, grace: Duration },
}

/// What [ProcessSupervisor::cleanup_all] did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Processes confirmed stopped, in the order they were stopped.
    pub stopped: Vec<ManagedProcess>,
    /// Processes that could not be confirmed stopped, with the reason.
    pub failed: Vec<(ManagedProcess, String)>,
}

struct Entry {
    process: ManagedProcess,
    child: Arc<tokio::sync::Mutex<Child>>,
}

#[derive(Default)]
struct Registry {
    /// In registration order.
    entries: Vec<Entry>,
    /// Exit status of processes that were reaped and removed from `entries`.
    exits: HashMap<ProcessKey, ExitStatus>,
}

impl Registry {
    fn entry(&self, process: &ManagedProcess) -> Option<&Entry> {
        self.entries.iter().find(|e| e.process.key() == process.key())
    }

    fn entry_mut(&mut self, process: &ManagedProcess) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.process.key() == process.key())
    }

    fn remove(&mut self, process: &ManagedProcess, status: Option<ExitStatus>) {
        self.entries.retain(|e| e.process.key() != process.key());
        if let Some(status) = status {
            self.exits.insert(process.key().clone(), status);
        }
    }
}

enum Liveness {
    Alive,
    Exited(ExitStatus),
    /// Exited, but the status is being collected by someone else.
    Gone,
    Unknown,
}

/// Tracks spawned background processes and provides a single point of guaranteed cleanup.
///
/// The registry lock is never held across an `.await`, so every method may be called
/// concurrently. The per-process child handle has its own async lock which is only held while
/// waiting on that process.
pub struct ProcessSupervisor {
    registry: Mutex<Registry>,
    server_warmup: Duration,
    stop_grace: Duration,
    cleanup_runs: AtomicUsize,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            server_warmup: DEFAULT_SERVER_WARMUP,
            stop_grace: DEFAULT_STOP_GRACE,
            cleanup_runs: AtomicUsize::new(0),
        }
    }

    pub fn with_server_warmup(mut self, warmup: Duration) -> Self {
        self.server_warmup = warmup;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn warmup_for(&self, role: Role) -> Duration {
        match role {
            Role::Server => self.server_warmup,
            Role::LoadGenerator | Role::Profiler => Duration::ZERO,
        }
    }

    /// Spawn `program` with `args` and register it under `role`.
    ///
    /// The process gets its own process group so that signals reach anything it spawns itself.
    /// Its stdout and stderr are forwarded to the log under [Role::log_target].
    pub async fn start<S: AsRef<OsStr>>(
        &self,
        role: Role,
        program: impl AsRef<OsStr>,
        args: &[S],
    ) -> SupervisorResult<ManagedProcess> {
        self.ensure_role_free(role)?;

        let program = program.as_ref();
        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            command.process_group(0);
        }

        let spawn_error = |source: std::io::Error| SupervisorError::Spawn {
            role,
            program: program.to_string_lossy().into_owned(),
            source,
        };
        let mut child = Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(&spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::other(
                "process exited before its pid could be read",
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, role, pid, log::Level::Debug);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, role, pid, log::Level::Info);
        }

        let state = if self.warmup_for(role).is_zero() {
            ProcessState::Running
        } else {
            ProcessState::Starting
        };
        let process = ManagedProcess::new(role, pid, state);
        log::info!("Started {process}");

        self.registry.lock().entries.push(Entry {
            process: process.clone(),
            child: Arc::new(tokio::sync::Mutex::new(child)),
        });

        Ok(process)
    }

    /// Wait out the rest of the process's warm-up window, then confirm it is still alive.
    ///
    /// On success the process is `Running` and the returned snapshot reflects that.
    pub async fn await_ready(&self, process: &ManagedProcess) -> SupervisorResult<ManagedProcess> {
        let remaining = self
            .warmup_for(process.role())
            .saturating_sub(process.elapsed());
        tokio::time::sleep(remaining).await;

        if !self.is_alive(process) {
            return Err(SupervisorError::NotReady {
                role: process.role(),
                pid: process.pid(),
            });
        }

        let mut registry = self.registry.lock();
        let entry = registry
            .entry_mut(process)
            .ok_or(SupervisorError::NotRegistered {
                role: process.role(),
                pid: process.pid(),
            })?;
        entry.process.set_state(ProcessState::Running);
        Ok(entry.process.clone())
    }

    /// Non-blocking liveness probe.
    ///
    /// A process whose liveness can't be determined is assumed alive while it is inside its
    /// warm-up window and dead afterwards.
    pub fn is_alive(&self, process: &ManagedProcess) -> bool {
        let Some(child) = self.child_of(process) else {
            return false;
        };

        let liveness = match child.try_lock() {
            Ok(mut child) => match child.try_wait() {
                Ok(None) => Liveness::Alive,
                Ok(Some(status)) => Liveness::Exited(status),
                Err(e) => {
                    log::debug!("Could not check status of {process}: {e}");
                    Liveness::Unknown
                }
            },
            // Someone is already waiting on this child, ask the OS instead.
            Err(_) => probe_pid(process.pid()),
        };

        match liveness {
            Liveness::Alive => {
                self.promote_if_warm(process);
                true
            }
            Liveness::Exited(status) => {
                self.record_exit(process, status);
                false
            }
            Liveness::Gone => false,
            Liveness::Unknown => process.elapsed() < self.warmup_for(process.role()),
        }
    }

    /// Block until the process exits or `limit` elapses.
    ///
    /// A process that completes is removed from the registry.
    pub async fn wait_for(
        &self,
        process: &ManagedProcess,
        limit: Duration,
    ) -> SupervisorResult<WaitOutcome> {
        let Some(child) = self.child_of(process) else {
            return match self.registry.lock().exits.get(process.key()) {
                Some(status) => Ok(WaitOutcome::Completed(*status)),
                None => Err(SupervisorError::NotRegistered {
                    role: process.role(),
                    pid: process.pid(),
                }),
            };
        };

        let mut child = child.lock().await;
        match timeout(limit, child.wait()).await {
            Ok(Ok(status)) => {
                drop(child);
                log::debug!("{process} completed with {status}");
                self.registry.lock().remove(process, Some(status));
                Ok(WaitOutcome::Completed(status))
            }
            Ok(Err(source)) => Err(SupervisorError::Wait {
                role: process.role(),
                pid: process.pid(),
                source,
            }),
            Err(_) => {
                log::debug!("{process} still running after {limit:?}");
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    /// Ask the process to terminate and wait for it to do so.
    ///
    /// Stopping a process that has already stopped, or was never registered, is a no-op. If the
    /// process ignores the termination signal for the stop grace period it is killed; if even
    /// that is not acknowledged the process is abandoned and [SupervisorError::StopUnacknowledged]
    /// is returned. In every case the process is removed from the registry.
    pub async fn stop(&self, process: &ManagedProcess) -> SupervisorResult<()> {
        let Some(child) = self.child_of(process) else {
            return Ok(());
        };
        if !self.is_alive(process) {
            self.registry.lock().remove(process, None);
            return Ok(());
        }

        log::debug!("Stopping {process}");
        #[cfg(unix)]
        signal_group(process.pid(), termination_signal(process.role()));

        let grace = self.stop_grace;
        let status = match timeout(grace, child.lock()).await {
            Ok(mut child) => {
                #[cfg(not(unix))]
                let _ = child.start_kill();

                match timeout(grace, child.wait()).await {
                    Ok(result) => result.ok(),
                    Err(_) => {
                        log::warn!("{process} ignored the termination signal, killing it");
                        force_kill(&mut child, process.pid());
                        timeout(grace, child.wait()).await.ok().and_then(Result::ok)
                    }
                }
            }
            Err(_) => None,
        };

        self.registry.lock().remove(process, status);
        match status {
            Some(status) => {
                log::info!("Stopped {process} ({status})");
                Ok(())
            }
            None => Err(SupervisorError::StopUnacknowledged {
                role: process.role(),
                pid: process.pid(),
                grace,
            }),
        }
    }

    /// Stop every registered process, most recently registered first.
    ///
    /// Individual failures are logged and collected, they never prevent attempts to stop the
    /// remaining processes. Only the first call does any work, later calls return an empty report.
    pub async fn cleanup_all(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.cleanup_runs.fetch_add(1, Ordering::SeqCst) > 0 {
            log::debug!("Cleanup has already run, nothing to do");
            return report;
        }

        let processes = self
            .registry
            .lock()
            .entries
            .iter()
            .rev()
            .map(|e| e.process.clone())
            .collect::<Vec<_>>();
        log::debug!("Cleaning up {} registered processes", processes.len());

        for mut process in processes {
            match self.stop(&process).await {
                Ok(()) => {
                    process.set_state(ProcessState::Stopped);
                    report.stopped.push(process);
                }
                Err(e) => {
                    log::error!("Failed to stop {process}: {e}");
                    report.failed.push((process, e.to_string()));
                }
            }
        }

        // `stop` removes what it touches, anything left was registered concurrently with cleanup.
        let leftover = std::mem::take(&mut self.registry.lock().entries);
        for entry in leftover {
            log::warn!("Killing {} registered during cleanup", entry.process);
            kill_entry(&entry);
            report
                .failed
                .push((entry.process, "registered during cleanup".to_string()));
        }

        report
    }

    /// How many times [ProcessSupervisor::cleanup_all] has been called.
    pub fn cleanup_runs(&self) -> usize {
        self.cleanup_runs.load(Ordering::SeqCst)
    }

    /// The supervisor's current view of the process, or `None` once it has been removed.
    pub fn state(&self, process: &ManagedProcess) -> Option<ProcessState> {
        self.registry
            .lock()
            .entry(process)
            .map(|e| e.process.state())
    }

    /// Snapshots of all registered processes, in registration order.
    pub fn registered(&self) -> Vec<ManagedProcess> {
        self.registry
            .lock()
            .entries
            .iter()
            .map(|e| e.process.clone())
            .collect()
    }

    fn child_of(&self, process: &ManagedProcess) -> Option<Arc<tokio::sync::Mutex<Child>>> {
        self.registry.lock().entry(process).map(|e| e.child.clone())
    }

    fn ensure_role_free(&self, role: Role) -> SupervisorResult<()> {
        let active = self
            .registry
            .lock()
            .entries
            .iter()
            .filter(|e| e.process.role() == role && e.process.state().is_active())
            .map(|e| e.process.clone())
            .collect::<Vec<_>>();

        for process in active {
            if self.is_alive(&process) {
                return Err(SupervisorError::RoleOccupied {
                    role,
                    pid: process.pid(),
                });
            }
        }

        Ok(())
    }

    fn promote_if_warm(&self, process: &ManagedProcess) {
        let warmup = self.warmup_for(process.role());
        if let Some(entry) = self.registry.lock().entry_mut(process) {
            if entry.process.state() == ProcessState::Starting && entry.process.elapsed() >= warmup
            {
                entry.process.set_state(ProcessState::Running);
            }
        }
    }

    /// Returns whether this is the first time the exit was seen.
    fn record_exit(&self, process: &ManagedProcess, status: ExitStatus) -> bool {
        let mut registry = self.registry.lock();
        if status.success() {
            log::debug!("{process} exited cleanly");
            registry.remove(process, Some(status));
            return true;
        }

        match registry.entry_mut(process) {
            Some(entry) if entry.process.state() != ProcessState::Failed => {
                log::warn!("{process} exited unexpectedly with {status}");
                entry.process.set_state(ProcessState::Failed);
                true
            }
            _ => false,
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.registry.get_mut().entries);
        if entries.is_empty() {
            return;
        }

        log::warn!(
            "Process supervisor dropped with {} registered processes, killing them",
            entries.len()
        );
        for entry in &entries {
            kill_entry(entry);
        }
    }
}

fn forward_output<R>(reader: R, role: Role, pid: u32, level: log::Level)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::log!(target: role.log_target(), level, "[{pid}] {line}");
        }
    });
}

fn kill_entry(entry: &Entry) {
    if let Ok(mut child) = entry.child.try_lock() {
        force_kill(&mut child, entry.process.pid());
    } else {
        #[cfg(unix)]
        signal_group(entry.process.pid(), nix::sys::signal::Signal::SIGKILL);
    }
}

fn force_kill(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        log::debug!("Failed to kill process {pid}: {e}");
    }
}

/// The profiler gets SIGINT so that it flushes the samples it has collected so far.
#[cfg(unix)]
fn termination_signal(role: Role) -> nix::sys::signal::Signal {
    use nix::sys::signal::Signal;

    match role {
        Role::Profiler => Signal::SIGINT,
        Role::Server | Role::LoadGenerator => Signal::SIGTERM,
    }
}

/// Children lead their own process group, so the group id is the child's pid.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to send {signal} to process group {pid}: {e}"),
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Gone,
        Err(_) => Liveness::Unknown,
    }
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> Liveness {
    Liveness::Unknown
}
