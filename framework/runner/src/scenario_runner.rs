use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use flame_tunnel_artifacts::SampleArtifact;
use flame_tunnel_core::prelude::{ScenarioError, ShutdownListener};
use flame_tunnel_summary_model::ProfilerWindow;
use flame_tunnel_supervisor::{ManagedProcess, ProcessState, ProcessSupervisor, Role, WaitOutcome};

use crate::definition::{CommandSpec, Scenario};
use crate::progress::start_progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPhase {
    Pending,
    LoadStarting,
    ProfilerRunning,
    Completed,
    Failed,
}

impl Display for ScenarioPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// What happened to one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    /// The captured samples, ready for the artifact pipeline, or why there are none.
    pub outcome: Result<SampleArtifact, ScenarioError>,
    /// Set once the profiler was started, whether or not it completed.
    pub profiler_window: Option<ProfilerWindow>,
}

struct PhaseTracker<'a> {
    scenario: &'a str,
    phase: ScenarioPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(scenario: &'a str) -> Self {
        Self {
            scenario,
            phase: ScenarioPhase::Pending,
        }
    }

    fn advance(&mut self, next: ScenarioPhase) {
        log::debug!("Scenario [{}]: {} -> {}", self.scenario, self.phase, next);
        self.phase = next;
    }
}

/// Runs scenarios one after the other against a single target server.
pub struct ScenarioRunner<'a> {
    supervisor: &'a ProcessSupervisor,
    target: &'a ManagedProcess,
    load_generator: &'a CommandSpec,
    profiler: &'a CommandSpec,
    run_dir: &'a Path,
    profiler_grace: Duration,
    shutdown_listener: ShutdownListener,
    show_progress: bool,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(
        supervisor: &'a ProcessSupervisor,
        target: &'a ManagedProcess,
        load_generator: &'a CommandSpec,
        profiler: &'a CommandSpec,
        run_dir: &'a Path,
        shutdown_listener: ShutdownListener,
    ) -> Self {
        Self {
            supervisor,
            target,
            load_generator,
            profiler,
            run_dir,
            profiler_grace: crate::definition::DEFAULT_PROFILER_GRACE,
            shutdown_listener,
            show_progress: false,
        }
    }

    pub fn with_profiler_grace(mut self, grace: Duration) -> Self {
        self.profiler_grace = grace;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Run every scenario in order. One failing scenario never prevents the next from running.
    ///
    /// Once shutdown has been requested the remaining scenarios are reported as interrupted
    /// without starting anything.
    pub async fn run_all(&mut self, scenarios: &[Scenario]) -> Vec<ScenarioResult> {
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let result = if self.shutdown_listener.should_shutdown() {
                log::info!("Skipping scenario [{}], the run was interrupted", scenario.name);
                ScenarioResult {
                    scenario: scenario.clone(),
                    outcome: Err(ScenarioError::Interrupted),
                    profiler_window: None,
                }
            } else {
                self.run_scenario(scenario).await
            };
            results.push(result);
        }
        results
    }

    /// Drive one scenario through `Pending -> LoadStarting -> ProfilerRunning -> Completed | Failed`.
    ///
    /// The load generator is always stopped before this returns.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> ScenarioResult {
        log::info!("Running scenario [{}]", scenario.name);
        let mut phase = PhaseTracker::new(&scenario.name);

        let target_ready = self.supervisor.is_alive(self.target)
            && self.supervisor.state(self.target) == Some(ProcessState::Running);
        if !target_ready {
            return self.finish(
                scenario,
                &mut phase,
                Err(ScenarioError::TargetNotReady {
                    pid: self.target.pid(),
                }),
                None,
            );
        }

        phase.advance(ScenarioPhase::LoadStarting);
        let pid = self.target.pid().to_string();
        let mut load_args = self
            .load_generator
            .expanded_args(&[("pid", &pid), ("scenario", &scenario.name)]);
        load_args.extend(scenario.load_args.iter().cloned());
        let load_generator = match self
            .supervisor
            .start(Role::LoadGenerator, &self.load_generator.program, &load_args)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                return self.finish(
                    scenario,
                    &mut phase,
                    Err(ScenarioError::Spawn {
                        role: Role::LoadGenerator.to_string(),
                        message: e.to_string(),
                    }),
                    None,
                );
            }
        };

        let (outcome, window) = self.profile(scenario, &mut phase).await;

        if let Err(e) = self.supervisor.stop(&load_generator).await {
            log::warn!("Failed to stop the load generator for scenario [{}]: {e}", scenario.name);
        }

        self.finish(scenario, &mut phase, outcome, window)
    }

    async fn profile(
        &mut self,
        scenario: &Scenario,
        phase: &mut PhaseTracker<'_>,
    ) -> (Result<SampleArtifact, ScenarioError>, Option<ProfilerWindow>) {
        let supervisor = self.supervisor;

        let delay = scenario.pre_load_delay();
        if !delay.is_zero() {
            log::debug!("Letting load ramp up for {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_listener.wait_for_shutdown() => {
                    return (Err(ScenarioError::Interrupted), None);
                }
            }
        }

        let raw_path = SampleArtifact::raw_path_for(self.run_dir, &scenario.name);
        let pid = self.target.pid().to_string();
        let duration = scenario.profile_duration_s.to_string();
        let output = raw_path.to_string_lossy();
        let args = self.profiler.expanded_args(&[
            ("pid", &pid),
            ("duration", &duration),
            ("output", &output),
            ("scenario", &scenario.name),
        ]);

        phase.advance(ScenarioPhase::ProfilerRunning);
        let started_at = Utc::now();
        let profiler = match supervisor
            .start(Role::Profiler, &self.profiler.program, &args)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                let error = ScenarioError::Spawn {
                    role: Role::Profiler.to_string(),
                    message: e.to_string(),
                };
                return (Err(error), None);
            }
        };

        let progress = self
            .show_progress
            .then(|| start_progress(&scenario.name, scenario.profile_duration()));
        let limit = scenario.profiler_limit(self.profiler_grace);
        let waited = tokio::select! {
            outcome = supervisor.wait_for(&profiler, limit) => Some(outcome),
            _ = self.shutdown_listener.wait_for_shutdown() => None,
        };
        drop(progress);

        let outcome = match waited {
            Some(Ok(WaitOutcome::Completed(status))) if status.success() => {
                // Samples of a pid that went away part way through are attributed to nothing.
                if supervisor.is_alive(self.target) {
                    Ok(SampleArtifact::new(&scenario.name, raw_path))
                } else {
                    Err(ScenarioError::TargetDiedMidScenario {
                        pid: self.target.pid(),
                    })
                }
            }
            Some(Ok(WaitOutcome::Completed(status))) => Err(ScenarioError::ProfilerFailed {
                status: status.to_string(),
            }),
            Some(Ok(WaitOutcome::TimedOut)) => {
                log::warn!(
                    "Profiler for scenario [{}] did not finish within {limit:?}, stopping it",
                    scenario.name
                );
                Err(ScenarioError::ProfilerTimeout { timeout: limit })
            }
            Some(Err(e)) => Err(ScenarioError::ProfilerFailed {
                status: e.to_string(),
            }),
            None => Err(ScenarioError::Interrupted),
        };

        // A no-op if the profiler already exited.
        if let Err(e) = supervisor.stop(&profiler).await {
            log::error!("Failed to stop the profiler for scenario [{}]: {e}", scenario.name);
        }

        let window = ProfilerWindow {
            started_at_ms: started_at.timestamp_millis(),
            finished_at_ms: Utc::now().timestamp_millis(),
        };
        (outcome, Some(window))
    }

    fn finish(
        &self,
        scenario: &Scenario,
        phase: &mut PhaseTracker<'_>,
        outcome: Result<SampleArtifact, ScenarioError>,
        profiler_window: Option<ProfilerWindow>,
    ) -> ScenarioResult {
        match &outcome {
            Ok(_) => {
                phase.advance(ScenarioPhase::Completed);
                log::info!("Scenario [{}] completed", scenario.name);
            }
            Err(e) => {
                phase.advance(ScenarioPhase::Failed);
                log::warn!("Scenario [{}] failed: {e}", scenario.name);
            }
        }

        ScenarioResult {
            scenario: scenario.clone(),
            outcome,
            profiler_window,
        }
    }
}
