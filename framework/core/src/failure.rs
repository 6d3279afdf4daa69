use std::time::Duration;

/// Reasons a single scenario can fail.
///
/// None of these are fatal to the run. The runner records the failure against the scenario, makes
/// sure the scenario's load generator is stopped and moves on to the next scenario.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    /// The target process was not in the `Running` state when the scenario was due to start.
    #[error("target process {pid} is not running")]
    TargetNotReady { pid: u32 },
    /// The load generator or the profiler could not be launched.
    #[error("failed to spawn the {role}: {message}")]
    Spawn { role: String, message: String },
    /// The profiler did not exit within its duration plus the grace period.
    #[error("profiler did not finish within {}s", .timeout.as_secs())]
    ProfilerTimeout { timeout: Duration },
    /// The profiler exited on its own but reported a failure.
    #[error("profiler exited unsuccessfully ({status})")]
    ProfilerFailed { status: String },
    /// The target died while the profiler was attached to it, so the samples can't be trusted.
    #[error("target process {pid} exited while it was being profiled")]
    TargetDiedMidScenario { pid: u32 },
    /// A shutdown signal arrived before or during the scenario.
    #[error("interrupted by shutdown signal")]
    Interrupted,
}

impl ScenarioError {
    /// A stable, short name for the failure, used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ScenarioError::TargetNotReady { .. } => "TargetNotReady",
            ScenarioError::Spawn { .. } => "Spawn",
            ScenarioError::ProfilerTimeout { .. } => "ProfilerTimeout",
            ScenarioError::ProfilerFailed { .. } => "ProfilerFailed",
            ScenarioError::TargetDiedMidScenario { .. } => "TargetDiedMidScenario",
            ScenarioError::Interrupted => "Interrupted",
        }
    }
}
