mod cli;
mod config;
mod definition;
mod init;
mod monitor;
mod preflight;
mod progress;
mod report;
mod run;
mod scenario_runner;
mod shutdown;
mod summary;
mod types;

pub mod prelude {
    pub use crate::cli::FlameTunnelCli;
    pub use crate::config::{FilterConfig, SessionConfig, TimingsConfig};
    pub use crate::definition::{
        CommandSpec, ProfilingDefinition, ProfilingDefinitionBuilder, Scenario, Timings,
        DEFAULT_OUTPUT_DIR, DEFAULT_PROFILER_GRACE,
    };
    pub use crate::init::init;
    pub use crate::preflight::resolve_program;
    pub use crate::report::format_report;
    pub use crate::run::{run, run_with_supervisor, RunDeclinedError};
    pub use crate::scenario_runner::{ScenarioPhase, ScenarioResult, ScenarioRunner};
    pub use crate::summary::{ANALYSIS_SUMMARY_FILE, RUN_SUMMARY_FILE, RUN_SUMMARY_LOG};
    pub use crate::types::FlameTunnelResult;

    pub use flame_tunnel_core::prelude::ScenarioError;
    pub use flame_tunnel_summary_model::{RunSummary, ScenarioOutcome};
    pub use flame_tunnel_supervisor::ProcessSupervisor;
}
