use std::path::Path;

use anyhow::Context;
use flame_tunnel_artifacts::ArtifactReport;
use flame_tunnel_summary_model::{
    append_run_summary, write_run_summary, ArtifactSummary, RunSummary, ScenarioOutcome,
    ScenarioSummary,
};

use crate::scenario_runner::ScenarioResult;

/// Written into each run directory.
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Written into the analysed directory, so the summary of the run that captured the samples is kept.
pub const ANALYSIS_SUMMARY_FILE: &str = "analysis_summary.json";

/// One line per run, in the output root.
pub const RUN_SUMMARY_LOG: &str = "run_summary.jsonl";

pub(crate) fn scenario_summary(
    result: ScenarioResult,
    artifacts: Option<ArtifactReport>,
) -> ScenarioSummary {
    let outcome = match &result.outcome {
        Ok(_) => ScenarioOutcome::Completed,
        Err(e) => ScenarioOutcome::Failed {
            kind: e.kind().to_string(),
            reason: e.to_string(),
        },
    };

    ScenarioSummary {
        name: result.scenario.name,
        profile_duration_s: result.scenario.profile_duration_s,
        pre_load_delay_s: result.scenario.pre_load_delay_s,
        outcome,
        profiler_window: result.profiler_window,
        artifacts: artifacts.map(artifact_summary),
    }
}

pub(crate) fn artifact_summary(report: ArtifactReport) -> ArtifactSummary {
    ArtifactSummary {
        raw: report.artifact.raw_path,
        folded: report.artifact.folded_path,
        rendered: report.artifact.rendered_path,
        filtered: report.artifact.filtered_rendered_paths,
        omitted_filters: report.omitted_filters,
        errors: report.errors.iter().map(|e| e.to_string()).collect(),
    }
}

pub(crate) fn store_run_summary(summary: &RunSummary, output_root: &Path) -> anyhow::Result<()> {
    let path = summary.output_dir.join(RUN_SUMMARY_FILE);
    write_run_summary(summary, &path)
        .with_context(|| format!("Failed to write run summary to {}", path.display()))?;

    let log = output_root.join(RUN_SUMMARY_LOG);
    append_run_summary(summary, &log)
        .with_context(|| format!("Failed to append run summary to {}", log.display()))?;

    log::debug!("Run summary written to {}", path.display());
    Ok(())
}

pub(crate) fn store_analysis_summary(summary: &RunSummary) -> anyhow::Result<()> {
    let path = summary.output_dir.join(ANALYSIS_SUMMARY_FILE);
    write_run_summary(summary, &path)
        .with_context(|| format!("Failed to write analysis summary to {}", path.display()))
}
