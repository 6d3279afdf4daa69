use std::path::Path;

use flame_tunnel_summary_model::{RunSummary, ScenarioOutcome, ScenarioSummary};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct ScenarioRow {
    #[tabled(rename = "Scenario")]
    name: String,
    #[tabled(rename = "Status")]
    status: &'static str,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Artifacts")]
    artifacts: String,
    #[tabled(rename = "Omitted filters")]
    omitted_filters: String,
}

impl From<&ScenarioSummary> for ScenarioRow {
    fn from(scenario: &ScenarioSummary) -> Self {
        let (status, reason) = match &scenario.outcome {
            ScenarioOutcome::Completed => ("completed", String::new()),
            ScenarioOutcome::Failed { reason, .. } => ("failed", reason.clone()),
        };

        let mut artifacts = Vec::new();
        let mut omitted_filters = Vec::new();
        let mut reasons = vec![reason];
        if let Some(a) = &scenario.artifacts {
            artifacts.extend(a.rendered.as_deref().map(file_name));
            artifacts.extend(a.filtered.values().map(|p| file_name(p)));
            omitted_filters.extend(a.omitted_filters.iter().cloned());
            reasons.extend(a.errors.iter().cloned());
        }

        ScenarioRow {
            name: scenario.name.clone(),
            status,
            reason: join_or_dash(reasons.into_iter().filter(|r| !r.is_empty()).collect()),
            artifacts: join_or_dash(artifacts),
            omitted_filters: join_or_dash(omitted_filters),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn join_or_dash(items: Vec<String>) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join("\n")
    }
}

/// Human readable report of a run: one row per scenario, the success count and where to look.
pub fn format_report(summary: &RunSummary) -> String {
    let rows = summary
        .scenarios
        .iter()
        .map(ScenarioRow::from)
        .collect::<Vec<_>>();
    let mut table = Table::new(&rows);
    table.with(Style::modern());

    let mut report = format!(
        "\nSummary of profiling session [{}], run {}\n{}\n{}/{} scenarios succeeded\n",
        summary.session_name,
        summary.run_id,
        table,
        summary.succeeded(),
        summary.scenarios.len()
    );

    if summary.rendered_artifacts().is_empty() {
        report.push_str("No flame graphs were produced\n");
    } else {
        report.push_str(&format!(
            "Flame graphs are in {}, open the .svg files in a web browser to explore them\n",
            summary.output_dir.display()
        ));
    }

    report
}

pub(crate) fn print_report(summary: &RunSummary) {
    println!("{}", format_report(summary));
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use flame_tunnel_summary_model::ArtifactSummary;

    use super::*;

    fn summary() -> RunSummary {
        RunSummary {
            run_id: "run-1".to_string(),
            session_name: "tcp_server".to_string(),
            started_at: 0,
            finished_at: 10,
            output_dir: PathBuf::from("flamegraph_output/run-1"),
            filters: vec!["network".to_string(), "computation".to_string()],
            scenarios: vec![
                ScenarioSummary {
                    name: "light".to_string(),
                    profile_duration_s: 5,
                    pre_load_delay_s: 0,
                    outcome: ScenarioOutcome::Completed,
                    profiler_window: None,
                    artifacts: Some(ArtifactSummary {
                        raw: PathBuf::from("flamegraph_output/run-1/light.raw"),
                        folded: Some(PathBuf::from("flamegraph_output/run-1/light.folded")),
                        rendered: Some(PathBuf::from("flamegraph_output/run-1/light.svg")),
                        filtered: BTreeMap::from([(
                            "network".to_string(),
                            PathBuf::from("flamegraph_output/run-1/light_network.svg"),
                        )]),
                        omitted_filters: vec!["computation".to_string()],
                        errors: vec![],
                    }),
                },
                ScenarioSummary {
                    name: "burst".to_string(),
                    profile_duration_s: 3,
                    pre_load_delay_s: 0,
                    outcome: ScenarioOutcome::Failed {
                        kind: "ProfilerTimeout".to_string(),
                        reason: "profiler did not finish within 8s".to_string(),
                    },
                    profiler_window: None,
                    artifacts: None,
                },
            ],
            flame_tunnel_version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn report_lists_every_scenario_and_the_success_count() {
        let report = format_report(&summary());

        assert!(report.contains("light_network.svg"));
        assert!(report.contains("computation"));
        assert!(report.contains("profiler did not finish within 8s"));
        assert!(report.contains("1/2 scenarios succeeded"));
        assert!(report.contains("Flame graphs are in flamegraph_output/run-1"));
    }

    #[test]
    fn report_says_when_nothing_was_rendered() {
        let mut summary = summary();
        summary.scenarios.remove(0);

        let report = format_report(&summary);
        assert!(report.contains("0/1 scenarios succeeded"));
        assert!(report.contains("No flame graphs were produced"));
    }
}
