use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha3::Digest;
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};

/// Summary of a profiling run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// The unique run id
    ///
    /// Chosen by the runner. Also the name of the run's output directory.
    pub run_id: String,
    /// The name of the profiling session that was run
    pub session_name: String,
    /// The time the run started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// The time the run finished, after artifacts were produced and processes cleaned up
    ///
    /// This is a Unix timestamp in seconds.
    pub finished_at: i64,
    /// The directory that holds all artifacts of this run
    pub output_dir: PathBuf,
    /// The names of the filters applied to every folded profile
    pub filters: Vec<String>,
    /// One entry per scenario, in the order they ran
    pub scenarios: Vec<ScenarioSummary>,
    /// The version of Flame Tunnel that was used for this run
    pub flame_tunnel_version: String,
}

/// What happened to a single scenario
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioSummary {
    pub name: String,
    /// The configured profiling window, in seconds
    pub profile_duration_s: u64,
    /// The configured delay between starting the load and attaching the profiler, in seconds
    pub pre_load_delay_s: u64,
    pub outcome: ScenarioOutcome,
    /// When the profiler was attached and when it finished or was given up on
    ///
    /// Not set if the scenario failed before the profiler was started.
    pub profiler_window: Option<ProfilerWindow>,
    /// The artifacts produced from the captured samples
    ///
    /// Only set for completed scenarios.
    pub artifacts: Option<ArtifactSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Completed,
    Failed {
        /// Short, stable name of the failure, e.g. `ProfilerTimeout`
        kind: String,
        /// Human readable description of the failure
        reason: String,
    },
}

/// Unix timestamps in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilerWindow {
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

impl ProfilerWindow {
    /// Whether two windows share any instant
    pub fn overlaps(&self, other: &ProfilerWindow) -> bool {
        self.started_at_ms < other.finished_at_ms && other.started_at_ms < self.finished_at_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at_ms - self.started_at_ms
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSummary {
    /// The raw sample file written by the profiler
    pub raw: PathBuf,
    /// The folded stacks, if folding succeeded
    pub folded: Option<PathBuf>,
    /// The full flame graph, if rendering succeeded
    pub rendered: Option<PathBuf>,
    /// Filtered flame graphs by filter name
    pub filtered: BTreeMap<String, PathBuf>,
    /// Filters that matched no folded stacks, so produced no flame graph
    pub omitted_filters: Vec<String>,
    /// Conversion errors, the scenario's remaining artifacts were still attempted where possible
    pub errors: Vec<String>,
}

impl RunSummary {
    /// Number of scenarios that completed
    pub fn succeeded(&self) -> usize {
        self.scenarios
            .iter()
            .filter(|s| s.outcome == ScenarioOutcome::Completed)
            .count()
    }

    /// Every SVG produced by the run, full graphs first
    pub fn rendered_artifacts(&self) -> Vec<&Path> {
        let artifacts = self.scenarios.iter().filter_map(|s| s.artifacts.as_ref());
        artifacts
            .clone()
            .filter_map(|a| a.rendered.as_deref())
            .chain(artifacts.flat_map(|a| a.filtered.values().map(PathBuf::as_path)))
            .collect()
    }

    /// Compute a fingerprint for this run summary
    ///
    /// The fingerprint is intended to identify runs made with the same configuration. It uses the
    ///     - Session name
    ///     - Scenario names, durations and delays
    ///     - Filter names
    ///     - Flame Tunnel version
    ///
    /// The fingerprint is computed using [sha3::Sha3_256].
    pub fn fingerprint(&self) -> String {
        let mut hasher = sha3::Sha3_256::new();
        Digest::update(&mut hasher, self.session_name.as_bytes());
        self.scenarios
            .iter()
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .for_each(|s| {
                Digest::update(&mut hasher, s.name.as_bytes());
                Digest::update(&mut hasher, s.profile_duration_s.to_le_bytes());
                Digest::update(&mut hasher, s.pre_load_delay_s.to_le_bytes());
            });
        self.filters.iter().sorted().for_each(|f| {
            Digest::update(&mut hasher, f.as_bytes());
        });
        Digest::update(&mut hasher, self.flame_tunnel_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Append the run summary to a file
///
/// The summary will be serialized to JSON and output as a single line followed by a newline. The
/// recommended file extension is `.jsonl`.
pub fn append_run_summary(run_summary: &RunSummary, path: &Path) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_run_summary(run_summary, &mut file)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Serialize the run summary to a writer
pub fn store_run_summary<W: Write>(run_summary: &RunSummary, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run_summary)?;
    Ok(())
}

/// Write the run summary as pretty JSON into `path`, replacing any existing file
pub fn write_run_summary(run_summary: &RunSummary, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, run_summary)?;
    Ok(())
}

/// Load a run summary from a reader
pub fn load_run_summary<R: Read>(reader: R) -> anyhow::Result<RunSummary> {
    let reader = std::io::BufReader::new(reader);
    let run_summary: RunSummary = serde_json::from_reader(reader)?;
    Ok(run_summary)
}

/// Load run summaries from a file
///
/// The file should contain one JSON object per line. This is the format produced by
/// [append_run_summary].
pub fn load_summary_runs(path: &Path) -> anyhow::Result<Vec<RunSummary>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let run: RunSummary = serde_json::from_str(&line)?;
        runs.push(run);
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scenario(name: &str, outcome: ScenarioOutcome) -> ScenarioSummary {
        ScenarioSummary {
            name: name.to_string(),
            profile_duration_s: 5,
            pre_load_delay_s: 1,
            outcome,
            profiler_window: None,
            artifacts: None,
        }
    }

    fn sample_summary() -> RunSummary {
        RunSummary {
            run_id: "20240101T000000Z-abc".to_string(),
            session_name: "tcp_server".to_string(),
            started_at: 1_700_000_000,
            finished_at: 1_700_000_030,
            output_dir: PathBuf::from("flamegraph_output/20240101T000000Z-abc"),
            filters: vec!["network".to_string(), "computation".to_string()],
            scenarios: vec![
                scenario("light", ScenarioOutcome::Completed),
                scenario(
                    "burst",
                    ScenarioOutcome::Failed {
                        kind: "ProfilerTimeout".to_string(),
                        reason: "profiler did not finish within 8s".to_string(),
                    },
                ),
            ],
            flame_tunnel_version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn counts_completed_scenarios() {
        assert_eq!(sample_summary().succeeded(), 1);
    }

    #[test]
    fn fingerprint_ignores_run_specific_fields() {
        let a = sample_summary();
        let mut b = sample_summary();
        b.run_id = "another".to_string();
        b.started_at += 100;
        b.scenarios.reverse();
        b.filters.reverse();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.scenarios[0].profile_duration_s = 10;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn windows_overlap_only_when_they_share_time() {
        let first = ProfilerWindow {
            started_at_ms: 0,
            finished_at_ms: 5_000,
        };
        let second = ProfilerWindow {
            started_at_ms: 5_000,
            finished_at_ms: 8_000,
        };
        assert!(!first.overlaps(&second));
        assert!(first.overlaps(&ProfilerWindow {
            started_at_ms: 4_999,
            finished_at_ms: 6_000,
        }));
    }

    #[test]
    fn appended_summaries_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_summary.jsonl");

        let mut summary = sample_summary();
        summary.scenarios[0].artifacts = Some(ArtifactSummary {
            raw: PathBuf::from("light.raw"),
            folded: Some(PathBuf::from("light.folded")),
            rendered: Some(PathBuf::from("light.svg")),
            filtered: BTreeMap::from([(
                "network".to_string(),
                PathBuf::from("light_network.svg"),
            )]),
            omitted_filters: vec!["computation".to_string()],
            errors: vec![],
        });

        append_run_summary(&summary, &path).unwrap();
        append_run_summary(&summary, &path).unwrap();

        let loaded = load_summary_runs(&path).unwrap();
        assert_eq!(loaded, vec![summary.clone(), summary.clone()]);
        assert_eq!(
            loaded[0].rendered_artifacts(),
            vec![Path::new("light.svg"), Path::new("light_network.svg")]
        );
    }
}
