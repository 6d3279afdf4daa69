use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::definition::{CommandSpec, Scenario};

/// Overrides for a profiling session, read from the file given with `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub output_dir: Option<PathBuf>,
    pub server: Option<CommandSpec>,
    pub load_generator: Option<CommandSpec>,
    pub profiler: Option<CommandSpec>,
    pub folder: Option<CommandSpec>,
    pub renderer: Option<CommandSpec>,
    #[serde(default)]
    pub timings: TimingsConfig,
    #[serde(rename = "scenario")]
    pub scenarios: Option<Vec<Scenario>>,
    #[serde(rename = "filter")]
    pub filters: Option<Vec<FilterConfig>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingsConfig {
    pub server_warmup_ms: Option<u64>,
    pub profiler_grace_s: Option<u64>,
    pub stop_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub name: String,
    pub pattern: String,
}

impl SessionConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let config: SessionConfig = toml::from_str(
            r#"
            output_dir = "/tmp/flames"

            [profiler]
            program = "perf"
            args = ["record", "-F", "99", "-g", "-p", "{pid}", "-o", "{output}", "--", "sleep", "{duration}"]

            [timings]
            profiler_grace_s = 10

            [[scenario]]
            name = "light"
            load_args = ["--mode", "persistent"]
            profile_duration_s = 5

            [[scenario]]
            name = "burst"
            profile_duration_s = 3
            pre_load_delay_s = 1

            [[filter]]
            name = "network"
            pattern = "socket|recv|send|accept"
            "#,
        )
        .unwrap();

        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/flames")));
        assert_eq!(config.profiler.unwrap().program, "perf");
        assert!(config.server.is_none());
        assert_eq!(config.timings.profiler_grace_s, Some(10));
        assert_eq!(config.timings.server_warmup_ms, None);

        let scenarios = config.scenarios.unwrap();
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[0].load_args, vec!["--mode", "persistent"]);
        assert_eq!(scenarios[1].pre_load_delay_s, 1);
        assert!(scenarios[1].load_args.is_empty());

        assert_eq!(config.filters.unwrap()[0].name, "network");
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = toml::from_str::<SessionConfig>("output = \"x\"");
        assert!(result.is_err());
    }
}
