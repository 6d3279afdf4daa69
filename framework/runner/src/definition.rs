use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use flame_tunnel_artifacts::{expand_placeholders, FilterRule};
use flame_tunnel_supervisor::{ProcessSupervisor, DEFAULT_SERVER_WARMUP, DEFAULT_STOP_GRACE};
use serde::{Deserialize, Serialize};

use crate::cli::FlameTunnelCli;
use crate::config::SessionConfig;

/// The output root used when neither the session nor the CLI choose one.
pub const DEFAULT_OUTPUT_DIR: &str = "flamegraph_output";

/// Extra time the profiler gets on top of the scenario's profiling duration before it is
/// considered hung.
pub const DEFAULT_PROFILER_GRACE: Duration = Duration::from_secs(5);

/// One named, time-bounded combination of a load pattern and a profiling window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    /// Appended to the load generator's arguments for this scenario.
    #[serde(default)]
    pub load_args: Vec<String>,
    pub profile_duration_s: u64,
    /// How long the load runs before the profiler is attached.
    #[serde(default)]
    pub pre_load_delay_s: u64,
}

impl Scenario {
    pub fn new(name: &str, profile_duration_s: u64) -> Self {
        Self {
            name: name.to_string(),
            load_args: Vec::new(),
            profile_duration_s,
            pre_load_delay_s: 0,
        }
    }

    pub fn with_load_args(mut self, load_args: &[&str]) -> Self {
        self.load_args = load_args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_pre_load_delay_s(mut self, pre_load_delay_s: u64) -> Self {
        self.pre_load_delay_s = pre_load_delay_s;
        self
    }

    pub fn profile_duration(&self) -> Duration {
        Duration::from_secs(self.profile_duration_s)
    }

    pub fn pre_load_delay(&self) -> Duration {
        Duration::from_secs(self.pre_load_delay_s)
    }

    /// How long the profiler may run, its profiling duration plus `grace`, before it is given up on.
    pub fn profiler_limit(&self, grace: Duration) -> Duration {
        self.profile_duration().saturating_add(grace)
    }
}

/// A program and its arguments. Arguments may contain `{placeholder}`s, which ones are available
/// depends on where the command is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn expanded_args(&self, values: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| expand_placeholders(arg, values))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub server_warmup: Duration,
    pub profiler_grace: Duration,
    pub stop_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            server_warmup: DEFAULT_SERVER_WARMUP,
            profiler_grace: DEFAULT_PROFILER_GRACE,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// The builder for a profiling session.
///
/// This must be used at the start of a session binary to define what gets profiled and how.
pub struct ProfilingDefinitionBuilder {
    /// The name of the session.
    ///
    /// Recommended value is `env!("CARGO_PKG_NAME")`.
    name: String,
    /// This value is initialised for you and you cannot change it.
    #[doc(hidden)]
    cli: FlameTunnelCli,
    /// The process that gets profiled. Started once and shared by every scenario.
    server: Option<CommandSpec>,
    /// Started once per scenario with the scenario's `load_args` appended.
    ///
    /// Supports the placeholders `{pid}` (the server's pid) and `{scenario}`.
    load_generator: Option<CommandSpec>,
    /// Attached to the server once per scenario. It must write its samples to `{output}` and
    /// exit on its own after `{duration}` seconds.
    ///
    /// Supports the placeholders `{pid}`, `{duration}`, `{output}` and `{scenario}`.
    profiler: Option<CommandSpec>,
    /// Turns `{input}` into folded stacks written to stdout.
    folder: Option<CommandSpec>,
    /// Turns the folded stacks in `{input}` into an SVG written to stdout, titled `{title}`.
    renderer: Option<CommandSpec>,
    scenarios: Vec<Scenario>,
    filters: Vec<(String, String)>,
    output_dir: Option<PathBuf>,
    timings: Timings,
}

/// A validated profiling session, ready to [crate::prelude::run].
#[derive(Debug)]
pub struct ProfilingDefinition {
    pub name: String,
    pub server: CommandSpec,
    pub load_generator: CommandSpec,
    pub profiler: CommandSpec,
    pub folder: CommandSpec,
    pub renderer: CommandSpec,
    /// In the order they will run, already narrowed down to the scenarios selected on the CLI.
    pub scenarios: Vec<Scenario>,
    pub filters: Vec<FilterRule>,
    pub output_root: PathBuf,
    pub timings: Timings,
    pub assume_yes: bool,
    pub no_progress: bool,
    pub analyze: Option<PathBuf>,
}

impl ProfilingDefinitionBuilder {
    /// Initialise a new session definition from its name and the command line arguments.
    pub fn new(name: &str, cli: FlameTunnelCli) -> Self {
        Self {
            name: name.to_string(),
            cli,
            server: None,
            load_generator: None,
            profiler: None,
            folder: None,
            renderer: None,
            scenarios: Vec::new(),
            filters: Vec::new(),
            output_dir: None,
            timings: Timings::default(),
        }
    }

    pub fn with_server(mut self, server: CommandSpec) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_load_generator(mut self, load_generator: CommandSpec) -> Self {
        self.load_generator = Some(load_generator);
        self
    }

    pub fn with_profiler(mut self, profiler: CommandSpec) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn with_folder(mut self, folder: CommandSpec) -> Self {
        self.folder = Some(folder);
        self
    }

    pub fn with_renderer(mut self, renderer: CommandSpec) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Add a scenario. Scenarios run in the order they are added.
    pub fn add_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    /// Add a named filter. Every completed scenario gets an extra flame graph containing only the
    /// stacks that match `pattern`, a case sensitive regular expression.
    pub fn add_filter(mut self, name: &str, pattern: &str) -> Self {
        self.filters.push((name.to_string(), pattern.to_string()));
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    pub fn with_server_warmup(mut self, warmup: Duration) -> Self {
        self.timings.server_warmup = warmup;
        self
    }

    pub fn with_profiler_grace(mut self, grace: Duration) -> Self {
        self.timings.profiler_grace = grace;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.timings.stop_grace = grace;
        self
    }

    /// Apply the config file and CLI overrides, then validate the session.
    pub fn build(mut self) -> anyhow::Result<ProfilingDefinition> {
        if let Some(path) = self.cli.config.clone() {
            let config = SessionConfig::load(&path)?;
            self = self.apply_config(config);
        }

        if let Some(output_dir) = self.cli.output_dir.clone() {
            self.output_dir = Some(output_dir);
        }
        if let Some(duration) = self.cli.duration {
            for scenario in &mut self.scenarios {
                scenario.profile_duration_s = duration;
            }
        }

        let analyze = self.cli.analyze.clone();
        validate_scenarios(&self.scenarios, analyze.is_some())?;
        let scenarios = select_scenarios(self.scenarios, &self.cli.scenario)?;

        let mut filter_names = HashSet::new();
        let mut filters = Vec::with_capacity(self.filters.len());
        for (name, pattern) in &self.filters {
            if !filter_names.insert(name.as_str()) {
                bail!("Filter [{}] is defined more than once", name);
            }
            filters.push(FilterRule::new(name.as_str(), pattern)?);
        }

        let name = self.name;
        let required = |command: Option<CommandSpec>, what: &str| {
            command.with_context(|| format!("Session [{name}] does not define a {what} command"))
        };

        Ok(ProfilingDefinition {
            server: required(self.server, "server")?,
            load_generator: required(self.load_generator, "load generator")?,
            profiler: required(self.profiler, "profiler")?,
            folder: required(self.folder, "folder")?,
            renderer: required(self.renderer, "renderer")?,
            scenarios,
            filters,
            output_root: self
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            timings: self.timings,
            assume_yes: self.cli.yes,
            no_progress: self.cli.no_progress,
            analyze,
            name,
        })
    }

    fn apply_config(mut self, config: SessionConfig) -> Self {
        log::debug!("Applying config overrides to session [{}]", self.name);

        self.output_dir = config.output_dir.or(self.output_dir);
        self.server = config.server.or(self.server);
        self.load_generator = config.load_generator.or(self.load_generator);
        self.profiler = config.profiler.or(self.profiler);
        self.folder = config.folder.or(self.folder);
        self.renderer = config.renderer.or(self.renderer);

        if let Some(ms) = config.timings.server_warmup_ms {
            self.timings.server_warmup = Duration::from_millis(ms);
        }
        if let Some(s) = config.timings.profiler_grace_s {
            self.timings.profiler_grace = Duration::from_secs(s);
        }
        if let Some(ms) = config.timings.stop_grace_ms {
            self.timings.stop_grace = Duration::from_millis(ms);
        }

        if let Some(scenarios) = config.scenarios {
            self.scenarios = scenarios;
        }
        if let Some(filters) = config.filters {
            self.filters = filters.into_iter().map(|f| (f.name, f.pattern)).collect();
        }

        self
    }
}

impl ProfilingDefinition {
    /// A supervisor configured with this session's timings.
    pub fn new_supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new()
            .with_server_warmup(self.timings.server_warmup)
            .with_stop_grace(self.timings.stop_grace)
    }

    /// Total time spent profiling if every scenario runs to completion.
    pub fn planned_runtime(&self) -> Duration {
        self.scenarios.iter().fold(Duration::ZERO, |total, s| {
            total
                .saturating_add(s.pre_load_delay())
                .saturating_add(s.profile_duration())
        })
    }
}

fn validate_scenarios(scenarios: &[Scenario], analyze: bool) -> anyhow::Result<()> {
    if scenarios.is_empty() && !analyze {
        bail!("No scenarios defined");
    }

    let mut names = HashSet::new();
    for scenario in scenarios {
        let valid_name = !scenario.name.is_empty()
            && scenario
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            bail!(
                "Scenario name [{}] must be non-empty and only use letters, digits, '_' or '-'",
                scenario.name
            );
        }
        if !names.insert(scenario.name.as_str()) {
            bail!("Scenario [{}] is defined more than once", scenario.name);
        }
        if scenario.profile_duration_s == 0 {
            bail!(
                "Scenario [{}] must profile for at least one second",
                scenario.name
            );
        }
    }

    Ok(())
}

fn select_scenarios(scenarios: Vec<Scenario>, selected: &[String]) -> anyhow::Result<Vec<Scenario>> {
    if selected.is_empty() {
        return Ok(scenarios);
    }

    for name in selected {
        if !scenarios.iter().any(|s| &s.name == name) {
            bail!(
                "Unknown scenario [{}], available scenarios are: {}",
                name,
                scenarios
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    Ok(scenarios
        .into_iter()
        .filter(|s| selected.contains(&s.name))
        .collect())
}
