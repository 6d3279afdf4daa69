use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use flame_tunnel_artifacts::{ArtifactPipeline, ExternalTool, SampleArtifact};
use flame_tunnel_core::prelude::{ShutdownHandle, ShutdownListener, ShutdownSignalError};
use flame_tunnel_summary_model::{load_run_summary, RunSummary, ScenarioOutcome, ScenarioSummary};
use flame_tunnel_supervisor::{CleanupReport, ManagedProcess, ProcessSupervisor, Role};

use crate::definition::{CommandSpec, ProfilingDefinition, ProfilingDefinitionBuilder};
use crate::monitor::start_monitor;
use crate::preflight::{check_perf_event_paranoid, create_run_dir, resolve_command};
use crate::report::print_report;
use crate::scenario_runner::{ScenarioResult, ScenarioRunner};
use crate::shutdown::start_shutdown_listener;
use crate::summary::{
    artifact_summary, scenario_summary, store_analysis_summary, store_run_summary,
    RUN_SUMMARY_FILE,
};

/// Returned when the user answers anything but yes at the confirmation prompt.
///
/// Nothing has been started at that point, so session binaries should exit successfully.
#[derive(derive_more::Error, derive_more::Display, Debug, Default)]
#[display("Run declined at the confirmation prompt")]
pub struct RunDeclinedError;

/// Run a profiling session: start the server, profile every scenario, turn the samples into flame
/// graphs and report on the outcome.
///
/// Individual scenarios failing does not make the run fail. Errors are returned for invalid
/// definitions, missing tools, a server that can't be started and a run interrupted by Ctrl-C.
/// An interrupted run still writes its summary and report first.
pub fn run(definition: ProfilingDefinitionBuilder) -> anyhow::Result<RunSummary> {
    let definition = definition.build()?;
    let supervisor = definition.new_supervisor();

    run_with_supervisor(definition, &supervisor)
}

/// Like [run], with a supervisor chosen by the caller.
///
/// Every process the run starts is registered with `supervisor`, and
/// [ProcessSupervisor::cleanup_all] is called exactly once before this returns, on every path.
pub fn run_with_supervisor(
    definition: ProfilingDefinition,
    supervisor: &ProcessSupervisor,
) -> anyhow::Result<RunSummary> {
    log::info!("Running profiling session: {}", definition.name);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let run_id = new_run_id();

    // Ctrl-C keeps its default behaviour until the Ctrl-C listener is installed after the prompt.
    if let Err(e) = confirm_run(&definition, &run_id) {
        log_cleanup(&runtime.block_on(supervisor.cleanup_all()));
        return Err(e);
    }
    let shutdown_handle = start_shutdown_listener(&runtime)?;

    run_until_done(&runtime, &definition, supervisor, run_id, &shutdown_handle)
}

/// Execute the run, then clean up whatever it started before storing and reporting the summary.
fn run_until_done(
    runtime: &tokio::runtime::Runtime,
    definition: &ProfilingDefinition,
    supervisor: &ProcessSupervisor,
    run_id: String,
    shutdown_handle: &ShutdownHandle,
) -> anyhow::Result<RunSummary> {
    let result = execute(runtime, definition, supervisor, run_id, shutdown_handle);

    log_cleanup(&runtime.block_on(supervisor.cleanup_all()));

    let mut summary = result?;
    summary.finished_at = Utc::now().timestamp();
    if definition.analyze.is_some() {
        store_analysis_summary(&summary)?;
    } else {
        store_run_summary(&summary, &definition.output_root)?;
    }
    print_report(&summary);

    if shutdown_handle.is_shutdown() {
        return Err(ShutdownSignalError::default().into());
    }

    Ok(summary)
}

fn execute(
    runtime: &tokio::runtime::Runtime,
    definition: &ProfilingDefinition,
    supervisor: &ProcessSupervisor,
    run_id: String,
    shutdown_handle: &ShutdownHandle,
) -> anyhow::Result<RunSummary> {
    if let Some(dir) = &definition.analyze {
        return analyze(definition, dir);
    }

    let server = resolve_command(&definition.server)?;
    let load_generator = resolve_command(&definition.load_generator)?;
    let profiler = resolve_command(&definition.profiler)?;
    let pipeline = pipeline(definition)?;
    check_perf_event_paranoid();

    if shutdown_handle.is_shutdown() {
        log::info!("Interrupted before the server was started");
        return Err(ShutdownSignalError::default().into());
    }
    let run_dir = create_run_dir(&definition.output_root, &run_id)?;

    let started_at = Utc::now().timestamp();
    let results = runtime.block_on(async {
        let target = start_server(supervisor, &server, shutdown_handle.new_listener()).await?;

        let monitor = ShutdownHandle::new();
        start_monitor(target.pid(), monitor.new_listener());

        let mut runner = ScenarioRunner::new(
            supervisor,
            &target,
            &load_generator,
            &profiler,
            &run_dir,
            shutdown_handle.new_listener(),
        )
        .with_profiler_grace(definition.timings.profiler_grace)
        .with_progress(!definition.no_progress);
        let results = runner.run_all(&definition.scenarios).await;

        monitor.shutdown();
        anyhow::Ok(results)
    })?;

    if shutdown_handle.is_shutdown() {
        log::info!("Processing the samples captured before the run was interrupted");
    }
    let scenarios = results
        .into_iter()
        .map(|result| process_result(&pipeline, result))
        .collect();

    Ok(RunSummary {
        run_id,
        session_name: definition.name.clone(),
        started_at,
        finished_at: Utc::now().timestamp(),
        output_dir: run_dir,
        filters: filter_names(&pipeline),
        scenarios,
        flame_tunnel_version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Start the server and wait out its warm-up.
///
/// Only a failure to spawn is fatal. A server that dies while warming up is left for every
/// scenario to report as not ready. A shutdown signal ends the warm-up early, the scenarios then
/// report themselves as interrupted.
async fn start_server(
    supervisor: &ProcessSupervisor,
    server: &CommandSpec,
    mut shutdown_listener: ShutdownListener,
) -> anyhow::Result<ManagedProcess> {
    let process = supervisor
        .start(Role::Server, &server.program, &server.args)
        .await
        .context("Failed to start the server")?;

    tokio::select! {
        ready = supervisor.await_ready(&process) => match ready {
            Ok(ready) => {
                log::info!("Server is ready, pid {}", ready.pid());
                Ok(ready)
            }
            Err(e) => {
                log::error!("Server is not ready: {e}");
                Ok(process)
            }
        },
        _ = shutdown_listener.wait_for_shutdown() => {
            log::info!("Interrupted while the server was warming up");
            Ok(process)
        }
    }
}

fn process_result(pipeline: &ArtifactPipeline, result: ScenarioResult) -> ScenarioSummary {
    let report = match &result.outcome {
        Ok(artifact) => Some(pipeline.process(artifact.clone())),
        Err(_) => None,
    };
    scenario_summary(result, report)
}

/// Re-run folding and rendering over the raw files left by an earlier run.
fn analyze(definition: &ProfilingDefinition, dir: &Path) -> anyhow::Result<RunSummary> {
    log::info!("Analysing raw samples in {}", dir.display());

    let raw_files = raw_files(dir)?;
    if raw_files.is_empty() {
        bail!("No .raw files found in {}", dir.display());
    }

    let pipeline = pipeline(definition)?;
    let recorded = recorded_scenarios(dir);
    let started_at = Utc::now().timestamp();
    let scenarios = raw_files
        .into_iter()
        .map(|raw| {
            let name = raw
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let report = pipeline.process(SampleArtifact::new(name.clone(), raw));
            let recorded = recorded.get(&name);
            ScenarioSummary {
                profile_duration_s: recorded.map_or(0, |s| s.profile_duration_s),
                pre_load_delay_s: recorded.map_or(0, |s| s.pre_load_delay_s),
                outcome: ScenarioOutcome::Completed,
                profiler_window: recorded.and_then(|s| s.profiler_window),
                artifacts: Some(artifact_summary(report)),
                name,
            }
        })
        .collect();

    Ok(RunSummary {
        run_id: new_run_id(),
        session_name: definition.name.clone(),
        started_at,
        finished_at: Utc::now().timestamp(),
        output_dir: dir.to_path_buf(),
        filters: filter_names(&pipeline),
        scenarios,
        flame_tunnel_version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// The scenarios recorded by the run that captured the samples in `dir`, if it left a summary.
fn recorded_scenarios(dir: &Path) -> HashMap<String, ScenarioSummary> {
    let path = dir.join(RUN_SUMMARY_FILE);
    let Ok(file) = std::fs::File::open(&path) else {
        return HashMap::new();
    };

    match load_run_summary(file) {
        Ok(summary) => summary
            .scenarios
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect(),
        Err(e) => {
            log::warn!("Ignoring unreadable run summary {}: {e}", path.display());
            HashMap::new()
        }
    }
}

fn raw_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut raw_files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "raw") {
            raw_files.push(path);
        }
    }
    raw_files.sort();

    Ok(raw_files)
}

fn pipeline(definition: &ProfilingDefinition) -> anyhow::Result<ArtifactPipeline> {
    let folder = resolve_command(&definition.folder)?;
    let renderer = resolve_command(&definition.renderer)?;

    Ok(ArtifactPipeline::new(
        ExternalTool::new("folder", folder.program, folder.args),
        ExternalTool::new("renderer", renderer.program, renderer.args),
        definition.filters.clone(),
    ))
}

fn filter_names(pipeline: &ArtifactPipeline) -> Vec<String> {
    pipeline
        .filters()
        .iter()
        .map(|f| f.name().to_string())
        .collect()
}

fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        nanoid::nanoid!(8, &nanoid::alphabet::SAFE)
    )
}

/// Ask before starting anything, unless the run was pre-approved or only re-analyses samples.
fn confirm_run(definition: &ProfilingDefinition, run_id: &str) -> anyhow::Result<()> {
    if definition.analyze.is_some() || definition.assume_yes {
        return Ok(());
    }

    if confirm(definition, &definition.output_root.join(run_id))? {
        Ok(())
    } else {
        Err(RunDeclinedError.into())
    }
}

fn confirm(definition: &ProfilingDefinition, run_dir: &Path) -> anyhow::Result<bool> {
    println!(
        "Profiling session [{}] will run {} scenario(s), taking about {}s:",
        definition.name,
        definition.scenarios.len(),
        definition.planned_runtime().as_secs()
    );
    for scenario in &definition.scenarios {
        println!(
            "  - {}: profile for {}s after {}s of load",
            scenario.name, scenario.profile_duration_s, scenario.pre_load_delay_s
        );
    }
    println!("Output will be written to {}", run_dir.display());
    print!("Continue? [y/N] ");
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read the confirmation")?;

    Ok(matches!(
        answer.trim().to_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn log_cleanup(cleanup: &CleanupReport) {
    for process in &cleanup.stopped {
        log::debug!("Cleaned up {process}");
    }
    for (process, reason) in &cleanup.failed {
        log::error!("Could not clean up {process}: {reason}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::cli::FlameTunnelCli;
    use crate::definition::Scenario;
    use crate::summary::RUN_SUMMARY_LOG;
    use pretty_assertions::assert_eq;

    const PROFILER: &str = r#"sleep "$2"; printf 'main;handle;recv 5\n' > "$1""#;

    fn session(output_dir: &Path, server: CommandSpec) -> ProfilingDefinitionBuilder {
        let cli = FlameTunnelCli {
            output_dir: Some(output_dir.to_path_buf()),
            yes: true,
            no_progress: true,
            ..Default::default()
        };
        ProfilingDefinitionBuilder::new("interrupted_session", cli)
            .with_server(server)
            .with_load_generator(CommandSpec::new("sleep", &["30"]))
            .with_profiler(CommandSpec::new(
                "sh",
                &["-c", PROFILER, "profiler", "{output}", "{duration}"],
            ))
            .with_folder(CommandSpec::new("cat", &["{input}"]))
            .with_renderer(CommandSpec::new("cat", &["{input}"]))
            .add_filter("network", "recv")
            .with_server_warmup(Duration::from_millis(100))
            .with_profiler_grace(Duration::from_secs(1))
            .with_stop_grace(Duration::from_millis(500))
    }

    fn shutdown_after(delay: Duration) -> ShutdownHandle {
        let handle = ShutdownHandle::new();
        let signaller = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            signaller.shutdown();
        });
        handle
    }

    fn stored_summary(run_dir: &Path) -> RunSummary {
        let file = std::fs::File::open(run_dir.join(RUN_SUMMARY_FILE)).unwrap();
        load_run_summary(file).unwrap()
    }

    fn kinds(summary: &RunSummary) -> Vec<Option<&str>> {
        summary
            .scenarios
            .iter()
            .map(|s| match &s.outcome {
                ScenarioOutcome::Completed => None,
                ScenarioOutcome::Failed { kind, .. } => Some(kind.as_str()),
            })
            .collect()
    }

    #[test]
    fn interrupted_run_keeps_the_samples_captured_so_far() {
        let output = tempfile::tempdir().unwrap();
        let definition = session(output.path(), CommandSpec::new("sleep", &["30"]))
            .add_scenario(Scenario::new("light", 1))
            .add_scenario(Scenario::new("burst", 30))
            .add_scenario(Scenario::new("mixed", 1))
            .build()
            .unwrap();
        let supervisor = definition.new_supervisor();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let shutdown_handle = shutdown_after(Duration::from_secs(3));

        let err = run_until_done(
            &runtime,
            &definition,
            &supervisor,
            "interrupted".to_string(),
            &shutdown_handle,
        )
        .unwrap_err();

        assert!(err.downcast_ref::<ShutdownSignalError>().is_some());
        assert_eq!(supervisor.cleanup_runs(), 1);
        assert!(supervisor.registered().is_empty());

        let run_dir = output.path().join("interrupted");
        let summary = stored_summary(&run_dir);
        assert_eq!(
            kinds(&summary),
            vec![None, Some("Interrupted"), Some("Interrupted")]
        );
        assert!(summary.scenarios[1].profiler_window.is_some());
        assert!(summary.scenarios[2].profiler_window.is_none());
        assert!(run_dir.join("light.svg").is_file());
        assert!(run_dir.join("light_network.svg").is_file());
        assert!(output.path().join(RUN_SUMMARY_LOG).is_file());
    }

    #[test]
    fn run_interrupted_before_the_server_starts_spawns_nothing() {
        let output = tempfile::tempdir().unwrap();
        let marker = output.path().join("server_started");
        let server = CommandSpec::new(
            "sh",
            &["-c", r#"touch "$1"; exec sleep 30"#, "server", marker.to_str().unwrap()],
        );
        let definition = session(output.path(), server)
            .add_scenario(Scenario::new("light", 1))
            .build()
            .unwrap();
        let supervisor = definition.new_supervisor();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let shutdown_handle = ShutdownHandle::new();
        shutdown_handle.shutdown();

        let err = run_until_done(
            &runtime,
            &definition,
            &supervisor,
            "interrupted".to_string(),
            &shutdown_handle,
        )
        .unwrap_err();

        assert!(err.downcast_ref::<ShutdownSignalError>().is_some());
        assert_eq!(supervisor.cleanup_runs(), 1);
        assert!(supervisor.registered().is_empty());
        assert!(!marker.exists());
        assert!(!output.path().join("interrupted").exists());
    }

    #[test]
    fn shutdown_cuts_the_server_warmup_short() {
        let output = tempfile::tempdir().unwrap();
        let definition = session(output.path(), CommandSpec::new("sleep", &["60"]))
            .with_server_warmup(Duration::from_secs(30))
            .add_scenario(Scenario::new("light", 1))
            .add_scenario(Scenario::new("burst", 1))
            .build()
            .unwrap();
        let supervisor = definition.new_supervisor();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let shutdown_handle = shutdown_after(Duration::from_millis(300));

        let started = Instant::now();
        let err = run_until_done(
            &runtime,
            &definition,
            &supervisor,
            "warming_up".to_string(),
            &shutdown_handle,
        )
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.downcast_ref::<ShutdownSignalError>().is_some());
        assert!(supervisor.registered().is_empty());

        let summary = stored_summary(&output.path().join("warming_up"));
        assert_eq!(
            kinds(&summary),
            vec![Some("Interrupted"), Some("Interrupted")]
        );
        assert!(summary.rendered_artifacts().is_empty());
    }

    #[test]
    fn analysis_keeps_the_scenario_settings_of_the_captured_run() {
        let output = tempfile::tempdir().unwrap();
        let definition = session(output.path(), CommandSpec::new("sleep", &["30"]))
            .add_scenario(Scenario::new("light", 1).with_pre_load_delay_s(1))
            .build()
            .unwrap();
        let supervisor = definition.new_supervisor();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let captured = run_until_done(
            &runtime,
            &definition,
            &supervisor,
            "captured".to_string(),
            &ShutdownHandle::new(),
        )
        .unwrap();

        let analysis = ProfilingDefinition {
            analyze: Some(captured.output_dir.clone()),
            ..session(output.path(), CommandSpec::new("sleep", &["30"]))
                .add_scenario(Scenario::new("light", 1))
                .build()
                .unwrap()
        };
        let summary = run_until_done(
            &runtime,
            &analysis,
            &analysis.new_supervisor(),
            "analysis".to_string(),
            &ShutdownHandle::new(),
        )
        .unwrap();

        assert_eq!(summary.scenarios.len(), 1);
        let light = &summary.scenarios[0];
        assert_eq!(light.profile_duration_s, 1);
        assert_eq!(light.pre_load_delay_s, 1);
        assert_eq!(light.profiler_window, captured.scenarios[0].profiler_window);
        assert_eq!(summary.filters, vec!["network".to_string()]);
    }
}
