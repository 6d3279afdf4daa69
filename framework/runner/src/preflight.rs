use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use crate::definition::CommandSpec;

const PERF_EVENT_PARANOID: &str = "/proc/sys/kernel/perf_event_paranoid";

/// Find the program a command runs.
///
/// A program given as a path must exist. A bare name is looked up in the user's `PATH`.
pub fn resolve_program(program: &str) -> anyhow::Result<PathBuf> {
    if program.is_empty() {
        bail!("Program name is an empty string");
    }

    let path = Path::new(program);
    if path.components().count() > 1 {
        if !path.exists() {
            bail!(
                "Program '{}' doesn't exist",
                path.display()
            );
        }
        return Ok(path.to_path_buf());
    }

    which::which(program).with_context(|| {
        format!("'{program}' not found in PATH. Please install it or configure the path to it.")
    })
}

/// The command with its program replaced by the resolved path.
pub(crate) fn resolve_command(command: &CommandSpec) -> anyhow::Result<CommandSpec> {
    let program = resolve_program(&command.program)?;
    log::debug!("Using '{}' for '{}'", program.display(), command.program);

    Ok(CommandSpec {
        program: program.to_string_lossy().into_owned(),
        args: command.args.clone(),
    })
}

pub(crate) fn create_run_dir(output_root: &Path, run_id: &str) -> anyhow::Result<PathBuf> {
    let run_dir = output_root.join(run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create output directory {}", run_dir.display()))?;
    Ok(run_dir)
}

/// Warn when the kernel is likely to refuse attaching the profiler to another process.
///
/// Tuning the setting is left to the user.
pub(crate) fn check_perf_event_paranoid() {
    match std::fs::read_to_string(PERF_EVENT_PARANOID) {
        Ok(content) => {
            if let Some(warning) = paranoid_warning(&content) {
                log::warn!("{warning}");
            }
        }
        Err(e) => log::debug!("Could not read {PERF_EVENT_PARANOID}: {e}"),
    }
}

fn paranoid_warning(content: &str) -> Option<String> {
    let level = content.trim().parse::<i32>().ok()?;
    (level > 1).then(|| {
        format!(
            "{PERF_EVENT_PARANOID} is {level}, profiling another process may be refused. \
             Consider 'sudo sysctl kernel.perf_event_paranoid=1'"
        )
    })
}
