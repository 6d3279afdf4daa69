use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::ConversionError;

/// Converts a raw sample file into folded stacks, one `frame;frame;frame count` line per stack.
pub trait StackFolder: Send + Sync {
    fn fold(&self, raw: &Path, folded: &Path) -> Result<(), ConversionError>;
}

/// Renders folded stacks as an SVG flame graph.
pub trait FlameRenderer: Send + Sync {
    fn render(&self, folded: &Path, title: &str, svg: &Path) -> Result<(), ConversionError>;
}

/// Replace every `{key}` in `template` with its value.
///
/// Unknown placeholders are left untouched.
pub fn expand_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
}

/// An external command used as a [StackFolder] or [FlameRenderer].
///
/// The arguments may use `{input}` for the input file and, when rendering, `{title}` for the graph
/// title. Whatever the command writes to stdout becomes the output file.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    name: String,
    program: PathBuf,
    args: Vec<String>,
}

impl ExternalTool {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    fn run(&self, values: &[(&str, &str)], output: &Path) -> Result<(), ConversionError> {
        let args = self
            .args
            .iter()
            .map(|arg| expand_placeholders(arg, values))
            .collect::<Vec<_>>();
        log::debug!("Running {} {:?} > {}", self.name, args, output.display());

        let stdout = File::create(output).map_err(ConversionError::io(output))?;
        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| ConversionError::Launch {
                tool: self.name.clone(),
                source,
            })?;

        if !result.status.success() {
            // Leave no partial artifact behind.
            if let Err(e) = std::fs::remove_file(output) {
                log::debug!("Could not remove {}: {e}", output.display());
            }
            return Err(ConversionError::ToolFailed {
                tool: self.name.clone(),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl StackFolder for ExternalTool {
    fn fold(&self, raw: &Path, folded: &Path) -> Result<(), ConversionError> {
        let input = raw.to_string_lossy();
        self.run(&[("input", &input)], folded)
    }
}

impl FlameRenderer for ExternalTool {
    fn render(&self, folded: &Path, title: &str, svg: &Path) -> Result<(), ConversionError> {
        let input = folded.to_string_lossy();
        self.run(&[("input", &input), ("title", title)], svg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_placeholders_only() {
        let expanded = expand_placeholders(
            "--title={title} {input} {other}",
            &[("input", "a.folded"), ("title", "light")],
        );
        assert_eq!(expanded, "--title=light a.folded {other}");
    }

    #[cfg(unix)]
    #[test]
    fn stdout_becomes_the_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("light.raw");
        std::fs::write(&raw, "main;work 3\n").unwrap();
        let folded = dir.path().join("light.folded");

        let folder = ExternalTool::new("folder", "cat", vec!["{input}".to_string()]);
        folder.fold(&raw, &folded).unwrap();

        assert_eq!(std::fs::read_to_string(&folded).unwrap(), "main;work 3\n");
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_stderr_and_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let folded = dir.path().join("light.folded");
        std::fs::write(&folded, "main;work 3\n").unwrap();
        let svg = dir.path().join("light.svg");

        let renderer = ExternalTool::new(
            "renderer",
            "sh",
            vec!["-c".to_string(), "echo 'bad input' >&2; exit 2".to_string()],
        );
        let err = renderer.render(&folded, "light", &svg).unwrap_err();

        match err {
            ConversionError::ToolFailed { tool, stderr, .. } => {
                assert_eq!(tool, "renderer");
                assert_eq!(stderr, "bad input");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!svg.exists());
    }
}
