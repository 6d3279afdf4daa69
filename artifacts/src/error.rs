use std::path::PathBuf;
use std::process::ExitStatus;

/// A failure to turn one raw sample file, or one filtered subset of it, into an artifact.
///
/// These are reported against the affected scenario and never retried, the profiling window that
/// produced the raw data has already closed.
#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("raw sample file {} is empty", .path.display())]
    EmptyInput { path: PathBuf },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{tool} produced no output in {}", .path.display())]
    EmptyOutput { tool: String, path: PathBuf },
    #[error("{}:{line_number} is not a folded stack line: '{line}'", .path.display())]
    Malformed {
        path: PathBuf,
        line_number: usize,
        line: String,
    },
}

impl ConversionError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ConversionError::Io { path, source }
    }
}
