use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The raw samples captured for one scenario and every artifact derived from them.
///
/// Derived files live next to the raw file and share its stem, which is the scenario name:
/// `<name>.folded`, `<name>.svg` and `<name>_<filter>.svg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleArtifact {
    pub scenario_name: String,
    pub raw_path: PathBuf,
    pub folded_path: Option<PathBuf>,
    pub rendered_path: Option<PathBuf>,
    pub filtered_rendered_paths: BTreeMap<String, PathBuf>,
}

impl SampleArtifact {
    pub fn new(scenario_name: impl Into<String>, raw_path: impl Into<PathBuf>) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            raw_path: raw_path.into(),
            folded_path: None,
            rendered_path: None,
            filtered_rendered_paths: BTreeMap::new(),
        }
    }

    /// The raw sample file for a scenario inside a run directory.
    pub fn raw_path_for(run_dir: &Path, scenario_name: &str) -> PathBuf {
        run_dir.join(format!("{scenario_name}.raw"))
    }
}

pub(crate) fn folded_path_for(raw: &Path) -> PathBuf {
    raw.with_extension("folded")
}

pub(crate) fn rendered_path_for(folded: &Path) -> PathBuf {
    folded.with_extension("svg")
}

pub(crate) fn filtered_path_for(folded: &Path, filter_name: &str) -> PathBuf {
    let stem = artifact_stem(folded);
    folded.with_file_name(format!("{stem}_{filter_name}.svg"))
}

pub(crate) fn artifact_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_share_the_scenario_stem() {
        let raw = SampleArtifact::raw_path_for(Path::new("out/run-1"), "burst");
        assert_eq!(raw, PathBuf::from("out/run-1/burst.raw"));

        let folded = folded_path_for(&raw);
        assert_eq!(folded, PathBuf::from("out/run-1/burst.folded"));
        assert_eq!(rendered_path_for(&folded), PathBuf::from("out/run-1/burst.svg"));
        assert_eq!(
            filtered_path_for(&folded, "network"),
            PathBuf::from("out/run-1/burst_network.svg")
        );
    }
}
