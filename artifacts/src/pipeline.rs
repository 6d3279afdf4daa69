use std::io::Write;
use std::path::{Path, PathBuf};

use crate::artifact::{
    artifact_stem, filtered_path_for, folded_path_for, rendered_path_for, SampleArtifact,
};
use crate::error::ConversionError;
use crate::filter::FilterRule;
use crate::tool::{FlameRenderer, StackFolder};

/// The outcome of processing one [SampleArtifact].
#[derive(Debug)]
pub struct ArtifactReport {
    pub artifact: SampleArtifact,
    /// Filters that selected no stacks, so no graph was produced for them.
    pub omitted_filters: Vec<String>,
    pub errors: Vec<ConversionError>,
}

impl ArtifactReport {
    fn new(artifact: SampleArtifact) -> Self {
        Self {
            artifact,
            omitted_filters: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Whether the full flame graph was produced.
    pub fn is_rendered(&self) -> bool {
        self.artifact.rendered_path.is_some()
    }
}

pub struct ArtifactPipeline {
    folder: Box<dyn StackFolder>,
    renderer: Box<dyn FlameRenderer>,
    filters: Vec<FilterRule>,
}

impl ArtifactPipeline {
    pub fn new(
        folder: impl StackFolder + 'static,
        renderer: impl FlameRenderer + 'static,
        filters: Vec<FilterRule>,
    ) -> Self {
        Self {
            folder: Box::new(folder),
            renderer: Box::new(renderer),
            filters,
        }
    }

    pub fn filters(&self) -> &[FilterRule] {
        &self.filters
    }

    /// Fold a raw sample file into `<stem>.folded` next to it.
    ///
    /// Fails without calling the folder if the raw file is missing or empty. The folder's output is
    /// checked to be non-empty and to consist only of `stack count` lines.
    pub fn fold(&self, raw: &Path) -> Result<PathBuf, ConversionError> {
        let metadata = std::fs::metadata(raw).map_err(ConversionError::io(raw))?;
        if metadata.len() == 0 {
            return Err(ConversionError::EmptyInput {
                path: raw.to_path_buf(),
            });
        }

        let folded = folded_path_for(raw);
        self.folder.fold(raw, &folded)?;

        let content = std::fs::read_to_string(&folded).map_err(ConversionError::io(&folded))?;
        validate_folded(&content, &folded)?;

        Ok(folded)
    }

    /// Render the full flame graph for a folded file into `<stem>.svg`.
    pub fn render(&self, folded: &Path) -> Result<PathBuf, ConversionError> {
        let svg = rendered_path_for(folded);
        let title = artifact_stem(folded);
        self.render_to(folded, &title, &svg)?;
        Ok(svg)
    }

    /// Render a flame graph of only the folded stacks selected by `rule`.
    ///
    /// Returns `Ok(None)` when nothing matches, in which case no file is written.
    pub fn render_filtered(
        &self,
        folded: &Path,
        rule: &FilterRule,
    ) -> Result<Option<PathBuf>, ConversionError> {
        let content = std::fs::read_to_string(folded).map_err(ConversionError::io(folded))?;
        let selected = rule.select(&content);
        if selected.is_empty() {
            log::warn!(
                "Filter '{}' matched no stacks in {}, skipping its flame graph",
                rule.name(),
                folded.display()
            );
            return Ok(None);
        }
        log::debug!(
            "Filter '{}' selected {} of {} stacks in {}",
            rule.name(),
            selected.len(),
            content.lines().filter(|l| !l.trim().is_empty()).count(),
            folded.display()
        );

        let dir = folded.parent().unwrap_or(Path::new("."));
        let stem = artifact_stem(folded);
        let mut subset = tempfile::Builder::new()
            .prefix(&format!(".{stem}_{}", rule.name()))
            .suffix(".folded")
            .tempfile_in(dir)
            .map_err(ConversionError::io(dir))?;
        for line in &selected {
            writeln!(subset, "{line}").map_err(ConversionError::io(subset.path()))?;
        }
        subset.flush().map_err(ConversionError::io(subset.path()))?;

        let svg = filtered_path_for(folded, rule.name());
        let title = format!("{stem} ({})", rule.name());
        self.render_to(subset.path(), &title, &svg)?;

        Ok(Some(svg))
    }

    /// Produce every artifact for one scenario.
    ///
    /// A folding failure stops processing of this artifact. Rendering failures are recorded and
    /// the remaining graphs are still attempted.
    pub fn process(&self, artifact: SampleArtifact) -> ArtifactReport {
        let mut report = ArtifactReport::new(artifact);

        let folded = match self.fold(&report.artifact.raw_path) {
            Ok(folded) => folded,
            Err(e) => {
                log::warn!(
                    "Could not fold samples for scenario '{}': {e}",
                    report.artifact.scenario_name
                );
                report.errors.push(e);
                return report;
            }
        };
        report.artifact.folded_path = Some(folded.clone());

        match self.render(&folded) {
            Ok(svg) => {
                log::info!("Rendered {}", svg.display());
                report.artifact.rendered_path = Some(svg);
            }
            Err(e) => {
                log::warn!(
                    "Could not render flame graph for scenario '{}': {e}",
                    report.artifact.scenario_name
                );
                report.errors.push(e);
            }
        }

        for rule in &self.filters {
            match self.render_filtered(&folded, rule) {
                Ok(Some(svg)) => {
                    log::info!("Rendered {}", svg.display());
                    report
                        .artifact
                        .filtered_rendered_paths
                        .insert(rule.name().to_string(), svg);
                }
                Ok(None) => report.omitted_filters.push(rule.name().to_string()),
                Err(e) => {
                    log::warn!(
                        "Could not render '{}' flame graph for scenario '{}': {e}",
                        rule.name(),
                        report.artifact.scenario_name
                    );
                    report.errors.push(e);
                }
            }
        }

        report
    }

    pub fn process_all(&self, artifacts: Vec<SampleArtifact>) -> Vec<ArtifactReport> {
        artifacts.into_iter().map(|a| self.process(a)).collect()
    }

    fn render_to(&self, folded: &Path, title: &str, svg: &Path) -> Result<(), ConversionError> {
        self.renderer.render(folded, title, svg)?;

        let len = std::fs::metadata(svg).map_err(ConversionError::io(svg))?.len();
        if len == 0 {
            return Err(ConversionError::EmptyOutput {
                tool: "renderer".to_string(),
                path: svg.to_path_buf(),
            });
        }
        Ok(())
    }
}

fn validate_folded(content: &str, path: &Path) -> Result<(), ConversionError> {
    let mut stacks = 0;
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let well_formed = line
            .rsplit_once(' ')
            .is_some_and(|(stack, count)| !stack.is_empty() && count.parse::<u64>().is_ok());
        if !well_formed {
            return Err(ConversionError::Malformed {
                path: path.to_path_buf(),
                line_number: index + 1,
                line: line.to_string(),
            });
        }
        stacks += 1;
    }

    if stacks == 0 {
        return Err(ConversionError::EmptyOutput {
            tool: "folder".to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
