//! Post-processing for captured profiles.
//!
//! Each raw sample file becomes a set of folded stacks, a full flame graph and one filtered flame
//! graph per [FilterRule] that matches at least one stack. Folding and rendering are delegated to
//! external tools through the [StackFolder] and [FlameRenderer] traits.

mod artifact;
mod error;
mod filter;
mod pipeline;
mod tool;

pub use artifact::SampleArtifact;
pub use error::ConversionError;
pub use filter::{FilterRule, FilterRuleError};
pub use pipeline::{ArtifactPipeline, ArtifactReport};
pub use tool::{expand_placeholders, ExternalTool, FlameRenderer, StackFolder};
