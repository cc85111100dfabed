// Error Types
// Central error enum for the pipeline compiler plus the failure wrapper
// that surfaces an exit code for the process

use crate::preprocessor::PreprocessError;
use crate::runner::RunnerError;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GantryError>;

/// Errors produced while compiling and running a pipeline.
#[derive(Debug, Error)]
pub enum GantryError {
    /// Raw YAML could not be decoded into the definition or environment model.
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Duplicate name, unknown dependency or unknown selected step.
    #[error("{0}")]
    Reference(String),

    /// The dependency analyzer found a strongly connected component
    /// with more than one member.
    #[error("dependency cycle: {0}")]
    Cycle(String),

    /// A preprocessor directive failed before the definition was decoded.
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    /// A container engine invocation failed.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// The run was interrupted by a signal or by a failing peer.
    #[error("interrupted")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GantryError {
    pub fn reference(message: impl Into<String>) -> Self {
        GantryError::Reference(message.into())
    }

    pub fn cycle(message: impl Into<String>) -> Self {
        GantryError::Cycle(message.into())
    }
}

/// A pipeline run that ended unsuccessfully.
///
/// Wraps the underlying cause together with an optional override exit
/// code. The override is only attached on the cancel path (signal or
/// peer failure); on an ordinary step failure the wrapped process exit
/// status wins.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PipelineFailure {
    #[source]
    source: GantryError,
    override_code: i32,
}

impl PipelineFailure {
    pub fn new(source: GantryError) -> Self {
        Self {
            source,
            override_code: 0,
        }
    }

    pub fn with_override(source: GantryError, override_code: i32) -> Self {
        Self {
            source,
            override_code,
        }
    }

    /// The underlying cause.
    pub fn cause(&self) -> &GantryError {
        &self.source
    }

    /// Exit code reported for the whole pipeline: the override if
    /// non-zero, else the wrapped process exit status, else 1.
    pub fn exit_code(&self) -> i32 {
        if self.override_code != 0 {
            return self.override_code;
        }
        if let GantryError::Runner(RunnerError::CommandFailed { code, .. }) = &self.source {
            if *code != 0 {
                return *code;
            }
        }
        1
    }
}

impl From<GantryError> for PipelineFailure {
    fn from(source: GantryError) -> Self {
        PipelineFailure::new(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_prefers_override() {
        let failure = PipelineFailure::with_override(GantryError::Cancelled, 130);
        assert_eq!(failure.exit_code(), 130);
    }

    #[test]
    fn test_exit_code_uses_process_status() {
        let failure = PipelineFailure::new(GantryError::Runner(RunnerError::CommandFailed {
            command: "run db".to_string(),
            code: 42,
        }));
        assert_eq!(failure.exit_code(), 42);
    }

    #[test]
    fn test_exit_code_defaults_to_one() {
        let failure = PipelineFailure::new(GantryError::reference("duplicate step name 'db'"));
        assert_eq!(failure.exit_code(), 1);
    }
}
