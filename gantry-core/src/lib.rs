// Gantry Core Library
// Container pipeline preprocessing, dependency analysis and scheduling

pub mod definition;
pub mod environment;
pub mod error;
pub mod graph;
pub mod logger;
pub mod preprocessor;
pub mod runner;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use error::{GantryError, PipelineFailure, Result};

// Re-export definition types
pub use definition::{
    sanitize_name, BuildInfo, Definition, KeepAlive, ServiceMeta, Step, StepKind,
    DEFAULT_DEFINITION_FILES,
};

// Re-export environment types
pub use environment::{Environment, DEFAULT_ENVIRONMENT_FILE};

// Re-export preprocessor types
pub use preprocessor::{Directive, Function, PreprocessError, Preprocessor};

// Re-export runner types
pub use runner::{LocalRunner, NoopRunner, Runner, RunnerError, RunnerResult};

// Re-export scheduler types
pub use scheduler::{Phase, Scheduler, SchedulerConfig};
