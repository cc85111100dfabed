// Runner Abstraction
// The capability seam between the scheduler and the container engine

mod local;
mod noop;

pub use local::LocalRunner;
pub use noop::NoopRunner;

use crate::definition::Step;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from container engine invocations.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no container engine found: {0}")]
    EngineNotFound(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

/// The full capability set the scheduler dispatches through. Nothing
/// engine-specific leaks above this trait; the scheduler treats
/// implementations as opaque action factories.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Build the step's image from its build info.
    async fn build_image(&self, step: &Step, force_pull: bool) -> RunnerResult<()>;

    /// Pull the step's image.
    async fn pull_image(&self, step: &Step) -> RunnerResult<()>;

    /// Whether the step's image is present locally.
    async fn image_exists(&self, step: &Step) -> RunnerResult<bool>;

    /// Force-stop any container previously run for this step. Returns
    /// the number of containers killed; absent containers are not an
    /// error.
    async fn kill_container(&self, step: &Step) -> RunnerResult<usize>;

    /// Remove stopped containers for this step. Absent containers are
    /// not an error.
    async fn remove_container(&self, step: &Step) -> RunnerResult<()>;

    /// Start the step's container attached to `network` and return its
    /// exit code. Detached steps report 0 as soon as the engine
    /// confirms the start.
    async fn run_container(&self, step: &Step, network: &str) -> RunnerResult<i32>;

    /// Create the shared bridge network.
    async fn create_network(&self, network: &str) -> RunnerResult<()>;

    /// Remove the shared network. Tolerates a network that is already
    /// gone.
    async fn remove_network(&self, network: &str) -> RunnerResult<()>;
}
