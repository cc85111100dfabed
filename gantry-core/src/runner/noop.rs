// Noop Runner
// Counts capability invocations without touching a container engine, so
// scheduling behavior can be asserted precisely in tests

use crate::definition::Step;
use crate::runner::{Runner, RunnerResult};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Runner that records every call under a stable key like
/// `ContainerRunner(db,test)` and reports success.
#[derive(Debug, Default)]
pub struct NoopRunner {
    counters: Mutex<HashMap<String, usize>>,
    exit_codes: HashMap<String, i32>,
    missing_images: HashSet<String>,
    run_delays: HashMap<String, Duration>,
}

impl NoopRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `run_container` report this exit code for the named step.
    pub fn with_exit_code(mut self, step: &str, code: i32) -> Self {
        self.exit_codes.insert(step.to_string(), code);
        self
    }

    /// Make `image_exists` report the named step's image as absent.
    pub fn with_missing_image(mut self, step: &str) -> Self {
        self.missing_images.insert(step.to_string());
        self
    }

    /// Make `run_container` linger for the named step, so in-flight
    /// behavior like peer cancellation can be observed.
    pub fn with_run_delay(mut self, step: &str, delay: Duration) -> Self {
        self.run_delays.insert(step.to_string(), delay);
        self
    }

    /// Number of recorded calls for an exact key.
    pub fn count(&self, key: &str) -> usize {
        self.counters
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all recorded calls.
    pub fn calls(&self) -> HashMap<String, usize> {
        self.counters.lock().unwrap().clone()
    }

    /// Total number of recorded calls across all keys.
    pub fn total(&self) -> usize {
        self.counters.lock().unwrap().values().sum()
    }

    fn record(&self, key: String) {
        *self.counters.lock().unwrap().entry(key).or_insert(0) += 1;
    }
}

#[async_trait]
impl Runner for NoopRunner {
    async fn build_image(&self, step: &Step, _force_pull: bool) -> RunnerResult<()> {
        self.record(format!("ImageBuilder({})", step.name));
        Ok(())
    }

    async fn pull_image(&self, step: &Step) -> RunnerResult<()> {
        self.record(format!("ImagePuller({})", step.name));
        Ok(())
    }

    async fn image_exists(&self, step: &Step) -> RunnerResult<bool> {
        self.record(format!("ImageExistenceChecker({})", step.name));
        Ok(!self.missing_images.contains(&step.name))
    }

    async fn kill_container(&self, step: &Step) -> RunnerResult<usize> {
        self.record(format!("ContainerKiller({})", step.name));
        Ok(1)
    }

    async fn remove_container(&self, step: &Step) -> RunnerResult<()> {
        self.record(format!("ContainerRemover({})", step.name));
        Ok(())
    }

    async fn run_container(&self, step: &Step, network: &str) -> RunnerResult<i32> {
        self.record(format!("ContainerRunner({},{})", step.name, network));
        if let Some(delay) = self.run_delays.get(&step.name) {
            tokio::time::sleep(*delay).await;
        }
        Ok(self.exit_codes.get(&step.name).copied().unwrap_or(0))
    }

    async fn create_network(&self, network: &str) -> RunnerResult<()> {
        self.record(format!("NetworkCreator({})", network));
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> RunnerResult<()> {
        self.record(format!("NetworkRemover({})", network));
        Ok(())
    }
}
