// Pipeline Scheduler
// Walks the compiled stages phase by phase, fans work out to concurrent
// workers and guarantees teardown on exit or signal

use crate::definition::{Definition, KeepAlive, Step};
use crate::environment::Environment;
use crate::error::{GantryError, PipelineFailure, Result};
use crate::graph;
use crate::runner::{Runner, RunnerError};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// The per-step work dispatched while walking the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    KillContainers,
    RemoveContainers,
    PullImages,
    BuildImages,
    ExecuteSteps,
}

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pull images even when they are present locally.
    pub force_pull: bool,
    /// Install the SIGINT/SIGTERM listener. Disabled in tests.
    pub handle_signals: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            force_pull: false,
            handle_signals: true,
        }
    }
}

/// Stage-by-stage concurrent executor over a compiled pipeline.
///
/// The step map is immutable once the scheduler is built; selection and
/// cycle analysis happen at construction so every entry point starts
/// from a validated plan.
pub struct Scheduler {
    steps: HashMap<String, Step>,
    stages: Vec<Vec<String>>,
    runner: Arc<dyn Runner>,
    env: Arc<Environment>,
    network: String,
    config: SchedulerConfig,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        definition: Definition,
        runner: Arc<dyn Runner>,
        env: Environment,
    ) -> Result<Self> {
        Self::with_config(definition, runner, env, SchedulerConfig::default())
    }

    pub fn with_config(
        definition: Definition,
        runner: Arc<dyn Runner>,
        env: Environment,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let mut steps = definition.steps;
        graph::select_steps(&mut steps);
        let stages = graph::execution_order(&steps)?;
        graph::detect_cycles(&steps, &stages)?;

        let network = env.project_name();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(Self {
            steps,
            stages,
            runner,
            env: Arc::new(env),
            network,
            config,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        })
    }

    /// The validated step map, ignored steps included.
    pub fn steps(&self) -> &HashMap<String, Step> {
        &self.steps
    }

    /// The computed stage order over the scheduled steps.
    pub fn stages(&self) -> &[Vec<String>] {
        &self.stages
    }

    /// The shared network name (the project name).
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Full pipeline run: clear stale containers, prepare images,
    /// create the network, execute the stages. Teardown and temp-dir
    /// cleanup always run, whatever the outcome.
    pub async fn up(&self) -> std::result::Result<(), PipelineFailure> {
        self.spawn_signal_listener();
        let result = self.run_up().await;
        self.teardown().await;
        self.env.clean_up();
        result
    }

    async fn run_up(&self) -> std::result::Result<(), PipelineFailure> {
        self.walk_stages(Phase::KillContainers).await?;
        self.walk_stages(Phase::RemoveContainers).await?;
        self.walk_stages(Phase::PullImages).await?;
        self.walk_stages(Phase::BuildImages).await?;
        self.check_cancelled()?;
        self.runner
            .create_network(&self.network)
            .await
            .map_err(|e| PipelineFailure::new(GantryError::Runner(e)))?;
        self.walk_stages(Phase::ExecuteSteps).await
    }

    /// Create the network and execute the stages without the image and
    /// container preparation phases.
    pub async fn start(&self) -> std::result::Result<(), PipelineFailure> {
        self.spawn_signal_listener();
        let result = async {
            self.check_cancelled()?;
            self.runner
                .create_network(&self.network)
                .await
                .map_err(|e| PipelineFailure::new(GantryError::Runner(e)))?;
            self.walk_stages(Phase::ExecuteSteps).await
        }
        .await;
        self.teardown().await;
        self.env.clean_up();
        result
    }

    /// Kill and remove every container and the network, disregarding
    /// keep-alive — `down` is the explicit request to clean up.
    pub async fn down(&self) -> std::result::Result<(), PipelineFailure> {
        let mut names: Vec<&String> = self.steps.keys().collect();
        names.sort_unstable();
        for name in names {
            let step = &self.steps[name];
            if let Err(e) = self.runner.kill_container(step).await {
                tracing::warn!(step = %name, error = %e, "kill failed during down");
            }
            if let Err(e) = self.runner.remove_container(step).await {
                tracing::warn!(step = %name, error = %e, "rm failed during down");
            }
        }
        if let Err(e) = self.runner.remove_network(&self.network).await {
            tracing::warn!(network = %self.network, error = %e, "network rm failed during down");
        }
        self.env.clean_up();
        Ok(())
    }

    /// Run a single phase over the stages (the `build`, `pull`, `kill`
    /// and `rm` sub-commands).
    pub async fn run_phase(&self, phase: Phase) -> std::result::Result<(), PipelineFailure> {
        self.walk_stages(phase).await
    }

    async fn walk_stages(&self, phase: Phase) -> std::result::Result<(), PipelineFailure> {
        for stage in &self.stages {
            self.check_cancelled()?;
            self.run_stage(stage, phase).await?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> std::result::Result<(), PipelineFailure> {
        if *self.cancel_rx.borrow() {
            Err(PipelineFailure::with_override(GantryError::Cancelled, 130))
        } else {
            Ok(())
        }
    }

    /// Dispatch one phase action per step in the stage and block on the
    /// join barrier. A failing step (unless its failure is ignored)
    /// cancels its in-flight peers; each peer issues a best-effort kill
    /// for its own container before returning.
    async fn run_stage(
        &self,
        stage: &[String],
        phase: Phase,
    ) -> std::result::Result<(), PipelineFailure> {
        let mut workers: JoinSet<(String, Result<()>)> = JoinSet::new();
        for name in stage {
            let step = self.steps[name].clone();
            let runner = Arc::clone(&self.runner);
            let network = self.network.clone();
            let force_pull = self.config.force_pull;
            let mut cancel = self.cancel_rx.clone();
            workers.spawn(async move {
                let name = step.name.clone();
                let result = tokio::select! {
                    result = phase_action(runner.as_ref(), &step, phase, &network, force_pull) => result,
                    // the watch guard must be released before the kill
                    // so the worker future stays Send
                    _ = async {
                        let _ = cancel.wait_for(|cancelled| *cancelled).await;
                    } => {
                        let _ = runner.kill_container(&step).await;
                        Err(GantryError::Cancelled)
                    }
                };
                (name, result)
            });
        }

        let mut failure: Option<PipelineFailure> = None;
        let mut cancelled = false;
        while let Some(joined) = workers.join_next().await {
            let (name, result) = match joined {
                Ok(worker) => worker,
                Err(e) => {
                    tracing::error!(error = %e, "stage worker panicked");
                    cancelled = true;
                    let _ = self.cancel_tx.send(true);
                    continue;
                }
            };
            match result {
                Ok(()) => {}
                Err(GantryError::Cancelled) => cancelled = true,
                Err(e) => {
                    if self.steps[&name].meta.ignore_failure {
                        tracing::warn!(step = %name, error = %e, "step failed, failure ignored");
                        continue;
                    }
                    tracing::error!(step = %name, error = %e, "step failed, cancelling stage");
                    let _ = self.cancel_tx.send(true);
                    if failure.is_none() {
                        failure = Some(PipelineFailure::new(e));
                    }
                }
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None if cancelled => Err(PipelineFailure::with_override(GantryError::Cancelled, 130)),
            None => Ok(()),
        }
    }

    /// Kill and remove every container that is not kept alive, remove
    /// the network. Best-effort and idempotent: absent containers and a
    /// missing network are tolerated by the runner, anything else is
    /// logged and swallowed.
    async fn teardown(&self) {
        let mut names: Vec<&String> = self.steps.keys().collect();
        names.sort_unstable();
        for name in names {
            let step = &self.steps[name];
            if matches!(step.meta.keep_alive, KeepAlive::Yes | KeepAlive::Replace) {
                continue;
            }
            if let Err(e) = self.runner.kill_container(step).await {
                tracing::warn!(step = %name, error = %e, "kill failed during teardown");
            }
            if let Err(e) = self.runner.remove_container(step).await {
                tracing::warn!(step = %name, error = %e, "rm failed during teardown");
            }
        }
        if let Err(e) = self.runner.remove_network(&self.network).await {
            tracing::warn!(network = %self.network, error = %e, "network rm failed during teardown");
        }
    }

    fn spawn_signal_listener(&self) {
        if !self.config.handle_signals {
            return;
        }
        let cancel_tx = Arc::clone(&self.cancel_tx);
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::warn!("signal received, cancelling pipeline");
            let _ = cancel_tx.send(true);
        });
    }
}

async fn phase_action(
    runner: &dyn Runner,
    step: &Step,
    phase: Phase,
    network: &str,
    force_pull: bool,
) -> Result<()> {
    match phase {
        Phase::KillContainers => {
            if step.meta.keep_alive != KeepAlive::Yes {
                runner.kill_container(step).await?;
            }
            Ok(())
        }
        Phase::RemoveContainers => {
            if step.meta.keep_alive != KeepAlive::Yes {
                runner.remove_container(step).await?;
            }
            Ok(())
        }
        Phase::PullImages => {
            if step.build_info.is_some() {
                return Ok(());
            }
            if !force_pull && runner.image_exists(step).await? {
                return Ok(());
            }
            runner.pull_image(step).await?;
            Ok(())
        }
        Phase::BuildImages => {
            if step.build_info.is_none() {
                return Ok(());
            }
            runner.build_image(step, force_pull).await?;
            Ok(())
        }
        Phase::ExecuteSteps => {
            // Clear any stale container under this name; for
            // keep-alive=replace this is the replacement semantics.
            if step.meta.keep_alive != KeepAlive::Yes {
                runner.kill_container(step).await?;
                runner.remove_container(step).await?;
            }
            let code = runner.run_container(step, network).await?;
            if !step.detach {
                runner.remove_container(step).await?;
                if code != 0 {
                    return Err(GantryError::Runner(RunnerError::CommandFailed {
                        command: format!("step '{}'", step.name),
                        code,
                    }));
                }
            }
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::definition::{Definition, ServiceMeta};
    use crate::preprocessor::Preprocessor;
    use crate::runner::NoopRunner;

    fn test_env() -> Environment {
        let mut env = Environment::default();
        env.set_project_name("test");
        env
    }

    fn scheduler_for(raw: &str, runner: Arc<NoopRunner>, env: Environment) -> Scheduler {
        let mut env = env;
        let definition = Definition::parse(&Preprocessor::new(), raw, &mut env).unwrap();
        Scheduler::with_config(
            definition,
            runner,
            env,
            SchedulerConfig {
                force_pull: false,
                handle_signals: false,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_keep_alive_yes_is_never_touched() {
        let raw = "services:\n  cache:\n    image: redis\n";
        let mut env = test_env();
        env.steps.insert(
            "cache".to_string(),
            ServiceMeta {
                keep_alive: KeepAlive::Yes,
                ..ServiceMeta::default()
            },
        );

        let runner = Arc::new(NoopRunner::new());
        let scheduler = scheduler_for(raw, Arc::clone(&runner), env);
        scheduler.up().await.unwrap();

        assert_eq!(runner.count("ContainerKiller(cache)"), 0);
        assert_eq!(runner.count("ContainerRemover(cache)"), 0);
        assert_eq!(runner.count("ContainerRunner(cache,test)"), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_replace_is_replaced_but_survives_teardown() {
        let raw = "services:\n  cache:\n    image: redis\n";
        let mut env = test_env();
        env.steps.insert(
            "cache".to_string(),
            ServiceMeta {
                keep_alive: KeepAlive::Replace,
                ..ServiceMeta::default()
            },
        );

        let runner = Arc::new(NoopRunner::new());
        let scheduler = scheduler_for(raw, Arc::clone(&runner), env);
        scheduler.up().await.unwrap();

        // one kill/rm from each preparation phase and one pre-run
        // replacement pass; none from teardown
        assert_eq!(runner.count("ContainerKiller(cache)"), 2);
        assert_eq!(runner.count("ContainerRemover(cache)"), 2);
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled() {
        let raw = "steps:\n  a:\n    image: worker\n";
        let runner = Arc::new(NoopRunner::new().with_missing_image("a"));
        let scheduler = scheduler_for(raw, Arc::clone(&runner), test_env());
        scheduler.up().await.unwrap();

        assert_eq!(runner.count("ImageExistenceChecker(a)"), 1);
        assert_eq!(runner.count("ImagePuller(a)"), 1);
    }

    #[tokio::test]
    async fn test_build_info_means_build_not_pull() {
        let raw = "steps:\n  a:\n    build:\n      context: .\n";
        let runner = Arc::new(NoopRunner::new());
        let scheduler = scheduler_for(raw, Arc::clone(&runner), test_env());
        scheduler.up().await.unwrap();

        assert_eq!(runner.count("ImageBuilder(a)"), 1);
        assert_eq!(runner.count("ImagePuller(a)"), 0);
        assert_eq!(runner.count("ImageExistenceChecker(a)"), 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_later_stages_and_surfaces_code() {
        let raw = "steps:\n  a: {}\n  b:\n    after: [a]\n  c:\n    after: [b]\n";
        let runner = Arc::new(NoopRunner::new().with_exit_code("b", 7));
        let scheduler = scheduler_for(raw, Arc::clone(&runner), test_env());

        let failure = scheduler.up().await.unwrap_err();
        assert_eq!(failure.exit_code(), 7);

        assert_eq!(runner.count("ContainerRunner(a,test)"), 1);
        assert_eq!(runner.count("ContainerRunner(b,test)"), 1);
        assert_eq!(runner.count("ContainerRunner(c,test)"), 0);
        // teardown still swept everything: c got its kill-phase pass
        // and the teardown pass even though it never executed
        assert_eq!(runner.count("NetworkRemover(test)"), 1);
        assert_eq!(runner.count("ContainerKiller(c)"), 2);
    }

    #[tokio::test]
    async fn test_failing_peer_cancels_in_flight_steps() {
        let raw = "steps:\n  bad: {}\n  slow: {}\n";
        // the failing step lingers briefly so its peer is mid-run when
        // the cancel lands; the peer would otherwise sleep for minutes
        let runner = Arc::new(
            NoopRunner::new()
                .with_exit_code("bad", 7)
                .with_run_delay("bad", std::time::Duration::from_millis(200))
                .with_run_delay("slow", std::time::Duration::from_secs(120)),
        );
        let scheduler = scheduler_for(raw, Arc::clone(&runner), test_env());

        let failure = scheduler.up().await.unwrap_err();
        assert_eq!(failure.exit_code(), 7);

        assert_eq!(runner.count("ContainerRunner(slow,test)"), 1);
        // kill phase, pre-run clear, cancellation kill, teardown
        assert_eq!(runner.count("ContainerKiller(slow)"), 4);
        assert_eq!(runner.count("ContainerKiller(bad)"), 3);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_runner_call() {
        let raw = "steps:\n  e:\n    after: [g]\n  f:\n    after: [e]\n  g:\n    after: [f]\n";
        let mut env = test_env();
        let definition = Definition::parse(&Preprocessor::new(), raw, &mut env).unwrap();
        let runner = Arc::new(NoopRunner::new());
        let err = Scheduler::new(definition, Arc::clone(&runner) as Arc<dyn Runner>, env)
            .err()
            .unwrap();
        assert!(matches!(err, GantryError::Cycle(_)));
        assert_eq!(runner.total(), 0);
    }

    #[tokio::test]
    async fn test_down_disregards_keep_alive() {
        let raw = "services:\n  cache:\n    image: redis\n";
        let mut env = test_env();
        env.steps.insert(
            "cache".to_string(),
            ServiceMeta {
                keep_alive: KeepAlive::Yes,
                ..ServiceMeta::default()
            },
        );

        let runner = Arc::new(NoopRunner::new());
        let scheduler = scheduler_for(raw, Arc::clone(&runner), env);
        scheduler.down().await.unwrap();

        assert_eq!(runner.count("ContainerKiller(cache)"), 1);
        assert_eq!(runner.count("ContainerRemover(cache)"), 1);
        assert_eq!(runner.count("NetworkRemover(test)"), 1);
    }

    #[tokio::test]
    async fn test_single_phase_run() {
        let raw = "steps:\n  a: {}\n  b:\n    after: [a]\n";
        let runner = Arc::new(NoopRunner::new());
        let scheduler = scheduler_for(raw, Arc::clone(&runner), test_env());
        scheduler.run_phase(Phase::KillContainers).await.unwrap();

        assert_eq!(runner.count("ContainerKiller(a)"), 1);
        assert_eq!(runner.count("ContainerKiller(b)"), 1);
        assert_eq!(runner.total(), 2);
    }
}
