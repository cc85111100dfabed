// Command Handlers
// Builds the core pipeline objects from the global flags and drives the
// scheduler; every handler returns the process exit code

use gantry_core::{
    graph, Definition, Environment, GantryError, LocalRunner, NoopRunner, Phase, PipelineFailure,
    Preprocessor, Scheduler, SchedulerConfig, StepKind,
};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Global flags shared by every sub-command.
pub struct Context {
    pub file: Option<std::path::PathBuf>,
    pub env: Option<std::path::PathBuf>,
    pub force_wharfer: bool,
}

impl Context {
    fn environment(&self, selected: &[String]) -> gantry_core::Result<Environment> {
        Environment::load(self.env.as_deref(), &HashMap::new(), &[], selected)
    }

    fn load(&self, selected: &[String]) -> gantry_core::Result<(Definition, Environment)> {
        let mut env = self.environment(selected)?;
        let definition = Definition::load(self.file.as_deref(), &mut env)?;
        Ok((definition, env))
    }

    fn local_runner(&self, project: &str) -> gantry_core::Result<Arc<LocalRunner>> {
        Ok(Arc::new(LocalRunner::new(project, self.force_wharfer)?))
    }

    fn scheduler(
        &self,
        selected: &[String],
        config: SchedulerConfig,
    ) -> gantry_core::Result<Scheduler> {
        let (definition, env) = self.load(selected)?;
        let runner = self.local_runner(&env.project_name())?;
        Scheduler::with_config(definition, runner, env, config)
    }
}

pub async fn up(ctx: &Context, steps: Vec<String>, force_pull: bool) -> i32 {
    let config = SchedulerConfig {
        force_pull,
        ..SchedulerConfig::default()
    };
    match ctx.scheduler(&steps, config) {
        Ok(scheduler) => finish(scheduler.up().await),
        Err(e) => report(e),
    }
}

pub async fn start(ctx: &Context, steps: Vec<String>) -> i32 {
    match ctx.scheduler(&steps, SchedulerConfig::default()) {
        Ok(scheduler) => finish(scheduler.start().await),
        Err(e) => report(e),
    }
}

pub async fn down(ctx: &Context) -> i32 {
    match ctx.scheduler(&[], SchedulerConfig::default()) {
        Ok(scheduler) => finish(scheduler.down().await),
        Err(e) => report(e),
    }
}

pub async fn phase(ctx: &Context, phase: Phase) -> i32 {
    match ctx.scheduler(&[], SchedulerConfig::default()) {
        Ok(scheduler) => finish(scheduler.run_phase(phase).await),
        Err(e) => report(e),
    }
}

pub async fn logs(ctx: &Context, steps: Vec<String>, follow: bool) -> i32 {
    let (definition, env) = match ctx.load(&[]) {
        Ok(loaded) => loaded,
        Err(e) => return report(e),
    };
    for name in &steps {
        if !definition.steps.contains_key(name) {
            return report(GantryError::reference(format!(
                "no such service or step '{}'",
                name
            )));
        }
    }
    let runner = match ctx.local_runner(&env.project_name()) {
        Ok(runner) => runner,
        Err(e) => return report(e),
    };

    let wanted: HashSet<&str> = steps.iter().map(String::as_str).collect();
    let mut names: Vec<&String> = definition.steps.keys().collect();
    names.sort_unstable();

    let mut streams = JoinSet::new();
    for name in names {
        let step = &definition.steps[name];
        if step.meta.ignore || (!wanted.is_empty() && !wanted.contains(name.as_str())) {
            continue;
        }
        let runner = Arc::clone(&runner);
        let step = step.clone();
        streams.spawn(async move { runner.container_logs(&step, follow).await });
    }

    while let Some(joined) = streams.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::warn!("{}", e);
        }
    }
    0
}

pub fn list(ctx: &Context) -> i32 {
    let (definition, _) = match ctx.load(&[]) {
        Ok(loaded) => loaded,
        Err(e) => return report(e),
    };

    let mut names: Vec<&String> = definition.steps.keys().collect();
    names.sort_unstable();
    for name in names {
        let step = &definition.steps[name];
        let kind = match step.meta.kind {
            StepKind::Service => "service",
            StepKind::Step => "step",
        };
        println!("{}\x1b[0m ({})", step.prefix(), kind);
    }
    0
}

pub fn steps(ctx: &Context) -> i32 {
    let (definition, env) = match ctx.load(&[]) {
        Ok(loaded) => loaded,
        Err(e) => return report(e),
    };
    // the noop runner computes the plan without touching an engine
    let scheduler = match Scheduler::with_config(
        definition,
        Arc::new(NoopRunner::new()),
        env,
        SchedulerConfig {
            force_pull: false,
            handle_signals: false,
        },
    ) {
        Ok(scheduler) => scheduler,
        Err(e) => return report(e),
    };

    for (index, stage) in scheduler.stages().iter().enumerate() {
        println!("{}: {}", index + 1, stage.join(", "));
    }
    0
}

pub fn dot(ctx: &Context, output: Option<&Path>) -> i32 {
    let (definition, _) = match ctx.load(&[]) {
        Ok(loaded) => loaded,
        Err(e) => return report(e),
    };

    let result = match output {
        Some(path) => fs::File::create(path)
            .and_then(|mut file| graph::write_dot(&definition.steps, &mut file)),
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            graph::write_dot(&definition.steps, &mut lock).and_then(|_| lock.flush())
        }
    };
    match result {
        Ok(()) => 0,
        Err(e) => report(GantryError::Io(e)),
    }
}

pub fn preprocessor_apply(ctx: &Context, file: &Path) -> i32 {
    let mut env = match ctx.environment(&[]) {
        Ok(env) => env,
        Err(e) => return report(e),
    };
    let raw = match fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(e) => return report(GantryError::Io(e)),
    };
    match Preprocessor::new().apply(&raw, &mut env) {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => report(GantryError::Preprocess(e)),
    }
}

pub fn preprocessor_list() -> i32 {
    for function in Preprocessor::new().directives() {
        println!(
            "{:<24} {}",
            function.names().join(", "),
            function.description()
        );
    }
    0
}

fn report(error: GantryError) -> i32 {
    let failure = PipelineFailure::new(error);
    tracing::error!("{}", failure);
    failure.exit_code()
}

fn finish(result: Result<(), PipelineFailure>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(failure) => {
            tracing::error!("{}", failure);
            failure.exit_code()
        }
    }
}
