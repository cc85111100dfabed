// End-to-end scheduling scenarios over the public API, asserted through
// the counting noop runner.

use gantry_core::{
    Definition, Environment, GantryError, NoopRunner, Preprocessor, Scheduler, SchedulerConfig,
    ServiceMeta,
};

use std::collections::HashMap;
use std::sync::Arc;

fn test_env() -> Environment {
    let mut env = Environment::default();
    env.set_project_name("test");
    env
}

fn scheduler(raw: &str, runner: Arc<NoopRunner>, mut env: Environment) -> Scheduler {
    let definition = Definition::parse(&Preprocessor::new(), raw, &mut env)
        .expect("definition should parse");
    Scheduler::with_config(
        definition,
        runner,
        env,
        SchedulerConfig {
            force_pull: false,
            handle_signals: false,
        },
    )
    .expect("definition should schedule")
}

fn select(env: &mut Environment, names: &[&str]) {
    for name in names {
        env.steps
            .entry(name.to_string())
            .or_insert_with(ServiceMeta::default)
            .selected = true;
    }
}

const DIAMOND: &str = "\
steps:
  a: {}
  b:
    after: [a]
  c:
    after: [a]
  d:
    after: [b, c]
";

#[tokio::test]
async fn diamond_runs_each_step_once_with_full_lifecycle() {
    let runner = Arc::new(NoopRunner::new());
    let scheduler = scheduler(DIAMOND, Arc::clone(&runner), test_env());

    assert_eq!(
        scheduler.stages(),
        [
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]
    );

    scheduler.up().await.expect("pipeline should succeed");

    assert_eq!(runner.count("NetworkCreator(test)"), 1);
    for name in ["a", "b", "c", "d"] {
        assert_eq!(
            runner.count(&format!("ImageExistenceChecker({})", name)),
            1,
            "image check for {}",
            name
        );
        // kill phase, pre-run clear, teardown
        assert_eq!(
            runner.count(&format!("ContainerKiller({})", name)),
            3,
            "kills for {}",
            name
        );
        // rm phase, pre-run clear, post-exit removal, teardown
        assert_eq!(
            runner.count(&format!("ContainerRemover({})", name)),
            4,
            "removals for {}",
            name
        );
        assert_eq!(
            runner.count(&format!("ContainerRunner({},test)", name)),
            1,
            "runs for {}",
            name
        );
    }
}

const WORDPRESS: &str = "\
services:
  db:
    image: mariadb
  wordpress:
    image: wordpress
    depends_on: [db]
";

#[tokio::test]
async fn wordpress_services_run_in_dependency_order() {
    let runner = Arc::new(NoopRunner::new());
    let scheduler = scheduler(WORDPRESS, Arc::clone(&runner), test_env());

    assert_eq!(
        scheduler.stages(),
        [vec!["db".to_string()], vec!["wordpress".to_string()]]
    );

    scheduler.up().await.expect("pipeline should succeed");
    assert_eq!(runner.count("ContainerRunner(db,test)"), 1);
    assert_eq!(runner.count("ContainerRunner(wordpress,test)"), 1);
}

#[tokio::test]
async fn wordpress_selecting_the_leaf_runs_only_the_leaf() {
    let mut env = test_env();
    select(&mut env, &["db"]);

    let runner = Arc::new(NoopRunner::new());
    let scheduler = scheduler(WORDPRESS, Arc::clone(&runner), env);

    assert_eq!(scheduler.stages(), [vec!["db".to_string()]]);
    assert!(scheduler.steps()["wordpress"].meta.ignore);

    scheduler.up().await.expect("pipeline should succeed");
    assert_eq!(runner.count("ContainerRunner(db,test)"), 1);
    assert_eq!(runner.count("ContainerRunner(wordpress,test)"), 0);
}

#[tokio::test]
async fn wordpress_selecting_the_dependent_pulls_in_its_dependency() {
    let mut env = test_env();
    select(&mut env, &["wordpress"]);

    let runner = Arc::new(NoopRunner::new());
    let scheduler = scheduler(WORDPRESS, Arc::clone(&runner), env);

    scheduler.up().await.expect("pipeline should succeed");
    assert_eq!(runner.count("ContainerRunner(db,test)"), 1);
    assert_eq!(runner.count("ContainerRunner(wordpress,test)"), 1);
}

#[tokio::test]
async fn cycle_aborts_before_any_runner_call() {
    let raw = "\
steps:
  e:
    after: [g]
  f:
    after: [e]
  g:
    after: [f]
";
    let mut env = test_env();
    let definition = Definition::parse(&Preprocessor::new(), raw, &mut env)
        .expect("definition should parse");
    let runner = Arc::new(NoopRunner::new());

    let err = Scheduler::new(definition, Arc::clone(&runner) as Arc<dyn gantry_core::Runner>, env)
        .err()
        .expect("cycle should be rejected");
    assert!(matches!(err, GantryError::Cycle(_)));
    assert_eq!(runner.total(), 0);
}

#[tokio::test]
async fn ignored_failure_does_not_stop_the_pipeline() {
    let raw = "\
steps:
  x: {}
  y:
    after: [x]
";
    let mut env = test_env();
    env.steps.insert(
        "x".to_string(),
        ServiceMeta {
            ignore_failure: true,
            ..ServiceMeta::default()
        },
    );

    let runner = Arc::new(NoopRunner::new().with_exit_code("x", 1));
    let scheduler = scheduler(raw, Arc::clone(&runner), env);

    scheduler.up().await.expect("failure of x is ignored");
    assert_eq!(runner.count("ContainerRunner(x,test)"), 1);
    assert_eq!(runner.count("ContainerRunner(y,test)"), 1);
}

#[tokio::test]
async fn selective_run_executes_the_closure_and_only_tears_down_the_rest() {
    let raw = "\
services:
  active_service:
    image: active
steps:
  pre_prepare_0: {}
  pre_prepare_1: {}
  prepare_new_service_version:
    after: [pre_prepare_0, pre_prepare_1]
  test_new_service:
    after: [prepare_new_service_version]
  move_data_to_active_service:
    after: [test_new_service]
";
    let mut env = test_env();
    select(&mut env, &["move_data_to_active_service"]);

    let runner = Arc::new(NoopRunner::new());
    let scheduler = scheduler(raw, Arc::clone(&runner), env);

    scheduler.up().await.expect("pipeline should succeed");

    for name in [
        "pre_prepare_0",
        "pre_prepare_1",
        "prepare_new_service_version",
        "test_new_service",
        "move_data_to_active_service",
    ] {
        assert_eq!(
            runner.count(&format!("ContainerRunner({},test)", name)),
            1,
            "{} belongs to the selected closure",
            name
        );
    }

    // the unrelated service only sees the teardown sweep
    assert_eq!(runner.count("ContainerRunner(active_service,test)"), 0);
    assert_eq!(runner.count("ContainerKiller(active_service)"), 1);
    assert_eq!(runner.count("ContainerRemover(active_service)"), 1);
}

#[tokio::test]
async fn temp_dir_directive_yields_a_real_directory_until_cleanup() {
    let raw = "\
#! TEMP_DIR_IF_EMPTY ${SCRATCH}
steps:
  stage:
    volumes:
      - \"${SCRATCH}:/scratch\"
";
    let mut env = test_env();
    let definition = Definition::parse(&Preprocessor::new(), raw, &mut env)
        .expect("definition should parse");

    let volume = definition.steps["stage"].volumes[0].clone();
    let (host, container) = volume.split_once(':').expect("volume has two sides");
    assert_eq!(container, "/scratch");
    let host = std::path::Path::new(host);
    assert!(host.is_absolute());
    assert!(host.is_dir());

    env.clean_up();
    assert!(!host.exists());
}

#[tokio::test]
async fn failing_step_surfaces_its_exit_code() {
    let raw = "steps:\n  x: {}\n";
    let runner = Arc::new(NoopRunner::new().with_exit_code("x", 42));
    let scheduler = scheduler(raw, Arc::clone(&runner), test_env());

    let failure = scheduler.up().await.expect_err("pipeline should fail");
    assert_eq!(failure.exit_code(), 42);
}

#[tokio::test]
async fn down_sweeps_everything_and_the_network() {
    let runner = Arc::new(NoopRunner::new());
    let scheduler = scheduler(WORDPRESS, Arc::clone(&runner), test_env());

    scheduler.down().await.expect("down is best-effort");
    let expected: HashMap<String, usize> = [
        ("ContainerKiller(db)", 1),
        ("ContainerRemover(db)", 1),
        ("ContainerKiller(wordpress)", 1),
        ("ContainerRemover(wordpress)", 1),
        ("NetworkRemover(test)", 1),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    assert_eq!(runner.calls(), expected);
}
