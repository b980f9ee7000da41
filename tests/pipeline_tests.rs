//! End-to-end tests of function tasks served by the `bear` binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tempfile::tempdir;

use bear::task::load_stats;
use bear::{Batch, Error, Pipeline, PipelineConfig, TaskOptions, TaskState, WorkerCommand};

const MB: u64 = 1024 * 1024;

fn config() -> PipelineConfig {
    PipelineConfig::default().with_worker(WorkerCommand::new(env!("CARGO_BIN_EXE_bear")))
}

fn pipeline() -> Pipeline {
    Pipeline::with_config(config()).unwrap()
}

fn pair(a: Value, b: Value) -> Vec<Value> {
    vec![a, b]
}

#[test]
fn test_add_results_in_order() {
    let mut pipeline = pipeline();
    let results = pipeline
        .dispatch_sync(Batch::function("add").args(vec![
            pair(json!(1), json!(2)),
            pair(json!(2), json!(3)),
        ]))
        .unwrap();

    assert_eq!(results, vec![json!(3), json!(5)]);
}

#[test]
fn test_peak_memory_per_task() {
    let mut pipeline = pipeline();
    let tasks = pipeline
        .dispatch_async(
            Batch::function("hold_memory")
                .args(vec![pair(json!(100), json!(1.5)), pair(json!(0), json!(1.5))]),
        )
        .unwrap();
    pipeline.wait_all();

    let heavy = tasks[0].max_mem().unwrap();
    let light = tasks[1].max_mem().unwrap();
    assert!(heavy > 100 * MB, "heavy task peaked at {} bytes", heavy);
    assert!(light > 0);
    assert!(light < 50 * MB, "light task peaked at {} bytes", light);
}

#[test]
fn test_failing_sibling_does_not_stop_batch() {
    let mut pipeline = pipeline();
    let result = pipeline.dispatch_sync(Batch::function("subtract").args(vec![
        pair(json!(5), json!(2)),
        pair(json!(1), json!("x")),
        pair(json!(9), json!(4)),
    ]));

    match result {
        Err(Error::BatchFailed { failed, total }) => assert_eq!((failed, total), (1, 3)),
        other => panic!("expected BatchFailed, got {:?}", other),
    }

    let tasks = pipeline.tasks();
    assert_eq!(tasks[0].wait().unwrap(), json!(3));
    assert_eq!(tasks[2].wait().unwrap(), json!(5));

    let failure = tasks[1].wait().unwrap_err();
    assert_eq!(failure.caller, "subtract");
    assert!(failure.message.contains("unsupported operand"), "{}", failure.message);
    assert!(failure.args.contains("\"x\""));
}

#[test]
fn test_wait_is_idempotent() {
    let mut pipeline = pipeline();
    let tasks = pipeline
        .dispatch_async(Batch::function("fail").args(vec![vec![json!("once")]]))
        .unwrap();
    let task = &tasks[0];

    let first = task.wait().unwrap_err();
    let outcome = task.outcome().unwrap();
    let second = task.wait().unwrap_err();

    assert_eq!(first, second);
    assert_eq!(first.message, "once");
    assert!(Arc::ptr_eq(&outcome, &task.outcome().unwrap()));
    assert_eq!(task.state(), TaskState::Failed);
}

#[test]
fn test_resume_skips_previous_successes() {
    let dir = tempdir().unwrap();
    let config = config().with_resume(dir.path().join("state.json"));

    let mut first = Pipeline::with_config(config.clone()).unwrap();
    first
        .dispatch_sync(Batch::function("add").args(vec![pair(json!(1), json!(2)), pair(json!(2), json!(3))]))
        .unwrap();
    drop(first);

    let mut second = Pipeline::with_config(config).unwrap();
    let results = second
        .dispatch_sync(Batch::function("add").args(vec![pair(json!(1), json!(2)), pair(json!(5), json!(5))]))
        .unwrap();

    assert_eq!(results, vec![json!(3), json!(10)]);
    let tasks = second.tasks();
    assert!(tasks[0].pid().is_none(), "unchanged task should not run again");
    assert!(tasks[1].pid().is_some(), "changed task should run");
}

#[test]
fn test_stats_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stats.json");

    let mut pipeline = pipeline();
    pipeline
        .dispatch_sync(Batch::function("sleep").args(vec![vec![json!(0.2)], vec![json!(0.1)]]))
        .unwrap();
    pipeline.save_stats(&path).unwrap();

    let loaded = load_stats(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    for (stats, task) in loaded.iter().zip(pipeline.tasks()) {
        assert_eq!(stats.id, task.id());
        assert_eq!(stats.duration, task.duration().unwrap().as_secs_f64());
        assert_eq!(stats.max_mem, task.max_mem().unwrap());
        assert_eq!(stats.func_name, "sleep");
    }
}

#[test]
fn test_shared_kwargs() {
    let mut kwargs = Map::new();
    kwargs.insert("sep".to_string(), json!("/"));

    let mut pipeline = pipeline();
    let results = pipeline
        .dispatch_sync(
            Batch::function("concat")
                .args(vec![pair(json!("a"), json!("b")), pair(json!("c"), json!(1))])
                .kwargs(kwargs),
        )
        .unwrap();

    assert_eq!(results, vec![json!("a/b"), json!("c/1")]);
}

#[test]
fn test_function_timeout() {
    let mut pipeline = pipeline();
    let options = TaskOptions::default().with_timeout(Duration::from_millis(500));
    let result = pipeline.dispatch_sync(
        Batch::function("sleep")
            .args(vec![vec![json!(10)]])
            .options(options),
    );

    assert!(matches!(result, Err(Error::BatchFailed { failed: 1, total: 1 })));
    let task = &pipeline.tasks()[0];
    assert!(task.error().unwrap().contains("timed out"));
    assert!(task.duration().unwrap() < Duration::from_secs(5));
}

#[test]
fn test_unknown_function_fails_task() {
    let mut pipeline = pipeline();
    let result = pipeline.dispatch_sync(Batch::function("no_such_function").args(vec![vec![]]));

    assert!(result.is_err());
    let error = pipeline.tasks()[0].error().unwrap();
    assert!(error.contains("unknown function"), "{}", error);
}
