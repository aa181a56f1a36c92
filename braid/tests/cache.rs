//! Content-addressed caching across runs and submitters.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{add_task, cached_submitter, counting_task, inputs, mul_task};

use braid::events::{RunEvent, RunEventKind};
use braid::graphs::WorkflowDef;
use braid::lattice::TypeSpec;
use braid::runtimes::{RuntimeConfig, Submitter};
use braid::task::Invocation;
use braid::workers::LocalBackend;
use serde_json::json;

fn chain() -> WorkflowDef {
    WorkflowDef::define("chain")
        .input("a", TypeSpec::Float)
        .input("b", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let add = wf.add(
                Invocation::of(&add_task())
                    .bind("a", wf.input("a")?)
                    .bind("b", wf.input("b")?),
            )?;
            let mul = wf.add(
                Invocation::of(&mul_task())
                    .bind("a", add.out("out")?)
                    .bind("b", 3.0),
            )?;
            wf.set_output("out", mul.out("out")?)
        })
}

#[tokio::test]
async fn warm_rerun_executes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let submitter = cached_submitter(dir.path());
    let wf = chain();
    let run_inputs = inputs(&[("a", json!(2.0)), ("b", json!(3.0))]);

    let cold = submitter.submit(&wf, run_inputs.clone()).await.unwrap();
    assert!(!cold.errored, "errors: {:?}", cold.errors);
    assert_eq!(cold.outputs["out"], json!(15.0));
    assert_eq!(cold.stats.executed, 2);
    assert_eq!(cold.stats.cache_hits, 0);

    let warm = submitter.submit(&wf, run_inputs).await.unwrap();
    assert_eq!(warm.outputs["out"], json!(15.0));
    assert_eq!(warm.stats.executed, 0);
    assert_eq!(warm.stats.cache_hits, 2);
}

#[tokio::test]
async fn changed_inputs_miss_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let submitter = cached_submitter(dir.path());
    let wf = chain();

    let first = submitter
        .submit(&wf, inputs(&[("a", json!(2.0)), ("b", json!(3.0))]))
        .await
        .unwrap();
    assert_eq!(first.stats.executed, 2);

    let second = submitter
        .submit(&wf, inputs(&[("a", json!(2.0)), ("b", json!(4.0))]))
        .await
        .unwrap();
    assert_eq!(second.outputs["out"], json!(18.0));
    // The add re-executes; its changed output cascades into mul.
    assert_eq!(second.stats.executed, 2);
}

#[tokio::test]
async fn concurrent_runs_execute_each_key_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    let task = counting_task(Arc::clone(&executions), Duration::from_millis(100));

    let wf = WorkflowDef::define("counted")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let node = wf.add(Invocation::of(&task).bind("a", wf.input("a")?))?;
            wf.set_output("out", node.out("out")?)
        });

    let left = cached_submitter(dir.path());
    let right = cached_submitter(dir.path());
    let (a, b) = tokio::join!(
        left.submit(&wf, inputs(&[("a", json!(1.0))])),
        right.submit(&wf, inputs(&[("a", json!(1.0))])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(!a.errored && !b.errored);
    assert_eq!(a.outputs["out"], json!(2.0));
    assert_eq!(a.outputs["out"], b.outputs["out"]);
    assert_eq!(
        executions.load(Ordering::SeqCst),
        1,
        "both submitters share the cache, so the task runs once"
    );
    assert_eq!(a.stats.executed + b.stats.executed, 1);
    assert_eq!(a.stats.cache_hits + b.stats.cache_hits, 1);
}

#[tokio::test]
async fn failed_units_are_not_negatively_cached() {
    let dir = tempfile::tempdir().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let task = common::fixtures::flaky_task(Arc::clone(&attempts), 2);

    let wf = WorkflowDef::define("flaky_cached")
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let node = wf.add(Invocation::of(&task).bind("a", 9.0))?;
            wf.set_output("out", node.out("out")?)
        });

    let submitter = cached_submitter(dir.path());
    let first = submitter.submit(&wf, inputs(&[])).await.unwrap();
    assert!(first.errored);

    // The failure released the claim; the next run re-executes and wins.
    let second = submitter.submit(&wf, inputs(&[])).await.unwrap();
    assert!(!second.errored, "errors: {:?}", second.errors);
    assert_eq!(second.outputs["out"], json!(9.0));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn events_trace_the_unit_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = flume::unbounded::<RunEvent>();
    let submitter = Submitter::with_config(
        LocalBackend::new(),
        RuntimeConfig::default()
            .with_cache_root(dir.path())
            .with_events(tx),
    )
    .unwrap();

    let wf = chain();
    let run_inputs = inputs(&[("a", json!(2.0)), ("b", json!(3.0))]);
    submitter.submit(&wf, run_inputs.clone()).await.unwrap();
    submitter.submit(&wf, run_inputs).await.unwrap();

    let kinds: Vec<RunEventKind> = rx.drain().map(|e| e.kind).collect();
    let expanded = kinds
        .iter()
        .filter(|k| matches!(k, RunEventKind::NodeExpanded { .. }))
        .count();
    let started = kinds
        .iter()
        .filter(|k| matches!(k, RunEventKind::UnitStarted { .. }))
        .count();
    let hits = kinds
        .iter()
        .filter(|k| matches!(k, RunEventKind::CacheHit { .. }))
        .count();
    assert_eq!(expanded, 4, "two nodes per run");
    assert_eq!(started, 4, "every unit dispatches, cached or not");
    assert_eq!(hits, 2, "the warm run hits both keys");
}

#[tokio::test]
async fn purging_the_cache_forces_reexecution() {
    let dir = tempfile::tempdir().unwrap();
    let submitter = cached_submitter(dir.path());
    let wf = chain();
    let run_inputs = inputs(&[("a", json!(1.0)), ("b", json!(1.0))]);

    submitter.submit(&wf, run_inputs.clone()).await.unwrap();
    submitter
        .cache()
        .expect("cache is configured")
        .purge_all()
        .await
        .unwrap();
    let rerun = submitter.submit(&wf, run_inputs).await.unwrap();
    assert_eq!(rerun.stats.executed, 2);
}
