//! End-to-end scheduler behavior: chains, failure isolation, retries,
//! timeouts, cancellation, and nested workflows.

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{
    add_task, failing_task, flaky_task, inputs, mul_task, rec_workflow, slow_task, submitter,
    untyped_source_task,
};

use braid::graphs::WorkflowDef;
use braid::lattice::TypeSpec;
use braid::runtimes::UnitErrorKind;
use braid::schedulers::CancelToken;
use braid::task::{Invocation, RetryPolicy};
use serde_json::json;

fn chain_workflow() -> WorkflowDef {
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
async fn linear_chain_computes_through() {
    let result = submitter()
        .submit(&chain_workflow(), inputs(&[("a", json!(2.0)), ("b", json!(3.0))]))
        .await
        .unwrap();
    assert!(!result.errored, "errors: {:?}", result.errors);
    assert_eq!(result.outputs["out"], json!(15.0));
    assert_eq!(result.stats.executed, 2);
    assert_eq!(result.stats.cache_hits, 0);
}

#[tokio::test]
async fn independent_branches_survive_a_failure() {
    let wf = WorkflowDef::define("split_brain")
        .input("a", TypeSpec::Float)
        .output("good", TypeSpec::Float)
        .output("bad", TypeSpec::Float)
        .constructor(|wf| {
            let a = wf.input("a")?;
            let ok = wf.add(Invocation::of(&add_task()).bind("a", a.clone()).bind("b", 1.0))?;
            let broken = wf.add(Invocation::of(&failing_task()).bind("a", a))?;
            wf.set_output("good", ok.out("out")?)?;
            wf.set_output("bad", broken.out("out")?)
        });
    let result = submitter()
        .submit(&wf, inputs(&[("a", json!(1.0))]))
        .await
        .unwrap();

    assert!(result.errored);
    assert!(!result.cancelled);
    assert_eq!(result.outputs["good"], json!(2.0));
    assert!(result.output("bad").is_none());
    let err = result.error("fail").expect("the failing node must be reported");
    assert_eq!(err.kind, UnitErrorKind::Worker);
    assert!(err.message.contains("deliberate failure"));
}

#[tokio::test]
async fn dependents_of_a_failure_become_unreachable() {
    let wf = WorkflowDef::define("doomed")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let broken = wf.add(Invocation::of(&failing_task()).bind("a", wf.input("a")?))?;
            let after = wf.add(
                Invocation::of(&add_task())
                    .bind("a", broken.out("out")?)
                    .bind("b", 1.0),
            )?;
            let last = wf.add(
                Invocation::of(&add_task())
                    .bind("a", after.out("out")?)
                    .bind("b", 1.0),
            )?;
            wf.set_output("out", last.out("out")?)
        });
    let result = submitter()
        .submit(&wf, inputs(&[("a", json!(1.0))]))
        .await
        .unwrap();

    assert!(result.errored);
    assert_eq!(result.stats.executed, 1);
    // Both dependents point at the original failure, not each other.
    for unit in ["add", "add1"] {
        let err = result.error(unit).expect("dependents must be recorded");
        assert!(
            matches!(&err.kind, UnitErrorKind::Unreachable { upstream } if upstream == "fail"),
            "unexpected error for {unit}: {err:?}"
        );
    }
}

#[tokio::test]
async fn recursive_nesting_terminates_at_the_base_case() {
    let result = submitter()
        .submit(
            &rec_workflow(),
            inputs(&[("a", json!(0.0)), ("depth", json!(3))]),
        )
        .await
        .unwrap();
    assert!(!result.errored, "errors: {:?}", result.errors);
    assert_eq!(result.outputs["out"], json!(4.0));
    // One addition per level.
    assert_eq!(result.stats.executed, 4);
}

#[tokio::test]
async fn nested_failures_are_rerooted_under_the_outer_unit() {
    let inner = WorkflowDef::define("inner")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let broken = wf.add(Invocation::of(&failing_task()).bind("a", wf.input("a")?))?;
            wf.set_output("out", broken.out("out")?)
        });
    let outer = WorkflowDef::define("outer")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let nested = wf.add(Invocation::of(inner.task()).bind("a", wf.input("a")?))?;
            wf.set_output("out", nested.out("out")?)
        });
    let result = submitter()
        .submit(&outer, inputs(&[("a", json!(1.0))]))
        .await
        .unwrap();

    assert!(result.errored);
    assert!(result.error("inner").is_some(), "outer unit must be reported");
    assert!(
        result.error("inner/fail").is_some(),
        "nested unit must be re-rooted; got: {:?}",
        result.errors.keys().collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn cancellation_drains_and_reports() {
    let wf = WorkflowDef::define("sleepy")
        .output("out", TypeSpec::Int)
        .constructor(|wf| {
            let slow = wf.add(Invocation::of(&slow_task()).bind("a", 2_000))?;
            wf.set_output("out", slow.out("out")?)
        });
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let result = submitter()
        .submit_with_cancel(&wf, inputs(&[]), cancel)
        .await
        .unwrap();

    assert!(result.cancelled);
    assert!(result.errored);
    assert!(result.output("out").is_none());
    assert!(
        started.elapsed() < Duration::from_millis(1_500),
        "cancellation must not wait for the sleeping unit"
    );
    let err = result.error("slow").expect("the in-flight unit is reported");
    assert_eq!(err.kind, UnitErrorKind::Cancelled);
}

#[tokio::test]
async fn timeouts_fail_the_unit() {
    let wf = WorkflowDef::define("deadline")
        .output("out", TypeSpec::Int)
        .constructor(|wf| {
            let slow = wf.add(
                Invocation::of(&slow_task())
                    .bind("a", 500)
                    .with_timeout(Duration::from_millis(50)),
            )?;
            wf.set_output("out", slow.out("out")?)
        });
    let result = submitter().submit(&wf, inputs(&[])).await.unwrap();
    assert!(result.errored);
    let err = result.error("slow").expect("timeout must be recorded");
    assert_eq!(err.kind, UnitErrorKind::Timeout);
}

#[tokio::test]
async fn retries_rerun_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let task = flaky_task(Arc::clone(&attempts), 3);
    let wf = WorkflowDef::define("flaky_wf")
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let node = wf.add(
                Invocation::of(&task).bind("a", 7.0).with_retry(RetryPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_millis(1),
                }),
            )?;
            wf.set_output("out", node.out("out")?)
        });
    let result = submitter().submit(&wf, inputs(&[])).await.unwrap();
    assert!(!result.errored, "errors: {:?}", result.errors);
    assert_eq!(result.outputs["out"], json!(7.0));
    assert_eq!(result.stats.executed, 3);
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let task = flaky_task(Arc::clone(&attempts), 10);
    let wf = WorkflowDef::define("still_flaky")
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let node = wf.add(
                Invocation::of(&task).bind("a", 7.0).with_retry(RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                }),
            )?;
            wf.set_output("out", node.out("out")?)
        });
    let result = submitter().submit(&wf, inputs(&[])).await.unwrap();
    assert!(result.errored);
    assert_eq!(result.stats.executed, 3);
    let err = result.error("flaky").unwrap();
    assert!(err.message.contains("attempt 3 failed"));
}

#[tokio::test]
async fn any_wires_are_rechecked_at_dispatch() {
    // Build-time accepts `any` into a typed slot; the string value fails
    // the dispatch-time check and poisons the dependent.
    let source = untyped_source_task(json!("not a number"));
    let wf = WorkflowDef::define("escape_hatch")
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let src = wf.add(Invocation::of(&source))?;
            let add = wf.add(
                Invocation::of(&add_task())
                    .bind("a", src.out("out")?)
                    .bind("b", 1.0),
            )?;
            wf.set_output("out", add.out("out")?)
        });
    let result = submitter().submit(&wf, inputs(&[])).await.unwrap();
    assert!(result.errored);
    // Only the source executed; the consumer failed its type re-check.
    assert_eq!(result.stats.executed, 1);
    let err = result.error("add").expect("type failure must be recorded");
    assert_eq!(err.kind, UnitErrorKind::InvalidType);
}

#[tokio::test]
async fn any_wires_pass_when_the_value_conforms() {
    let source = untyped_source_task(json!(41));
    let wf = WorkflowDef::define("good_escape")
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let src = wf.add(Invocation::of(&source))?;
            let add = wf.add(
                Invocation::of(&add_task())
                    .bind("a", src.out("out")?)
                    .bind("b", 1.0),
            )?;
            wf.set_output("out", add.out("out")?)
        });
    let result = submitter().submit(&wf, inputs(&[])).await.unwrap();
    assert!(!result.errored, "errors: {:?}", result.errors);
    assert_eq!(result.outputs["out"], json!(42.0));
}

#[tokio::test]
async fn constructors_branch_on_concrete_inputs() {
    let wf = WorkflowDef::define("conditional")
        .input("mode", TypeSpec::Str)
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let node = match wf.input_value("mode")?.as_str() {
                Some("double") => wf.add(
                    Invocation::of(&mul_task())
                        .bind("a", wf.input("a")?)
                        .bind("b", 2.0),
                )?,
                _ => wf.add(
                    Invocation::of(&add_task())
                        .bind("a", wf.input("a")?)
                        .bind("b", 100.0),
                )?,
            };
            wf.set_output("out", node.out("out")?)
        });

    let doubled = submitter()
        .submit(&wf, inputs(&[("mode", json!("double")), ("a", json!(4.0))]))
        .await
        .unwrap();
    assert_eq!(doubled.outputs["out"], json!(8.0));

    let shifted = submitter()
        .submit(&wf, inputs(&[("mode", json!("shift")), ("a", json!(4.0))]))
        .await
        .unwrap();
    assert_eq!(shifted.outputs["out"], json!(104.0));
}

#[tokio::test]
async fn workflow_inputs_can_flow_straight_to_outputs() {
    let wf = WorkflowDef::define("identity_ish")
        .input("a", TypeSpec::Float)
        .output("echo", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let add = wf.add(
                Invocation::of(&add_task())
                    .bind("a", wf.input("a")?)
                    .bind("b", 0.5),
            )?;
            wf.set_output("echo", wf.input_lazy("a")?)?;
            wf.set_output("out", add.out("out")?)
        });
    let result = submitter()
        .submit(&wf, inputs(&[("a", json!(1.5))]))
        .await
        .unwrap();
    assert_eq!(result.outputs["echo"], json!(1.5));
    assert_eq!(result.outputs["out"], json!(2.0));
}
