//! Shared task definitions and helpers for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use braid::graphs::WorkflowDef;
use braid::lattice::{FormatRegistry, TypeLattice, TypeSpec};
use braid::runtimes::{RuntimeConfig, Submitter};
use braid::task::{Invocation, TaskDef};
use braid::value::Bindings;
use braid::workers::{LocalBackend, WorkerFailure};

pub fn outputs_with(field: &str, value: Value) -> Bindings {
    let mut out = Bindings::default();
    out.insert(field.to_string(), value);
    out
}

pub fn inputs(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn add_task() -> Arc<TaskDef> {
    TaskDef::function("add", |inputs: &Bindings| {
        let a = inputs["a"].as_f64().unwrap_or_default();
        let b = inputs["b"].as_f64().unwrap_or_default();
        Ok(outputs_with("out", json!(a + b)))
    })
    .input("a", TypeSpec::Float)
    .input("b", TypeSpec::Float)
    .output("out", TypeSpec::Float)
    .build()
}

pub fn mul_task() -> Arc<TaskDef> {
    TaskDef::function("mul", |inputs: &Bindings| {
        let a = inputs["a"].as_f64().unwrap_or_default();
        let b = inputs["b"].as_f64().unwrap_or_default();
        Ok(outputs_with("out", json!(a * b)))
    })
    .input("a", TypeSpec::Float)
    .input("b", TypeSpec::Float)
    .output("out", TypeSpec::Float)
    .build()
}

pub fn sum_task() -> Arc<TaskDef> {
    TaskDef::function("sum", |inputs: &Bindings| {
        let total: f64 = inputs["x"]
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_f64).sum())
            .unwrap_or_default();
        Ok(outputs_with("out", json!(total)))
    })
    .input("x", TypeSpec::seq(TypeSpec::Float))
    .output("out", TypeSpec::Float)
    .build()
}

pub fn failing_task() -> Arc<TaskDef> {
    TaskDef::function("fail", |_: &Bindings| {
        Err(WorkerFailure::task("deliberate failure"))
    })
    .input("a", TypeSpec::Float)
    .output("out", TypeSpec::Float)
    .build()
}

/// Sleeps for `a` milliseconds, then echoes it.
pub fn slow_task() -> Arc<TaskDef> {
    TaskDef::function("slow", |inputs: &Bindings| {
        let ms = inputs["a"].as_u64().unwrap_or(50);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(outputs_with("out", json!(ms)))
    })
    .input("a", TypeSpec::Int)
    .output("out", TypeSpec::Int)
    .build()
}

/// Counts executions through the shared counter, so tests can assert the
/// at-most-once property.
pub fn counting_task(counter: Arc<AtomicUsize>, delay: Duration) -> Arc<TaskDef> {
    TaskDef::function("counting", move |inputs: &Bindings| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(delay);
        let a = inputs["a"].as_f64().unwrap_or_default();
        Ok(outputs_with("out", json!(a + 1.0)))
    })
    .input("a", TypeSpec::Float)
    .output("out", TypeSpec::Float)
    .build()
}

/// Fails until `succeed_at` attempts have happened, then echoes its input.
pub fn flaky_task(counter: Arc<AtomicUsize>, succeed_at: usize) -> Arc<TaskDef> {
    TaskDef::function("flaky", move |inputs: &Bindings| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < succeed_at {
            return Err(WorkerFailure::task(format!("attempt {attempt} failed")));
        }
        Ok(outputs_with("out", inputs["a"].clone()))
    })
    .input("a", TypeSpec::Float)
    .output("out", TypeSpec::Float)
    .build()
}

/// Emits whatever JSON it was given, typed `any`.
pub fn untyped_source_task(value: Value) -> Arc<TaskDef> {
    TaskDef::function("source", move |_: &Bindings| {
        Ok(outputs_with("out", value.clone()))
    })
    .output("out", TypeSpec::Any)
    .build()
}

/// Lattice with a small media format hierarchy installed.
pub fn media_lattice() -> TypeLattice {
    let mut registry = FormatRegistry::new();
    registry.register("image/png", "generic/file");
    registry.register("image/jpeg", "generic/file");
    registry.register("video/mp4", "video/any");
    registry.register("video/quicktime", "video/any");
    registry.register("video/any", "generic/file");
    TypeLattice::new(Arc::new(registry))
}

pub fn submitter() -> Submitter {
    Submitter::new(LocalBackend::new()).expect("submitter without cache cannot fail")
}

pub fn cached_submitter(cache_root: &std::path::Path) -> Submitter {
    Submitter::with_config(
        LocalBackend::new(),
        RuntimeConfig::default().with_cache_root(cache_root),
    )
    .expect("cache root should be creatable")
}

/// `Rec(a, depth)`: adds one per level and recurses until `depth` is zero.
pub fn rec_workflow() -> WorkflowDef {
    WorkflowDef::define("rec")
        .input("a", TypeSpec::Float)
        .input("depth", TypeSpec::Int)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let depth = wf.input_value("depth")?.as_i64().unwrap_or(0);
            let add = wf.add(
                Invocation::of(&add_task())
                    .bind("a", wf.input("a")?)
                    .bind("b", 1.0),
            )?;
            if depth == 0 {
                wf.set_output("out", add.out("out")?)
            } else {
                let nested = wf.add(
                    Invocation::of(rec_workflow().task())
                        .bind("a", add.out("out")?)
                        .bind("depth", depth - 1),
                )?;
                wf.set_output("out", nested.out("out")?)
            }
        })
}
