mod common;

use common::fixtures::{add_task, media_lattice, mul_task};

use braid::graphs::{BuildError, WorkflowDef};
use braid::lattice::{TypeLattice, TypeSpec};
use braid::task::{Invocation, TaskDef};
use braid::value::{LazyRef, Slot};
use rustc_hash::FxHashMap;
use serde_json::json;

fn construct(wf: &WorkflowDef, pairs: &[(&str, serde_json::Value)]) -> Result<braid::graphs::GraphSpec, BuildError> {
    let slots: FxHashMap<String, Slot> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), Slot::Value(value.clone())))
        .collect();
    wf.construct(slots, &TypeLattice::default())
}

#[test]
fn nodes_are_named_after_tasks_with_suffixes() {
    let wf = WorkflowDef::define("naming")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let first = wf.add(Invocation::of(&add_task()).bind("a", wf.input("a")?).bind("b", 1.0))?;
            let second = wf.add(
                Invocation::of(&add_task())
                    .bind("a", first.out("out")?)
                    .bind("b", 1.0),
            )?;
            assert_eq!(first.name(), "add");
            assert_eq!(second.name(), "add1");
            wf.set_output("out", second.out("out")?)
        });
    let graph = construct(&wf, &[("a", json!(0.0))]).unwrap();
    let names: Vec<_> = graph.nodes().iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["add", "add1"]);
}

#[test]
fn explicit_duplicate_name_is_rejected() {
    let wf = WorkflowDef::define("dups")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let a = wf.input("a")?;
            wf.add_named(Invocation::of(&add_task()).bind("a", a.clone()).bind("b", 1.0), "x")?;
            wf.add_named(Invocation::of(&add_task()).bind("a", a).bind("b", 1.0), "x")?;
            Ok(())
        });
    let err = construct(&wf, &[("a", json!(0.0))]).unwrap_err();
    assert!(matches!(err, BuildError::DuplicateNodeName(name) if name == "x"));
}

#[test]
fn missing_required_input_fails_construction() {
    let wf = WorkflowDef::define("missing")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let node = wf.add(Invocation::of(&add_task()).bind("a", 1.0))?;
            wf.set_output("out", node.out("out")?)
        });
    let err = construct(&wf, &[]).unwrap_err();
    assert!(matches!(
        err,
        BuildError::MissingRequiredInput { node, field } if node == "add" && field == "b"
    ));
}

#[test]
fn defaults_fill_unbound_optionals() {
    let offset = TaskDef::function("offset", |inputs| {
        let a = inputs["a"].as_f64().unwrap_or_default();
        let b = inputs["b"].as_f64().unwrap_or_default();
        let mut out = braid::value::Bindings::default();
        out.insert("out".into(), json!(a + b));
        Ok(out)
    })
    .input("a", TypeSpec::Float)
    .input_default("b", TypeSpec::Float, json!(10.0))
    .output("out", TypeSpec::Float)
    .build();

    let wf = WorkflowDef::define("defaults")
        .output("out", TypeSpec::Float)
        .constructor(move |wf| {
            let node = wf.add(Invocation::of(&offset).bind("a", 1.0))?;
            wf.set_output("out", node.out("out")?)
        });
    let graph = construct(&wf, &[]).unwrap();
    let node = graph.node("offset").unwrap();
    assert_eq!(node.input("b").and_then(Slot::as_value), Some(&json!(10.0)));
}

#[test]
fn incompatible_formats_raise_type_mismatch() {
    let produce = TaskDef::function("render", |_| Ok(braid::value::Bindings::default()))
        .output("video", TypeSpec::file("video/mp4"))
        .build();
    let consume = TaskDef::function("edit", |_| Ok(braid::value::Bindings::default()))
        .input("clip", TypeSpec::file("video/quicktime"))
        .output("done", TypeSpec::Bool)
        .build();

    let wf = WorkflowDef::define("media")
        .output("done", TypeSpec::Bool)
        .constructor(move |wf| {
            let rendered = wf.add(Invocation::of(&produce))?;
            let edited = wf.add(Invocation::of(&consume).bind("clip", rendered.out("video")?))?;
            wf.set_output("done", edited.out("done")?)
        });

    let err = wf
        .construct(FxHashMap::default(), &media_lattice())
        .unwrap_err();
    match err {
        BuildError::TypeMismatch {
            dst_node,
            dst_field,
            src_ty,
            dst_ty,
            ..
        } => {
            assert_eq!(dst_node, "edit");
            assert_eq!(dst_field, "clip");
            assert_eq!(src_ty, "file(video/mp4)");
            assert_eq!(dst_ty, "file(video/quicktime)");
        }
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn format_subtypes_are_accepted() {
    let produce = TaskDef::function("shot", |_| Ok(braid::value::Bindings::default()))
        .output("image", TypeSpec::file("image/png"))
        .build();
    let consume = TaskDef::function("archive", |_| Ok(braid::value::Bindings::default()))
        .input("blob", TypeSpec::file("generic/file"))
        .output("done", TypeSpec::Bool)
        .build();

    let wf = WorkflowDef::define("archive_png")
        .output("done", TypeSpec::Bool)
        .constructor(move |wf| {
            let shot = wf.add(Invocation::of(&produce))?;
            let archived = wf.add(Invocation::of(&consume).bind("blob", shot.out("image")?))?;
            wf.set_output("done", archived.out("done")?)
        });
    assert!(wf.construct(FxHashMap::default(), &media_lattice()).is_ok());
}

#[test]
fn any_escape_hatch_defers_to_dispatch() {
    // `file` into `png` is a downcast the lattice rejects, but an `any`
    // source postpones the check until the value exists.
    let produce = TaskDef::function("fetch", |_| Ok(braid::value::Bindings::default()))
        .output("blob", TypeSpec::Any)
        .build();
    let consume = TaskDef::function("thumb", |_| Ok(braid::value::Bindings::default()))
        .input("image", TypeSpec::file("image/png"))
        .output("done", TypeSpec::Bool)
        .build();

    let wf = WorkflowDef::define("thumbs")
        .output("done", TypeSpec::Bool)
        .constructor(move |wf| {
            let fetched = wf.add(Invocation::of(&produce))?;
            let thumb = wf.add(Invocation::of(&consume).bind("image", fetched.out("blob")?))?;
            wf.set_output("done", thumb.out("done")?)
        });
    assert!(wf.construct(FxHashMap::default(), &media_lattice()).is_ok());
}

#[test]
fn lazy_inputs_cannot_be_branched_on() {
    let wf = WorkflowDef::define("branchy")
        .input("n", TypeSpec::Int)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let _ = wf.input_value("n")?;
            unreachable!("input_value must fail for a lazy binding");
        });
    let mut slots: FxHashMap<String, Slot> = FxHashMap::default();
    slots.insert("n".into(), Slot::Lazy(LazyRef::input("n", TypeSpec::Int)));
    let err = wf.construct(slots, &TypeLattice::default()).unwrap_err();
    assert!(matches!(err, BuildError::LazyInCondition { name } if name == "n"));
}

#[test]
fn declared_outputs_must_be_assigned() {
    let wf = WorkflowDef::define("forgetful")
        .input("a", TypeSpec::Float)
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            wf.add(Invocation::of(&add_task()).bind("a", wf.input("a")?).bind("b", 1.0))?;
            Ok(())
        });
    let err = construct(&wf, &[("a", json!(0.0))]).unwrap_err();
    assert!(matches!(err, BuildError::OutputUnset { name, .. } if name == "out"));
}

#[test]
fn a_field_cannot_be_bound_and_split() {
    let wf = WorkflowDef::define("conflict")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let node = wf.add(
                Invocation::of(&mul_task())
                    .bind("a", 1.0)
                    .bind("b", 2.0)
                    .split("a", json!([1, 2])),
            )?;
            wf.set_output("out", node.out("out")?)
        });
    let err = construct(&wf, &[]).unwrap_err();
    assert!(matches!(err, BuildError::SplitConflict { field, .. } if field == "a"));
}

#[test]
fn combining_an_unknown_axis_is_rejected() {
    let wf = WorkflowDef::define("ghost_axis")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let node = wf.add(
                Invocation::of(&mul_task())
                    .bind("a", 1.0)
                    .bind("b", 2.0)
                    .combine("elsewhere.a"),
            )?;
            wf.set_output("out", node.out("out")?)
        });
    let err = construct(&wf, &[]).unwrap_err();
    assert!(matches!(err, BuildError::UnknownAxis { axis, .. } if axis == "elsewhere.a"));
}

#[test]
fn axes_propagate_through_wiring() {
    let wf = WorkflowDef::define("axes")
        .output("out", TypeSpec::seq(TypeSpec::Float))
        .constructor(|wf| {
            let mul = wf.add(
                Invocation::of(&mul_task())
                    .split("a", json!([1, 2, 3]))
                    .split("b", json!([10, 20]))
                    .combine("a"),
            )?;
            let sum = wf.add(Invocation::of(&common::fixtures::sum_task()).bind("x", mul.out("out")?))?;
            wf.set_output("out", sum.out("out")?)
        });
    let graph = construct(&wf, &[]).unwrap();

    let mul = graph.node("mul").unwrap();
    let mul_axes: Vec<_> = mul.exec_axes.iter().map(|a| a.as_str()).collect();
    assert_eq!(mul_axes, vec!["mul.a", "mul.b"]);
    let downstream: Vec<_> = mul.downstream_axes.iter().map(|a| a.as_str()).collect();
    assert_eq!(downstream, vec!["mul.b"]);

    let sum = graph.node("sum").unwrap();
    let sum_axes: Vec<_> = sum.exec_axes.iter().map(|a| a.as_str()).collect();
    assert_eq!(sum_axes, vec!["mul.b"]);
}

#[test]
fn linked_splits_form_one_axis() {
    let wf = WorkflowDef::define("linked")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let mul = wf.add(
                Invocation::of(&mul_task())
                    .split_linked([("a", json!([1, 2])), ("b", json!([10, 20]))])
                    .combine("a+b"),
            )?;
            let sum = wf.add(Invocation::of(&common::fixtures::sum_task()).bind("x", mul.out("out")?))?;
            wf.set_output("out", sum.out("out")?)
        });
    let graph = construct(&wf, &[]).unwrap();
    let mul = graph.node("mul").unwrap();
    let axes: Vec<_> = mul.exec_axes.iter().map(|a| a.as_str()).collect();
    assert_eq!(axes, vec!["mul.a+b"]);
    assert!(mul.downstream_axes.is_empty());
}

#[test]
fn splitting_over_an_open_axis_is_rejected() {
    let wf = WorkflowDef::define("open_split")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            // `mul` leaves its axis open, so its output is not a scalar
            // sequence to split over.
            let mul = wf.add(Invocation::of(&mul_task()).split("a", json!([1, 2])).bind("b", 2.0))?;
            let node = wf.add(Invocation::of(&add_task()).split("a", mul.out("out")?).bind("b", 0.0))?;
            wf.set_output("out", node.out("out")?)
        });
    let err = construct(&wf, &[]).unwrap_err();
    assert!(matches!(err, BuildError::SplitSourceNotScalar { field, .. } if field == "a"));
}

#[test]
fn unknown_fields_are_reported() {
    let wf = WorkflowDef::define("typo")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let node = wf.add(Invocation::of(&add_task()).bind("a", 1.0).bind("b", 2.0).bind("c", 3.0))?;
            wf.set_output("out", node.out("out")?)
        });
    let err = construct(&wf, &[]).unwrap_err();
    assert!(matches!(err, BuildError::UnknownInput { field, .. } if field == "c"));
}

#[test]
fn literal_bindings_are_type_checked_and_coerced() {
    let wf = WorkflowDef::define("literals")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            // Int literals widen into float fields.
            let node = wf.add(Invocation::of(&add_task()).bind("a", 2).bind("b", 3))?;
            wf.set_output("out", node.out("out")?)
        });
    assert!(construct(&wf, &[]).is_ok());

    let wf = WorkflowDef::define("bad_literal")
        .output("out", TypeSpec::Float)
        .constructor(|wf| {
            let node = wf.add(Invocation::of(&add_task()).bind("a", "two").bind("b", 3.0))?;
            wf.set_output("out", node.out("out")?)
        });
    assert!(matches!(
        construct(&wf, &[]).unwrap_err(),
        BuildError::TypeMismatch { dst_field, .. } if dst_field == "a"
    ));
}
