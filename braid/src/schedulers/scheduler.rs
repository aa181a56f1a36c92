//! The run loop: state-array materialization, readiness, dispatch, and
//! failure routing.
//!
//! One scheduler task drives a frozen [`GraphSpec`]. Bookkeeping (node
//! expansion, readiness scans, output-store writes) happens exclusively in
//! this task between suspension points, so the graph state needs no locks.
//! Units execute concurrently on a [`JoinSet`] bounded by the configured
//! concurrency; each spawned unit handles its own cache negotiation so file
//! hashing and claim i/o stay off the bookkeeping loop.
//!
//! Failure routing: a failed unit poisons exactly the cells that read it.
//! Dependent cells become *unreachable*, carrying the originating unit id;
//! independent branches keep running.

use futures_util::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use miette::Diagnostic;

use crate::audit::Audit;
use crate::cache::{canonical_bindings, derive_key, CacheError, ContentCache, Lookup};
use crate::events::{emit, EventSender, RunEventKind};
use crate::graphs::builder::construct_graph;
use crate::graphs::GraphSpec;
use crate::lattice::TypeLattice;
use crate::runtimes::result::{RunStats, UnitErrorInfo, UnitErrorKind};
use crate::shape::{select_cells, Axis, ShapeError, StateShape};
use crate::task::{RetryPolicy, TaskDef, TaskKind};
use crate::types::{AxisId, Coord, UnitId};
use crate::value::{Bindings, LazyRef, LazySource, OutputStore, Slot};
use crate::workers::{EnvSpec, WorkUnit, WorkerBackend};

use super::CancelToken;

/// Run-level scheduler failures. Per-unit failures are routed into the
/// outcome instead.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    /// No unit is running or ready, yet some are non-terminal. Insertion
    /// order guarantees acyclicity, so this indicates internal corruption.
    #[error("scheduler stalled with non-terminal units")]
    #[diagnostic(code(braid::scheduler::stalled))]
    Stalled,
}

/// Everything a run (and its nested runs) shares.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub backend: Arc<dyn WorkerBackend>,
    pub cache: Option<ContentCache>,
    pub lattice: TypeLattice,
    pub events: Option<EventSender>,
    pub audit: Option<Arc<Audit>>,
    pub cancel: CancelToken,
    pub max_concurrency: usize,
}

/// Scheduler-level result, folded into a
/// [`RunResult`](crate::runtimes::RunResult) by the submitter.
pub(crate) struct GraphOutcome {
    pub outputs: Bindings,
    pub errors: Vec<UnitErrorInfo>,
    pub cancelled: bool,
    pub stats: RunStats,
}

/// Drives frozen graphs to completion.
pub(crate) struct Scheduler;

impl Scheduler {
    /// Runs `graph` under `ctx`. Boxed so nested workflow units can recurse.
    pub(crate) fn run(
        graph: Arc<GraphSpec>,
        ctx: RunContext,
    ) -> BoxFuture<'static, Result<GraphOutcome, SchedulerError>> {
        Box::pin(run_graph(graph, ctx))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum UnitState {
    Blocked,
    Ready,
    Running,
    Done,
    Failed,
    Unreachable,
}

impl UnitState {
    fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Done | UnitState::Failed | UnitState::Unreachable)
    }
}

/// Runtime bookkeeping for one node.
struct NodeRun {
    expanded: bool,
    /// Set when materialization itself failed; terminal for the node.
    poisoned: bool,
    shape: StateShape,
    /// Resolved split sequences: field → (axis, values).
    splits: FxHashMap<String, (AxisId, Vec<Value>)>,
    coords: Vec<Coord>,
    units: Vec<UnitState>,
}

impl NodeRun {
    fn fresh() -> Self {
        Self {
            expanded: false,
            poisoned: false,
            shape: StateShape::scalar(),
            splits: FxHashMap::default(),
            coords: Vec::new(),
            units: Vec::new(),
        }
    }

    fn is_terminal(&self) -> bool {
        self.poisoned || (self.expanded && self.units.iter().all(UnitState::is_terminal))
    }

    fn all_done(&self) -> bool {
        self.expanded && self.units.iter().all(|u| *u == UnitState::Done)
    }

    fn first_failed(&self, name: &str) -> Option<UnitId> {
        self.units
            .iter()
            .zip(&self.coords)
            .find(|(state, _)| matches!(state, UnitState::Failed | UnitState::Unreachable))
            .map(|(_, coord)| UnitId::new(name, coord.clone()))
    }
}

/// Result of one spawned unit, routed back to the bookkeeping loop.
struct UnitCompletion {
    node: usize,
    unit: usize,
    result: Result<Bindings, UnitErrorInfo>,
    /// Re-rooted errors from a nested workflow run.
    nested_errors: Vec<UnitErrorInfo>,
    stats: RunStats,
    cached: bool,
}

#[instrument(skip_all, fields(workflow = %graph.name()))]
async fn run_graph(graph: Arc<GraphSpec>, ctx: RunContext) -> Result<GraphOutcome, SchedulerError> {
    let node_count = graph.nodes().len();
    let mut runs: Vec<NodeRun> = (0..node_count).map(|_| NodeRun::fresh()).collect();
    let mut store = OutputStore::new();
    let mut errors: Vec<UnitErrorInfo> = Vec::new();
    // Root-cause unit id per failed or unreachable unit, so propagated
    // errors always name the original failure.
    let mut origins: FxHashMap<(usize, usize), String> = FxHashMap::default();
    let mut stats = RunStats::default();
    let mut cancelled = false;

    let mut join: JoinSet<UnitCompletion> = JoinSet::new();
    let mut running: FxHashMap<tokio::task::Id, (usize, usize, UnitId, Instant)> =
        FxHashMap::default();

    loop {
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            drain_cancelled(&graph, &ctx, &mut runs, &mut running, &mut join, &mut errors).await;
            break;
        }

        // Bookkeeping to fixpoint: expansion and readiness both unlock
        // further expansion.
        loop {
            let expanded = expand_nodes(&graph, &mut runs, &store, &mut errors, &ctx);
            let refreshed = refresh_units(&graph, &mut runs, &mut errors, &mut origins, &ctx);
            if !expanded && !refreshed {
                break;
            }
        }

        // Dispatch ready units up to the concurrency bound.
        while join.len() < ctx.max_concurrency {
            let Some((ni, ui)) = next_ready(&runs) else {
                break;
            };
            let node = &graph.nodes()[ni];
            let unit_id = UnitId::new(&node.name, runs[ni].coords[ui].clone());
            match bind_unit_inputs(&graph, &runs, &store, &ctx.lattice, ni, ui) {
                Ok(inputs) => {
                    runs[ni].units[ui] = UnitState::Running;
                    emit(
                        ctx.events.as_ref(),
                        RunEventKind::UnitStarted {
                            unit: unit_id.to_string(),
                        },
                    );
                    if let Some(audit) = &ctx.audit {
                        audit.unit_started(&unit_id.to_string(), &node.task.id);
                    }
                    let handle = join.spawn(execute_unit(
                        ni,
                        ui,
                        unit_id.clone(),
                        Arc::clone(&node.task),
                        node.env.clone().unwrap_or_default(),
                        node.retry,
                        node.timeout,
                        inputs,
                        ctx.clone(),
                    ));
                    running.insert(handle.id(), (ni, ui, unit_id, Instant::now()));
                }
                Err(info) => {
                    runs[ni].units[ui] = UnitState::Failed;
                    origins.insert((ni, ui), unit_id.to_string());
                    emit(
                        ctx.events.as_ref(),
                        RunEventKind::UnitFailed {
                            unit: unit_id.to_string(),
                        },
                    );
                    if let Some(audit) = &ctx.audit {
                        audit.unit_failed(&unit_id.to_string(), &node.task.id, &info.message, None);
                    }
                    errors.push(info);
                }
            }
        }

        if join.is_empty() {
            if runs.iter().all(NodeRun::is_terminal) {
                break;
            }
            // Nothing running, nothing ready, not terminal: should be
            // impossible on an acyclic graph.
            warn!("scheduler stalled; aborting run");
            return Err(SchedulerError::Stalled);
        }

        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {}
            joined = join.join_next_with_id() => {
                match joined {
                    Some(Ok((id, completion))) => {
                        let wall = running.remove(&id).map(|(_, _, _, at)| at.elapsed());
                        record_completion(
                            &graph,
                            &mut runs,
                            &mut store,
                            &mut errors,
                            &mut origins,
                            &mut stats,
                            &ctx,
                            completion,
                            wall,
                        );
                    }
                    Some(Err(join_err)) => {
                        if let Some((ni, ui, unit_id, at)) = running.remove(&join_err.id()) {
                            runs[ni].units[ui] = UnitState::Failed;
                            origins.insert((ni, ui), unit_id.to_string());
                            let (kind, message) = if join_err.is_cancelled() {
                                (UnitErrorKind::Cancelled, "unit aborted".to_string())
                            } else {
                                (UnitErrorKind::Worker, format!("unit panicked: {join_err}"))
                            };
                            if let Some(audit) = &ctx.audit {
                                audit.unit_failed(
                                    &unit_id.to_string(),
                                    &graph.nodes()[ni].task.id,
                                    &message,
                                    Some(at.elapsed()),
                                );
                            }
                            errors.push(UnitErrorInfo::new(unit_id.to_string(), kind, message));
                        }
                    }
                    None => {}
                }
            }
        }
    }

    let outputs = collect_outputs(&graph, &runs, &store, &ctx.lattice, &mut errors);
    debug!(
        outputs = outputs.len(),
        errors = errors.len(),
        cancelled,
        "run complete"
    );
    Ok(GraphOutcome {
        outputs,
        errors,
        cancelled,
        stats,
    })
}

#[allow(clippy::too_many_arguments)]
fn record_completion(
    graph: &GraphSpec,
    runs: &mut [NodeRun],
    store: &mut OutputStore,
    errors: &mut Vec<UnitErrorInfo>,
    origins: &mut FxHashMap<(usize, usize), String>,
    stats: &mut RunStats,
    ctx: &RunContext,
    completion: UnitCompletion,
    wall: Option<Duration>,
) {
    stats.absorb(completion.stats);
    errors.extend(completion.nested_errors);
    let node = &graph.nodes()[completion.node];
    let coord = runs[completion.node].coords[completion.unit].clone();
    let unit_id = UnitId::new(&node.name, coord.clone());
    match completion.result {
        Ok(outputs) => {
            store.insert(&node.name, coord, outputs);
            runs[completion.node].units[completion.unit] = UnitState::Done;
            emit(
                ctx.events.as_ref(),
                RunEventKind::UnitCompleted {
                    unit: unit_id.to_string(),
                    cached: completion.cached,
                },
            );
            if let Some(audit) = &ctx.audit {
                audit.unit_completed(&unit_id.to_string(), &node.task.id, completion.cached, wall);
            }
        }
        Err(info) => {
            runs[completion.node].units[completion.unit] = UnitState::Failed;
            origins.insert((completion.node, completion.unit), unit_id.to_string());
            emit(
                ctx.events.as_ref(),
                RunEventKind::UnitFailed {
                    unit: unit_id.to_string(),
                },
            );
            if let Some(audit) = &ctx.audit {
                audit.unit_failed(&unit_id.to_string(), &node.task.id, &info.message, wall);
            }
            errors.push(info);
        }
    }
}

/// Marks everything non-terminal as cancelled and drains in-flight units.
async fn drain_cancelled(
    graph: &GraphSpec,
    ctx: &RunContext,
    runs: &mut [NodeRun],
    running: &mut FxHashMap<tokio::task::Id, (usize, usize, UnitId, Instant)>,
    join: &mut JoinSet<UnitCompletion>,
    errors: &mut Vec<UnitErrorInfo>,
) {
    emit(ctx.events.as_ref(), RunEventKind::RunCancelled);
    for (ni, run) in runs.iter_mut().enumerate() {
        let name = &graph.nodes()[ni].name;
        if !run.expanded {
            if !run.poisoned {
                errors.push(UnitErrorInfo::new(
                    name.clone(),
                    UnitErrorKind::Cancelled,
                    "run cancelled before the node materialized",
                ));
                run.poisoned = true;
            }
            continue;
        }
        for (ui, state) in run.units.iter_mut().enumerate() {
            if matches!(state, UnitState::Blocked | UnitState::Ready) {
                *state = UnitState::Unreachable;
                errors.push(UnitErrorInfo::new(
                    UnitId::new(name, run.coords[ui].clone()).to_string(),
                    UnitErrorKind::Cancelled,
                    "run cancelled",
                ));
            }
        }
    }
    for (_, _, unit_id, _) in running.values() {
        ctx.backend.cancel(unit_id).await;
    }
    join.shutdown().await;
    for (_, (ni, ui, unit_id, at)) in running.drain() {
        runs[ni].units[ui] = UnitState::Failed;
        if let Some(audit) = &ctx.audit {
            audit.unit_failed(
                &unit_id.to_string(),
                &graph.nodes()[ni].task.id,
                "run cancelled while the unit was in flight",
                Some(at.elapsed()),
            );
        }
        errors.push(UnitErrorInfo::new(
            unit_id.to_string(),
            UnitErrorKind::Cancelled,
            "run cancelled while the unit was in flight",
        ));
    }
}

fn next_ready(runs: &[NodeRun]) -> Option<(usize, usize)> {
    for (ni, run) in runs.iter().enumerate() {
        if !run.expanded {
            continue;
        }
        if let Some(ui) = run.units.iter().position(|u| *u == UnitState::Ready) {
            return Some((ni, ui));
        }
    }
    None
}

/// Expands nodes whose producers allow it. Returns whether any progress
/// was made (expansion or poisoning).
fn expand_nodes(
    graph: &GraphSpec,
    runs: &mut [NodeRun],
    store: &OutputStore,
    errors: &mut Vec<UnitErrorInfo>,
    ctx: &RunContext,
) -> bool {
    let mut progress = false;
    for ni in 0..graph.nodes().len() {
        if runs[ni].expanded || runs[ni].poisoned {
            continue;
        }
        let verdict = try_expand(graph, runs, store, ni);
        match verdict {
            Expansion::Wait => {}
            Expansion::Poison(info) => {
                runs[ni].poisoned = true;
                errors.push(info);
                progress = true;
            }
            Expansion::Ready {
                shape,
                splits,
            } => {
                let coords = shape.coords();
                let cells = coords.len();
                runs[ni].units = vec![UnitState::Blocked; cells];
                runs[ni].coords = coords;
                runs[ni].shape = shape;
                runs[ni].splits = splits;
                runs[ni].expanded = true;
                emit(
                    ctx.events.as_ref(),
                    RunEventKind::NodeExpanded {
                        node: graph.nodes()[ni].name.clone(),
                        cells,
                    },
                );
                progress = true;
            }
        }
    }
    progress
}

enum Expansion {
    Wait,
    Poison(UnitErrorInfo),
    Ready {
        shape: StateShape,
        splits: FxHashMap<String, (AxisId, Vec<Value>)>,
    },
}

fn try_expand(graph: &GraphSpec, runs: &[NodeRun], store: &OutputStore, ni: usize) -> Expansion {
    let node = &graph.nodes()[ni];

    // All producers must have materialized their own state arrays.
    for producer in node.producer_nodes() {
        let Some(pi) = graph.node_index(producer) else {
            return Expansion::Poison(shape_error(
                &node.name,
                format!("unknown producer node `{producer}`"),
            ));
        };
        if runs[pi].poisoned {
            return Expansion::Poison(UnitErrorInfo::new(
                node.name.clone(),
                UnitErrorKind::Unreachable {
                    upstream: producer.to_string(),
                },
                format!("upstream node `{producer}` failed to materialize"),
            ));
        }
        if !runs[pi].expanded {
            return Expansion::Wait;
        }
    }

    // Lazily sourced split sequences need their producers fully settled.
    for (_, decl) in &node.splits {
        for (field, slot) in &decl.fields {
            let Slot::Lazy(lazy) = slot else { continue };
            let LazySource::Node { node: producer, .. } = &lazy.source else {
                continue;
            };
            let pi = match graph.node_index(producer) {
                Some(pi) => pi,
                None => {
                    return Expansion::Poison(shape_error(
                        &node.name,
                        format!("unknown producer node `{producer}`"),
                    ))
                }
            };
            if let Some(failed) = runs[pi].first_failed(producer) {
                return Expansion::Poison(UnitErrorInfo::new(
                    node.name.clone(),
                    UnitErrorKind::Unreachable {
                        upstream: failed.to_string(),
                    },
                    format!("split source `{producer}.{field}` depends on a failed unit"),
                ));
            }
            if !runs[pi].all_done() {
                return Expansion::Wait;
            }
        }
    }

    // Resolve split sequences and local axis cardinalities.
    let mut splits: FxHashMap<String, (AxisId, Vec<Value>)> = FxHashMap::default();
    let mut local_lens: FxHashMap<AxisId, usize> = FxHashMap::default();
    for (axis, decl) in &node.splits {
        let mut axis_len: Option<usize> = None;
        for (field, slot) in &decl.fields {
            let resolved = match slot {
                Slot::Value(value) => value.clone(),
                Slot::Lazy(lazy) => match read_lazy_value(graph, runs, store, lazy) {
                    Some(value) => value,
                    None => {
                        return Expansion::Poison(shape_error(
                            &node.name,
                            format!("split source for `{}.{field}` never materialized", node.name),
                        ))
                    }
                },
            };
            let Value::Array(items) = resolved else {
                return Expansion::Poison(shape_error(
                    &node.name,
                    ShapeError::SplitNotSequence {
                        node: node.name.clone(),
                        field: field.clone(),
                    }
                    .to_string(),
                ));
            };
            match axis_len {
                None => axis_len = Some(items.len()),
                Some(len) if len != items.len() => {
                    return Expansion::Poison(shape_error(
                        &node.name,
                        ShapeError::LinkedLengthMismatch { axis: axis.clone() }.to_string(),
                    ));
                }
                Some(_) => {}
            }
            splits.insert(field.clone(), (axis.clone(), items));
        }
        local_lens.insert(axis.clone(), axis_len.unwrap_or(0));
    }

    // Assemble the execution shape; inherited axes join across producers
    // and must agree on cardinality.
    let mut axes = Vec::with_capacity(node.exec_axes.len());
    for axis_id in &node.exec_axes {
        let len = if let Some(&len) = local_lens.get(axis_id) {
            len
        } else {
            let mut inherited: Option<usize> = None;
            for producer in node.producer_nodes() {
                let Some(pi) = graph.node_index(producer) else {
                    continue;
                };
                if !graph.nodes()[pi].downstream_axes.contains(axis_id) {
                    continue;
                }
                let Some(plen) = runs[pi].shape.axis_len(axis_id) else {
                    continue;
                };
                match inherited {
                    None => inherited = Some(plen),
                    Some(len) if len != plen => {
                        return Expansion::Poison(shape_error(
                            &node.name,
                            ShapeError::AxisMismatch {
                                axis: axis_id.clone(),
                                left: len,
                                right: plen,
                            }
                            .to_string(),
                        ));
                    }
                    Some(_) => {}
                }
            }
            match inherited {
                Some(len) => len,
                None => {
                    return Expansion::Poison(shape_error(
                        &node.name,
                        format!("axis `{axis_id}` has no producer"),
                    ))
                }
            }
        };
        axes.push(Axis {
            id: axis_id.clone(),
            len,
        });
    }

    Expansion::Ready {
        shape: StateShape::from_axes(axes),
        splits,
    }
}

fn shape_error(node: &str, message: String) -> UnitErrorInfo {
    UnitErrorInfo::new(node.to_string(), UnitErrorKind::Shape, message)
}

/// Reads the settled value behind a scalar lazy reference (gathering over
/// any combined axes).
fn read_lazy_value(
    graph: &GraphSpec,
    runs: &[NodeRun],
    store: &OutputStore,
    lazy: &LazyRef,
) -> Option<Value> {
    match &lazy.source {
        LazySource::Input(name) => graph.input_value(name).cloned(),
        LazySource::Node { node, field } => {
            let pi = graph.node_index(node)?;
            read_producer_value(graph, runs, store, pi, field, &FxHashMap::default())
        }
    }
}

/// Reads a producer's output for a consumer: fixes the shared axes from
/// `fixed` and gathers the rest in lexicographic order.
fn read_producer_value(
    graph: &GraphSpec,
    runs: &[NodeRun],
    store: &OutputStore,
    pi: usize,
    field: &str,
    fixed: &FxHashMap<AxisId, usize>,
) -> Option<Value> {
    let name = &graph.nodes()[pi].name;
    let shape = &runs[pi].shape;
    let gathering = shape.axes().iter().any(|a| !fixed.contains_key(&a.id));
    let cells = select_cells(shape, fixed);
    if gathering {
        let mut items = Vec::with_capacity(cells.len());
        for cell in cells {
            items.push(store.field(name, &cell, field)?.clone());
        }
        Some(Value::Array(items))
    } else {
        store.field(name, cells.first()?, field).cloned()
    }
}

/// Moves blocked units to ready or unreachable. Returns whether any state
/// changed.
fn refresh_units(
    graph: &GraphSpec,
    runs: &mut [NodeRun],
    errors: &mut Vec<UnitErrorInfo>,
    origins: &mut FxHashMap<(usize, usize), String>,
    ctx: &RunContext,
) -> bool {
    let mut transitions: Vec<(usize, usize, UnitState, Option<(usize, usize, UnitId)>)> =
        Vec::new();
    for (ni, run) in runs.iter().enumerate() {
        if !run.expanded {
            continue;
        }
        for (ui, state) in run.units.iter().enumerate() {
            if *state != UnitState::Blocked {
                continue;
            }
            match unit_dependencies(graph, runs, ni, ui) {
                DepStatus::AllDone => {
                    transitions.push((ni, ui, UnitState::Ready, None));
                }
                DepStatus::Failed(upstream) => {
                    transitions.push((ni, ui, UnitState::Unreachable, Some(upstream)));
                }
                DepStatus::Waiting => {}
            }
        }
    }
    let progress = !transitions.is_empty();
    for (ni, ui, state, upstream) in transitions {
        let node = &graph.nodes()[ni];
        let unit_id = UnitId::new(&node.name, runs[ni].coords[ui].clone());
        if let Some((pni, pui, upstream_id)) = upstream {
            // Chase the chain back to the original failure so every
            // unreachable unit names the root cause.
            let origin = origins
                .get(&(pni, pui))
                .cloned()
                .unwrap_or_else(|| upstream_id.to_string());
            origins.insert((ni, ui), origin.clone());
            emit(
                ctx.events.as_ref(),
                RunEventKind::UnitUnreachable {
                    unit: unit_id.to_string(),
                    upstream: origin.clone(),
                },
            );
            errors.push(UnitErrorInfo::new(
                unit_id.to_string(),
                UnitErrorKind::Unreachable {
                    upstream: origin.clone(),
                },
                format!("upstream unit `{origin}` failed"),
            ));
        }
        runs[ni].units[ui] = state;
    }
    progress
}

enum DepStatus {
    AllDone,
    Waiting,
    /// Producer index, unit index, and unit id of a failed dependency.
    Failed((usize, usize, UnitId)),
}

fn unit_dependencies(graph: &GraphSpec, runs: &[NodeRun], ni: usize, ui: usize) -> DepStatus {
    let node = &graph.nodes()[ni];
    let run = &runs[ni];
    let fixed = run.shape.coord_by_axis(&run.coords[ui]);
    let mut waiting = false;
    for (_, slot) in &node.inputs {
        let Slot::Lazy(lazy) = slot else { continue };
        let LazySource::Node { node: producer, .. } = &lazy.source else {
            continue;
        };
        let Some(pi) = graph.node_index(producer) else {
            continue;
        };
        let producer_run = &runs[pi];
        for cell in select_cells(&producer_run.shape, &fixed) {
            let pos = producer_run.shape.position(&cell);
            match producer_run.units.get(pos) {
                Some(UnitState::Done) => {}
                Some(UnitState::Failed) | Some(UnitState::Unreachable) => {
                    return DepStatus::Failed((pi, pos, UnitId::new(producer, cell)));
                }
                _ => waiting = true,
            }
        }
    }
    if waiting {
        DepStatus::Waiting
    } else {
        DepStatus::AllDone
    }
}

/// Builds the concrete input record for one cell, applying the
/// dispatch-time type re-check.
fn bind_unit_inputs(
    graph: &GraphSpec,
    runs: &[NodeRun],
    store: &OutputStore,
    lattice: &TypeLattice,
    ni: usize,
    ui: usize,
) -> Result<Bindings, UnitErrorInfo> {
    let node = &graph.nodes()[ni];
    let run = &runs[ni];
    let coord = &run.coords[ui];
    let unit_id = UnitId::new(&node.name, coord.clone());
    let fixed = run.shape.coord_by_axis(coord);

    let mut inputs = Bindings::default();
    for (field, slot) in &node.inputs {
        let value = match slot {
            Slot::Value(value) => value.clone(),
            Slot::Lazy(lazy) => match &lazy.source {
                LazySource::Input(name) => {
                    graph.input_value(name).cloned().ok_or_else(|| {
                        UnitErrorInfo::new(
                            unit_id.to_string(),
                            UnitErrorKind::Build,
                            format!("workflow input `{name}` was never resolved to a value"),
                        )
                    })?
                }
                LazySource::Node {
                    node: producer,
                    field: source_field,
                } => {
                    let pi = graph.node_index(producer).ok_or_else(|| {
                        UnitErrorInfo::new(
                            unit_id.to_string(),
                            UnitErrorKind::Shape,
                            format!("unknown producer node `{producer}`"),
                        )
                    })?;
                    read_producer_value(graph, runs, store, pi, source_field, &fixed).ok_or_else(
                        || {
                            UnitErrorInfo::new(
                                unit_id.to_string(),
                                UnitErrorKind::Shape,
                                format!("output `{producer}.{source_field}` was never materialized"),
                            )
                        },
                    )?
                }
            },
        };
        inputs.insert(field.clone(), value);
    }

    for (field, (axis, sequence)) in &run.splits {
        let axis_pos = run
            .shape
            .axes()
            .iter()
            .position(|a| &a.id == axis)
            .ok_or_else(|| {
                UnitErrorInfo::new(
                    unit_id.to_string(),
                    UnitErrorKind::Shape,
                    format!("split axis `{axis}` missing from state shape"),
                )
            })?;
        inputs.insert(field.clone(), sequence[coord[axis_pos]].clone());
    }

    // Values admitted through `Any` wires get their deferred check here.
    for spec in &node.task.inputs {
        let Some(value) = inputs.get(&spec.name) else {
            continue;
        };
        if !lattice.admits(value, &spec.ty) {
            match lattice.coerce(value, &spec.ty) {
                Some(coerced) => {
                    inputs.insert(spec.name.clone(), coerced);
                }
                None => {
                    return Err(UnitErrorInfo::new(
                        unit_id.to_string(),
                        UnitErrorKind::InvalidType,
                        format!(
                            "input `{}` does not conform to declared type {}",
                            spec.name, spec.ty
                        ),
                    ));
                }
            }
        }
    }

    Ok(inputs)
}

/// One spawned unit: cache negotiation plus execution.
#[allow(clippy::too_many_arguments)]
async fn execute_unit(
    node: usize,
    unit: usize,
    unit_id: UnitId,
    task: Arc<TaskDef>,
    env: EnvSpec,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    inputs: Bindings,
    ctx: RunContext,
) -> UnitCompletion {
    let mut stats = RunStats::default();
    let mut nested_errors = Vec::new();

    // Nested workflows are constructed up front: the structural digest of
    // the constructed graph participates in the cache key.
    let nested_graph = match &task.kind {
        TaskKind::Workflow(ctor) => {
            let slot_inputs = inputs
                .iter()
                .map(|(name, value)| (name.clone(), Slot::Value(value.clone())))
                .collect();
            match construct_graph(&task, ctor.as_ref(), slot_inputs, &ctx.lattice) {
                Ok(spec) => Some(Arc::new(spec)),
                Err(e) => {
                    return UnitCompletion {
                        node,
                        unit,
                        result: Err(UnitErrorInfo::new(
                            unit_id.to_string(),
                            UnitErrorKind::Build,
                            e.to_string(),
                        )),
                        nested_errors,
                        stats,
                        cached: false,
                    }
                }
            }
        }
        _ => None,
    };

    let result = if let Some(cache) = ctx.cache.clone() {
        cached_execution(
            &cache,
            &unit_id,
            &task,
            &env,
            retry,
            timeout,
            &inputs,
            nested_graph,
            &ctx,
            &mut stats,
            &mut nested_errors,
        )
        .await
    } else {
        run_executable(
            &unit_id,
            &task,
            &env,
            retry,
            timeout,
            &inputs,
            nested_graph,
            &ctx,
            &mut stats,
            &mut nested_errors,
        )
        .await
        .map(|outs| (outs, false))
    };

    match result {
        Ok((outputs, cached)) => UnitCompletion {
            node,
            unit,
            result: Ok(outputs),
            nested_errors,
            stats,
            cached,
        },
        Err(info) => UnitCompletion {
            node,
            unit,
            result: Err(info),
            nested_errors,
            stats,
            cached: false,
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn cached_execution(
    cache: &ContentCache,
    unit_id: &UnitId,
    task: &Arc<TaskDef>,
    env: &EnvSpec,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    inputs: &Bindings,
    nested_graph: Option<Arc<GraphSpec>>,
    ctx: &RunContext,
    stats: &mut RunStats,
    nested_errors: &mut Vec<UnitErrorInfo>,
) -> Result<(Bindings, bool), UnitErrorInfo> {
    // Canonicalization hashes file contents, so it runs on the blocking
    // pool rather than stalling the dispatch path.
    let canonical = {
        let inputs = inputs.clone();
        let specs = task.inputs.clone();
        let hashed = tokio::task::spawn_blocking(move || canonical_bindings(&inputs, &specs))
            .await
            .map_err(|e| {
                UnitErrorInfo::new(
                    unit_id.to_string(),
                    UnitErrorKind::Cache,
                    format!("canonicalization aborted: {e}"),
                )
            })?;
        hashed.map_err(|e| {
            UnitErrorInfo::new(unit_id.to_string(), UnitErrorKind::Cache, e.to_string())
        })?
    };
    let structural = nested_graph.as_ref().map(|g| g.structural_digest());
    let key = derive_key(&task.id, &env.id, &canonical, structural.as_deref());

    loop {
        match cache.lookup(&key, &canonical).await {
            Ok(Lookup::Hit(outputs)) => {
                stats.cache_hits += 1;
                emit(
                    ctx.events.as_ref(),
                    RunEventKind::CacheHit {
                        unit: unit_id.to_string(),
                        key: key.as_hex().to_string(),
                    },
                );
                return Ok((outputs, true));
            }
            Ok(Lookup::InFlight(waiter)) => match waiter.wait().await {
                Ok(Some(outputs)) => {
                    stats.cache_hits += 1;
                    return Ok((outputs, true));
                }
                // The claimant failed; compete for our own claim.
                Ok(None) => continue,
                Err(e) => {
                    return Err(UnitErrorInfo::new(
                        unit_id.to_string(),
                        UnitErrorKind::Cache,
                        e.to_string(),
                    ))
                }
            },
            Ok(Lookup::Miss(claim)) => {
                let result = run_executable(
                    unit_id,
                    task,
                    env,
                    retry,
                    timeout,
                    inputs,
                    nested_graph,
                    ctx,
                    stats,
                    nested_errors,
                )
                .await;
                return match result {
                    Ok(outputs) => match claim.publish(&outputs, &task.outputs).await {
                        Ok(published) => Ok((published, false)),
                        Err(e) => Err(UnitErrorInfo::new(
                            unit_id.to_string(),
                            UnitErrorKind::Cache,
                            e.to_string(),
                        )),
                    },
                    Err(info) => {
                        claim.fail(&info.message).await;
                        Err(info)
                    }
                };
            }
            Err(CacheError::Corruption { key }) => {
                return Err(UnitErrorInfo::new(
                    unit_id.to_string(),
                    UnitErrorKind::Cache,
                    format!("corrupt cache entry `{key}`"),
                ))
            }
            Err(e) => {
                return Err(UnitErrorInfo::new(
                    unit_id.to_string(),
                    UnitErrorKind::Cache,
                    e.to_string(),
                ))
            }
        }
    }
}

/// Executes the task behind a unit: nested workflows recurse into the
/// scheduler, everything else goes to the worker backend under the unit's
/// timeout and retry policy.
#[allow(clippy::too_many_arguments)]
async fn run_executable(
    unit_id: &UnitId,
    task: &Arc<TaskDef>,
    env: &EnvSpec,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    inputs: &Bindings,
    nested_graph: Option<Arc<GraphSpec>>,
    ctx: &RunContext,
    stats: &mut RunStats,
    nested_errors: &mut Vec<UnitErrorInfo>,
) -> Result<Bindings, UnitErrorInfo> {
    if let Some(graph) = nested_graph {
        let outcome = Scheduler::run(graph, ctx.clone())
            .await
            .map_err(|e| {
                UnitErrorInfo::new(unit_id.to_string(), UnitErrorKind::Worker, e.to_string())
            })?;
        stats.absorb(outcome.stats);
        if outcome.cancelled {
            return Err(UnitErrorInfo::new(
                unit_id.to_string(),
                UnitErrorKind::Cancelled,
                "nested workflow cancelled",
            ));
        }
        if !outcome.errors.is_empty() {
            let failed = outcome.errors.len();
            nested_errors.extend(
                outcome
                    .errors
                    .into_iter()
                    .map(|e| e.rerooted(&unit_id.to_string())),
            );
            return Err(UnitErrorInfo::new(
                unit_id.to_string(),
                UnitErrorKind::Worker,
                format!("nested workflow failed in {failed} unit(s)"),
            ));
        }
        return Ok(outcome.outputs);
    }

    let attempts = retry.max_retries + 1;
    let mut last_error = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(retry.delay_for(attempt - 1)).await;
        }
        stats.executed += 1;
        let work = WorkUnit {
            unit: unit_id.clone(),
            task: Arc::clone(task),
            inputs: inputs.clone(),
        };
        let submit = ctx.backend.submit(&work, env);
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, submit).await {
                Ok(result) => result.map_err(|f| {
                    UnitErrorInfo::from_worker_failure(unit_id.to_string(), &f)
                }),
                Err(_) => Err(UnitErrorInfo::new(
                    unit_id.to_string(),
                    UnitErrorKind::Timeout,
                    format!("unit exceeded its {}s timeout", limit.as_secs_f64()),
                )),
            },
            None => submit.await.map_err(|f| {
                UnitErrorInfo::from_worker_failure(unit_id.to_string(), &f)
            }),
        };
        match outcome {
            Ok(outputs) => return Ok(outputs),
            Err(info) => {
                if attempt + 1 < attempts {
                    debug!(unit = %unit_id, attempt, "unit failed; retrying");
                }
                last_error = Some(info);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        UnitErrorInfo::new(
            unit_id.to_string(),
            UnitErrorKind::Worker,
            "unit produced no outcome",
        )
    }))
}

/// Resolves the declared workflow outputs from the store.
fn collect_outputs(
    graph: &GraphSpec,
    runs: &[NodeRun],
    store: &OutputStore,
    lattice: &TypeLattice,
    errors: &mut Vec<UnitErrorInfo>,
) -> Bindings {
    let mut outputs = Bindings::default();
    for (name, lazy) in graph.outputs() {
        match &lazy.source {
            LazySource::Input(input) => {
                if let Some(value) = graph.input_value(input) {
                    outputs.insert(name.clone(), value.clone());
                }
            }
            LazySource::Node {
                node: producer,
                field,
            } => {
                let Some(pi) = graph.node_index(producer) else {
                    continue;
                };
                let run = &runs[pi];
                if !run.expanded {
                    continue;
                }
                let node = &graph.nodes()[pi];
                let down_axes: Vec<Axis> = node
                    .downstream_axes
                    .iter()
                    .filter_map(|id| {
                        run.shape.axis_len(id).map(|len| Axis {
                            id: id.clone(),
                            len,
                        })
                    })
                    .collect();
                let down_shape = StateShape::from_axes(down_axes);

                let mut values = Vec::new();
                let mut complete = true;
                for dcoord in down_shape.coords() {
                    let fixed = down_shape.coord_by_axis(&dcoord);
                    match read_producer_value(graph, runs, store, pi, field, &fixed) {
                        Some(value) => values.push(value),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if !complete {
                    // The responsible unit failure is already recorded.
                    continue;
                }
                let value = if down_shape.is_scalar() {
                    match values.into_iter().next() {
                        Some(v) => v,
                        None => continue,
                    }
                } else {
                    Value::Array(values)
                };

                let declared = graph.output_specs().iter().find(|s| &s.name == name);
                let Some(spec) = declared else {
                    outputs.insert(name.clone(), value);
                    continue;
                };
                if lattice.admits(&value, &spec.ty) {
                    outputs.insert(name.clone(), value);
                } else if let Some(coerced) = lattice.coerce(&value, &spec.ty) {
                    outputs.insert(name.clone(), coerced);
                } else if down_shape.cell_count() == 0 {
                    // An empty state array cannot satisfy a scalar demand.
                    errors.push(UnitErrorInfo::new(
                        format!("{}.outputs.{name}", graph.name()),
                        UnitErrorKind::Unreachable {
                            upstream: producer.clone(),
                        },
                        format!("`{producer}` produced an empty state array"),
                    ));
                } else {
                    errors.push(UnitErrorInfo::new(
                        format!("{}.outputs.{name}", graph.name()),
                        UnitErrorKind::InvalidType,
                        format!("output `{name}` does not conform to declared type {}", spec.ty),
                    ));
                }
            }
        }
    }
    outputs
}
