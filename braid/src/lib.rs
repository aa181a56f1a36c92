//! ```text
//! WorkflowDef ─► WorkflowBuilder ─► GraphSpec (frozen DAG)
//!                    │                  │
//!                    │                  ▼
//!                    │             Scheduler ─► state arrays (split/combine)
//!                    │                  │            │
//!                    │                  │            ├─► ContentCache (at-most-once)
//!                    │                  │            └─► WorkerBackend (local / external)
//!                    │                  ▼
//!                    └── TypeLattice   RunResult (outputs + per-unit errors)
//! ```
//!
//! Braid is a dataflow workflow engine: tasks with typed fields compose
//! into directed acyclic graphs, fan out over parametric splits, gather on
//! combine, and execute concurrently with content-addressed caching. Wiring
//! is type-checked at construction against a covariant subtype lattice;
//! nothing runs until a [`runtimes::Submitter`] drives the frozen graph.

pub mod audit;
pub mod cache;
pub mod events;
pub mod graphs;
pub mod lattice;
pub mod runtimes;
pub mod schedulers;
pub mod shape;
pub mod task;
pub mod template;
pub mod types;
pub mod value;
pub mod workers;
