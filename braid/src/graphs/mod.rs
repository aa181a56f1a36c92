//! Workflow construction and the frozen graph data model.
//!
//! [`WorkflowDef::define`] declares a workflow task: typed inputs and
//! outputs plus a constructor closure. Running the constructor under a
//! [`WorkflowBuilder`] wires task invocations into a DAG and freezes it as
//! a [`GraphSpec`], a pure data structure; nothing executes during
//! construction. The scheduler consumes the frozen spec.

pub mod builder;
pub mod spec;

pub use builder::{BuildError, OutputsProxy, WorkflowBuilder, WorkflowDef, WorkflowDefBuilder};
pub use spec::{GraphSpec, NodeSpec};
