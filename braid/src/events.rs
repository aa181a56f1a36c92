//! Run lifecycle events.
//!
//! The scheduler emits one [`RunEvent`] per significant transition over an
//! optional `flume` channel configured on the runtime. Consumers range from
//! progress UIs to tests asserting cache behavior. Emission is best-effort:
//! a full or disconnected channel never blocks the run.

use chrono::{DateTime, Utc};

/// Channel endpoint accepted by the runtime configuration.
pub type EventSender = flume::Sender<RunEvent>;

/// One timestamped scheduler event.
#[derive(Clone, Debug)]
pub struct RunEvent {
    pub when: DateTime<Utc>,
    pub kind: RunEventKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEventKind {
    /// A node's state array was materialized.
    NodeExpanded { node: String, cells: usize },
    UnitStarted { unit: String },
    /// The unit reached its outputs, either by execution or from the cache.
    UnitCompleted { unit: String, cached: bool },
    UnitFailed { unit: String },
    /// Skipped because an upstream dependency failed.
    UnitUnreachable { unit: String, upstream: String },
    CacheHit { unit: String, key: String },
    RunCancelled,
}

/// Sends `kind` if a sink is configured; drops it otherwise.
pub(crate) fn emit(sender: Option<&EventSender>, kind: RunEventKind) {
    if let Some(sender) = sender {
        let _ = sender.try_send(RunEvent {
            when: Utc::now(),
            kind,
        });
    }
}
