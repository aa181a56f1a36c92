//! Runtime configuration for the submitter.

use std::path::PathBuf;

use crate::audit::Audit;
use crate::events::EventSender;

/// Tunables for a [`Submitter`](super::Submitter).
///
/// # Examples
///
/// ```rust
/// use braid::runtimes::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_max_concurrency(8)
///     .with_cache_root("/tmp/braid-cache");
/// ```
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Upper bound on concurrently dispatched work units.
    pub max_concurrency: usize,
    /// Directory for the content-addressed cache; `None` disables caching.
    pub cache_root: Option<PathBuf>,
    /// Optional sink for run lifecycle events.
    pub events: Option<EventSender>,
    /// Optional provenance/resource audit trail.
    pub audit: Option<Audit>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            cache_root: None,
            events: None,
            audit: None,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    #[must_use]
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = Some(audit);
        self
    }
}
