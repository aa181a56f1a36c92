//! Provenance and resource auditing.
//!
//! A run can carry an [`Audit`] configuration: a set of [`AuditFlag`]s
//! deciding what gets tracked, and a list of [`Messenger`]s that receive
//! the resulting [`AuditRecord`]s. The `Prov` flag enables provenance
//! records (which unit of which task started and how it settled); the
//! `Resource` flag adds runtime measurements to the settlement records.
//! With no flags set the audit layer is silent.
//!
//! Records are serde-serializable so messengers can persist or forward
//! them as JSON. Emission is synchronous and in-memory; a consumer that
//! wants a durable trail attaches a [`ChannelMessenger`] and writes the
//! records out on its own schedule.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

/// What the audit layer tracks, combinable with `|`.
///
/// # Examples
///
/// ```rust
/// use braid::audit::AuditFlag;
///
/// let flags = AuditFlag::PROV | AuditFlag::RESOURCE;
/// assert!(flags.check(AuditFlag::PROV));
/// assert_eq!(flags, AuditFlag::ALL);
/// assert!(!AuditFlag::NONE.check(AuditFlag::PROV));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditFlag(u8);

impl AuditFlag {
    pub const NONE: AuditFlag = AuditFlag(0);
    /// Track provenance: unit start and settlement records.
    pub const PROV: AuditFlag = AuditFlag(0b01);
    /// Track resource use: runtime measurements on settlement records.
    pub const RESOURCE: AuditFlag = AuditFlag(0b10);
    pub const ALL: AuditFlag = AuditFlag(0b11);

    /// Is any of `flag`'s bits enabled here?
    #[must_use]
    pub fn check(self, flag: AuditFlag) -> bool {
        self.0 & flag.0 != 0
    }
}

impl BitOr for AuditFlag {
    type Output = AuditFlag;

    fn bitor(self, rhs: AuditFlag) -> AuditFlag {
        AuditFlag(self.0 | rhs.0)
    }
}

/// One audit trail entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditRecord {
    pub when: DateTime<Utc>,
    /// Unit id, e.g. `"mul[1,0]"`.
    pub unit: String,
    /// Task identity behind the unit.
    pub task: String,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// What happened to the unit.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Started,
    Completed {
        /// Whether the outputs came from the cache.
        cached: bool,
        /// Wall-clock runtime; present when `Resource` auditing is on.
        wall_time_ms: Option<u64>,
    },
    Failed {
        message: String,
        wall_time_ms: Option<u64>,
    },
}

/// Receives audit records. Implementations must not block: persistence
/// belongs behind a [`ChannelMessenger`] consumer.
pub trait Messenger: Send + Sync {
    fn send(&self, record: &AuditRecord);
}

/// Logs each record as JSON through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrintMessenger;

impl Messenger for PrintMessenger {
    fn send(&self, record: &AuditRecord) {
        match serde_json::to_string(record) {
            Ok(json) => tracing::info!(target: "braid::audit", record = %json),
            Err(e) => tracing::warn!(target: "braid::audit", error = %e, "unserializable audit record"),
        }
    }
}

/// Forwards records over a `flume` channel, best-effort.
#[derive(Clone)]
pub struct ChannelMessenger {
    sender: flume::Sender<AuditRecord>,
}

impl ChannelMessenger {
    pub fn new(sender: flume::Sender<AuditRecord>) -> Self {
        Self { sender }
    }
}

impl Messenger for ChannelMessenger {
    fn send(&self, record: &AuditRecord) {
        let _ = self.sender.try_send(record.clone());
    }
}

/// Audit configuration attached to a
/// [`RuntimeConfig`](crate::runtimes::RuntimeConfig).
#[derive(Clone)]
pub struct Audit {
    flags: AuditFlag,
    messengers: Vec<Arc<dyn Messenger>>,
}

impl fmt::Debug for Audit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Audit")
            .field("flags", &self.flags)
            .field("messengers", &self.messengers.len())
            .finish()
    }
}

impl Audit {
    #[must_use]
    pub fn new(flags: AuditFlag) -> Self {
        Self {
            flags,
            messengers: Vec::new(),
        }
    }

    /// Attaches a messenger; records fan out to every attached one.
    #[must_use]
    pub fn with_messenger(mut self, messenger: impl Messenger + 'static) -> Self {
        self.messengers.push(Arc::new(messenger));
        self
    }

    /// Is auditing enabled for `flag`?
    #[must_use]
    pub fn check(&self, flag: AuditFlag) -> bool {
        self.flags.check(flag)
    }

    pub(crate) fn unit_started(&self, unit: &str, task: &str) {
        if !self.check(AuditFlag::PROV) {
            return;
        }
        self.send(unit, task, AuditEvent::Started);
    }

    pub(crate) fn unit_completed(&self, unit: &str, task: &str, cached: bool, wall: Option<Duration>) {
        if !self.check(AuditFlag::PROV) && !self.check(AuditFlag::RESOURCE) {
            return;
        }
        self.send(
            unit,
            task,
            AuditEvent::Completed {
                cached,
                wall_time_ms: self.wall_time_ms(wall),
            },
        );
    }

    pub(crate) fn unit_failed(&self, unit: &str, task: &str, message: &str, wall: Option<Duration>) {
        if !self.check(AuditFlag::PROV) && !self.check(AuditFlag::RESOURCE) {
            return;
        }
        self.send(
            unit,
            task,
            AuditEvent::Failed {
                message: message.to_string(),
                wall_time_ms: self.wall_time_ms(wall),
            },
        );
    }

    fn wall_time_ms(&self, wall: Option<Duration>) -> Option<u64> {
        if self.check(AuditFlag::RESOURCE) {
            wall.map(|d| d.as_millis() as u64)
        } else {
            None
        }
    }

    fn send(&self, unit: &str, task: &str, event: AuditEvent) {
        let record = AuditRecord {
            when: Utc::now(),
            unit: unit.to_string(),
            task: task.to_string(),
            event,
        };
        for messenger in &self.messengers {
            messenger.send(&record);
        }
    }
}
