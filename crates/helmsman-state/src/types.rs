//! Persisted rollout record types.
//!
//! A `RolloutRecord` describes one rollout or run attempt: who asked for
//! which image, where the lifecycle currently stands, how long it has been
//! actively supervised, and what the monitor last observed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use helmsman_core::{RecordKey, WorkloadKind, WorkloadRef};

/// Lifecycle state of a rollout record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    New,
    Running,
    Pausing,
    Paused,
    RollingBack,
    RolledBack,
    Completed,
    Terminating,
    Terminated,
    Failed,
}

impl RolloutState {
    pub const ALL: [RolloutState; 10] = [
        RolloutState::New,
        RolloutState::Running,
        RolloutState::Pausing,
        RolloutState::Paused,
        RolloutState::RollingBack,
        RolloutState::RolledBack,
        RolloutState::Completed,
        RolloutState::Terminating,
        RolloutState::Terminated,
        RolloutState::Failed,
    ];

    /// States no monitor will move out of on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutState::Completed
                | RolloutState::RolledBack
                | RolloutState::Terminated
                | RolloutState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RolloutState::New => "new",
            RolloutState::Running => "running",
            RolloutState::Pausing => "pausing",
            RolloutState::Paused => "paused",
            RolloutState::RollingBack => "rolling_back",
            RolloutState::RolledBack => "rolled_back",
            RolloutState::Completed => "completed",
            RolloutState::Terminating => "terminating",
            RolloutState::Terminated => "terminated",
            RolloutState::Failed => "failed",
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a record log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        })
    }
}

/// One line of a record's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix timestamp (seconds).
    pub time: u64,
    pub message: String,
    pub severity: Severity,
}

/// Phase reported for a single pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Last-observed summary of a pod belonging to an incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    /// Unix timestamp (seconds) the pod was created.
    pub created_at: u64,
    pub phase: PodPhase,
    pub ready: bool,
    pub host: Option<String>,
}

/// How the adapter should replace the predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Surge successor replicas `step` at a time while draining the predecessor.
    #[default]
    Rolling,
    /// Scale the predecessor to zero before starting the successor.
    Recreate,
}

/// Optional per-rollout policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    pub strategy: RolloutStrategy,
    /// Replicas brought up per step.
    pub step: u32,
    /// Pause once when the successor first reaches `step` ready replicas.
    pub autopause: bool,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            strategy: RolloutStrategy::Rolling,
            step: 1,
            autopause: false,
        }
    }
}

/// One rollout or run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub id: String,
    pub env: String,
    pub workload: String,
    pub kind: WorkloadKind,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: u64,
    pub requested_by: String,

    pub branch: String,
    pub tag: String,
    /// Image digest resolved for `tag` at creation.
    pub digest: Option<String>,
    pub policy: Option<RolloutPolicy>,

    pub state: RolloutState,
    /// Accumulated actively-supervised time. Excludes paused periods.
    pub clock: Duration,

    pub desired_replicas: u32,
    /// Predecessor incarnation; fixed at creation.
    pub from_ref: Option<String>,
    /// Successor incarnation created by the latest resume cycle.
    pub to_ref: Option<String>,
    pub from_pods: Vec<PodSummary>,
    pub to_pods: Vec<PodSummary>,
    /// The autopause checkpoint has already fired.
    #[serde(default)]
    pub autopaused: bool,

    pub log: Vec<LogEntry>,
}

impl RolloutRecord {
    /// A fresh record in `New` with empty bookkeeping.
    pub fn new(
        key: &RecordKey,
        kind: WorkloadKind,
        branch: &str,
        tag: &str,
        requested_by: &str,
    ) -> Self {
        Self {
            id: key.id.clone(),
            env: key.env.clone(),
            workload: key.workload.clone(),
            kind,
            created_at: epoch_secs(),
            requested_by: requested_by.to_string(),
            branch: branch.to_string(),
            tag: tag.to_string(),
            digest: None,
            policy: None,
            state: RolloutState::New,
            clock: Duration::ZERO,
            desired_replicas: 0,
            from_ref: None,
            to_ref: None,
            from_pods: Vec::new(),
            to_pods: Vec::new(),
            autopaused: false,
            log: Vec::new(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.env.clone(), self.workload.clone(), self.id.clone())
    }

    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(self.env.clone(), self.workload.clone())
    }

    /// Build the composite key for the rollouts table.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.env, self.workload, self.id)
    }

    /// Append a log entry stamped with the current time.
    pub fn push_log(&mut self, severity: Severity, message: impl Into<String>) {
        self.log.push(LogEntry {
            time: epoch_secs(),
            message: message.into(),
            severity,
        });
    }

    /// Which fields differ between two snapshots of the same record.
    pub fn changed_fields(before: &RolloutRecord, after: &RolloutRecord) -> Vec<RecordField> {
        let mut fields = Vec::new();
        if before.state != after.state {
            fields.push(RecordField::State);
        }
        if before.clock != after.clock {
            fields.push(RecordField::Clock);
        }
        if before.desired_replicas != after.desired_replicas
            || before.from_ref != after.from_ref
            || before.to_ref != after.to_ref
            || before.autopaused != after.autopaused
        {
            fields.push(RecordField::Refs);
        }
        if before.from_pods != after.from_pods || before.to_pods != after.to_pods {
            fields.push(RecordField::Pods);
        }
        if before.log.len() != after.log.len() {
            fields.push(RecordField::Log);
        }
        fields
    }
}

/// Field groups reported by change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Created,
    State,
    Clock,
    Refs,
    Pods,
    Log,
}

/// A committed change to one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: RecordKey,
    pub fields: Vec<RecordField>,
    /// Snapshot of the record after the change.
    pub record: RolloutRecord,
}

impl ChangeEvent {
    pub fn touches(&self, field: RecordField) -> bool {
        self.fields.contains(&field)
    }
}

pub(crate) fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
