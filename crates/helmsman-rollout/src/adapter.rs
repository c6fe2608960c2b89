//! Collaborator interfaces: target adapter, image repository, notification sink.
//!
//! The engine never talks to a container orchestrator or registry
//! directly. Concrete adapters implement these traits; the engine only
//! calls them. Methods return boxed `Send` futures so adapters can be held
//! as `Arc<dyn TargetAdapter>` and called from spawned monitor tasks.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use helmsman_core::WorkloadKind;
use helmsman_state::{PodSummary, RolloutPolicy, RolloutRecord, Severity};

/// Boxed future alias for adapter calls.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AdapterError>> + Send + 'a>>;

/// Errors reported by collaborators.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The referenced workload or incarnation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Backend(String),
}

/// A concrete resource definition rendered from the workload template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub env: String,
    pub workload: String,
    pub kind: WorkloadKind,
    /// Image reference, e.g. `registry/api:v42` or a digest reference.
    pub image: String,
    /// Revision marker the orchestrator stamps on the incarnation it creates.
    pub revision: String,
    /// Replica count declared by the template, if any.
    pub replicas: Option<u32>,
    pub policy: RolloutPolicy,
    /// Rendered definition, opaque to the engine.
    pub body: serde_json::Value,
}

/// Acknowledgement of a create-or-replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// The parent resource (deployment, job) that owns incarnations.
    pub parent_ref: String,
    /// Revision of the submitted spec.
    pub revision: String,
}

/// One materialized version of a workload's spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incarnation {
    pub reference: String,
    pub revision: String,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

/// The currently live incarnation of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveWorkload {
    pub current: Incarnation,
    pub replicas: u32,
}

/// Terminal outcome of a single-run unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
}

/// Sampled status of one incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TargetStatus {
    pub ready: u32,
    pub running: u32,
    /// Set only for single-run units that have finished.
    pub outcome: Option<RunOutcome>,
    pub pods: Vec<PodSummary>,
}

impl TargetStatus {
    /// Status of an incarnation that no longer exists.
    pub fn drained() -> Self {
        Self::default()
    }
}

/// What a target watch observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Workload(String),
    Incarnation(String),
}

/// An event from a target watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Changed(String),
    Deleted(String),
}

/// Receiving end of a target watch. Dropping it detaches the watch.
pub type TargetWatch = mpsc::Receiver<TargetEvent>;

/// Uniform operations over one workload kind.
pub trait TargetAdapter: Send + Sync {
    /// Render the workload template for the record's branch and tag.
    fn render_spec<'a>(&'a self, record: &'a RolloutRecord) -> AdapterFuture<'a, TargetSpec>;

    /// Create the workload if absent, else replace its spec.
    fn submit<'a>(&'a self, env: &'a str, spec: &'a TargetSpec) -> AdapterFuture<'a, Submission>;

    /// The live incarnation of a workload, if it exists.
    fn describe<'a>(
        &'a self,
        env: &'a str,
        workload: &'a str,
    ) -> AdapterFuture<'a, Option<LiveWorkload>>;

    /// Sample an incarnation. `NotFound` if it has been deleted.
    fn status<'a>(&'a self, env: &'a str, reference: &'a str) -> AdapterFuture<'a, TargetStatus>;

    /// Incarnations owned by a parent resource.
    fn list_children<'a>(
        &'a self,
        env: &'a str,
        parent_ref: &'a str,
    ) -> AdapterFuture<'a, Vec<Incarnation>>;

    fn watch<'a>(&'a self, env: &'a str, selector: Selector) -> AdapterFuture<'a, TargetWatch>;

    /// Pause or suspend the workload so it stops progressing.
    fn suspend<'a>(&'a self, env: &'a str, workload: &'a str) -> AdapterFuture<'a, ()>;

    fn delete<'a>(&'a self, env: &'a str, reference: &'a str) -> AdapterFuture<'a, ()>;

    /// Restore the workload to a prior incarnation.
    fn rollback_to<'a>(
        &'a self,
        env: &'a str,
        workload: &'a str,
        prior_ref: &'a str,
    ) -> AdapterFuture<'a, ()>;
}

/// Image tag lookup.
pub trait ImageRepository: Send + Sync {
    /// Resolve a tag on a branch to an image digest. `None` if unknown.
    fn resolve_tag<'a>(
        &'a self,
        workload: &'a str,
        branch: &'a str,
        tag: &'a str,
    ) -> AdapterFuture<'a, Option<String>>;
}

/// Receives record log lines for audit and alerting.
pub trait NotificationSink: Send + Sync {
    fn post<'a>(
        &'a self,
        message: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}
