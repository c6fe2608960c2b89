//! Shared fixtures: a scripted target adapter, a static image repository,
//! and a recording notification sink.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use helmsman_core::{EngineSettings, RecordKey, WorkloadKind};
use helmsman_rollout::*;
use helmsman_state::{PodPhase, PodSummary, RecordStore, RolloutRecord, RolloutState, Severity};

// ── Target adapter ─────────────────────────────────────────────────

pub const PREDECESSOR: &str = "api-live";

#[derive(Default)]
struct TargetState {
    live: Option<LiveWorkload>,
    spec_replicas: Option<u32>,
    without_identity: bool,
    fail_rollback: bool,

    successor: VecDeque<TargetStatus>,
    predecessor: VecDeque<TargetStatus>,
    successor_samples: usize,

    submitted: Vec<TargetSpec>,
    suspended: Vec<String>,
    deleted: Vec<String>,
    rollbacks: Vec<(String, String)>,
    gone: HashSet<String>,
}

/// A target whose status readings follow a script.
///
/// Each `status` call pops the next entry; the last entry repeats.
#[derive(Default)]
pub struct ScriptedTarget {
    state: Mutex<TargetState>,
    watchers: Mutex<Vec<mpsc::Sender<TargetEvent>>>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live predecessor `api-live` with `replicas` replicas.
    pub fn with_predecessor(self, replicas: u32) -> Self {
        self.state.lock().unwrap().live = Some(LiveWorkload {
            current: Incarnation {
                reference: PREDECESSOR.to_string(),
                revision: "rev-0".to_string(),
                created_at: 0,
            },
            replicas,
        });
        self
    }

    pub fn with_spec_replicas(self, replicas: u32) -> Self {
        self.state.lock().unwrap().spec_replicas = Some(replicas);
        self
    }

    /// Submissions never get a stable identity.
    pub fn without_identity(self) -> Self {
        self.state.lock().unwrap().without_identity = true;
        self
    }

    pub fn failing_rollback(self) -> Self {
        self.state.lock().unwrap().fail_rollback = true;
        self
    }

    pub fn script_successor(&self, statuses: Vec<TargetStatus>) {
        self.state.lock().unwrap().successor = statuses.into();
    }

    pub fn script_predecessor(&self, statuses: Vec<TargetStatus>) {
        self.state.lock().unwrap().predecessor = statuses.into();
    }

    pub fn successor_samples(&self) -> usize {
        self.state.lock().unwrap().successor_samples
    }

    pub fn submitted(&self) -> Vec<TargetSpec> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn suspended(&self) -> Vec<String> {
        self.state.lock().unwrap().suspended.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn rollbacks(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().rollbacks.clone()
    }

    /// Delete an incarnation behind the engine's back.
    pub fn delete_out_of_band(&self, reference: &str) {
        self.state.lock().unwrap().gone.insert(reference.to_string());
        self.notify(TargetEvent::Deleted(reference.to_string()));
    }

    fn notify(&self, event: TargetEvent) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn next(script: &mut VecDeque<TargetStatus>) -> TargetStatus {
        if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        }
    }
}

fn ready<T: Send + 'static>(value: Result<T, AdapterError>) -> AdapterFuture<'static, T> {
    Box::pin(async move { value })
}

impl TargetAdapter for ScriptedTarget {
    fn render_spec<'a>(&'a self, record: &'a RolloutRecord) -> AdapterFuture<'a, TargetSpec> {
        let state = self.state.lock().unwrap();
        let revision = format!("rev-{}", state.submitted.len() + 1);
        ready(Ok(TargetSpec {
            env: record.env.clone(),
            workload: record.workload.clone(),
            kind: record.kind,
            image: format!("registry.local/{}:{}", record.workload, record.tag),
            revision,
            replicas: state.spec_replicas,
            policy: record.policy.clone().unwrap_or_default(),
            body: serde_json::json!({ "tag": record.tag }),
        }))
    }

    fn submit<'a>(&'a self, env: &'a str, spec: &'a TargetSpec) -> AdapterFuture<'a, Submission> {
        self.state.lock().unwrap().submitted.push(spec.clone());
        ready(Ok(Submission {
            parent_ref: format!("{env}/{}", spec.workload),
            revision: spec.revision.clone(),
        }))
    }

    fn describe<'a>(
        &'a self,
        _env: &'a str,
        _workload: &'a str,
    ) -> AdapterFuture<'a, Option<LiveWorkload>> {
        ready(Ok(self.state.lock().unwrap().live.clone()))
    }

    fn status<'a>(&'a self, _env: &'a str, reference: &'a str) -> AdapterFuture<'a, TargetStatus> {
        let mut state = self.state.lock().unwrap();
        if state.gone.contains(reference) {
            return ready(Err(AdapterError::NotFound(reference.to_string())));
        }
        let status = if reference == PREDECESSOR {
            Self::next(&mut state.predecessor)
        } else {
            state.successor_samples += 1;
            Self::next(&mut state.successor)
        };
        ready(Ok(status))
    }

    fn list_children<'a>(
        &'a self,
        _env: &'a str,
        _parent_ref: &'a str,
    ) -> AdapterFuture<'a, Vec<Incarnation>> {
        let state = self.state.lock().unwrap();
        if state.without_identity {
            return ready(Ok(Vec::new()));
        }
        let children = state
            .submitted
            .iter()
            .map(|spec| Incarnation {
                reference: successor_ref(&spec.revision),
                revision: spec.revision.clone(),
                created_at: 0,
            })
            .collect();
        ready(Ok(children))
    }

    fn watch<'a>(&'a self, _env: &'a str, _selector: Selector) -> AdapterFuture<'a, TargetWatch> {
        let (tx, rx) = mpsc::channel(16);
        self.watchers.lock().unwrap().push(tx);
        ready(Ok(rx))
    }

    fn suspend<'a>(&'a self, _env: &'a str, workload: &'a str) -> AdapterFuture<'a, ()> {
        self.state.lock().unwrap().suspended.push(workload.to_string());
        ready(Ok(()))
    }

    fn delete<'a>(&'a self, _env: &'a str, reference: &'a str) -> AdapterFuture<'a, ()> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(reference.to_string());
        state.gone.insert(reference.to_string());
        ready(Ok(()))
    }

    fn rollback_to<'a>(
        &'a self,
        _env: &'a str,
        workload: &'a str,
        prior_ref: &'a str,
    ) -> AdapterFuture<'a, ()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_rollback {
            return ready(Err(AdapterError::Backend("orchestrator refused".to_string())));
        }
        state
            .rollbacks
            .push((workload.to_string(), prior_ref.to_string()));
        ready(Ok(()))
    }
}

/// Reference the scripted target gives the incarnation of `revision`.
pub fn successor_ref(revision: &str) -> String {
    format!("api-{revision}")
}

/// A status with `ready` of `running` pods ready.
pub fn status(ready: u32, running: u32) -> TargetStatus {
    TargetStatus {
        ready,
        running,
        outcome: None,
        pods: (0..running)
            .map(|i| PodSummary {
                name: format!("pod-{i}"),
                created_at: 0,
                phase: PodPhase::Running,
                ready: i < ready,
                host: None,
            })
            .collect(),
    }
}

pub fn finished(outcome: RunOutcome) -> TargetStatus {
    TargetStatus {
        outcome: Some(outcome),
        ..TargetStatus::default()
    }
}

// ── Image repository ───────────────────────────────────────────────

pub struct StaticImages {
    tags: HashMap<(String, String, String), String>,
}

impl StaticImages {
    pub fn with(entries: &[(&str, &str, &str)]) -> Self {
        let tags = entries
            .iter()
            .map(|(workload, branch, tag)| {
                (
                    (workload.to_string(), branch.to_string(), tag.to_string()),
                    format!("sha256:{workload}-{tag}"),
                )
            })
            .collect();
        Self { tags }
    }
}

impl ImageRepository for StaticImages {
    fn resolve_tag<'a>(
        &'a self,
        workload: &'a str,
        branch: &'a str,
        tag: &'a str,
    ) -> AdapterFuture<'a, Option<String>> {
        let key = (workload.to_string(), branch.to_string(), tag.to_string());
        ready(Ok(self.tags.get(&key).cloned()))
    }
}

// ── Notification sink ──────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    posts: Mutex<Vec<(String, Severity)>>,
}

impl RecordingSink {
    pub fn posts(&self) -> Vec<(String, Severity)> {
        self.posts.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn post<'a>(
        &'a self,
        message: &'a str,
        severity: Severity,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        self.posts.lock().unwrap().push((message.to_string(), severity));
        Box::pin(async {})
    }
}

// ── Harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: Engine,
    pub target: Arc<ScriptedTarget>,
    pub sink: Arc<RecordingSink>,
    pub store: RecordStore,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        lock_ttl: Duration::from_secs(6 * 3600),
        poll_interval: Duration::from_secs(1),
        init_timeout: Duration::from_secs(5),
        service_ceiling: Duration::from_secs(60),
        job_ceiling: Duration::from_secs(60),
        adhoc_ceiling: Duration::from_secs(60),
    }
}

pub fn harness(target: ScriptedTarget) -> Harness {
    harness_with(target, settings())
}

pub fn harness_with(target: ScriptedTarget, settings: EngineSettings) -> Harness {
    let store = RecordStore::open_in_memory().unwrap();
    let target = Arc::new(target);
    let sink = Arc::new(RecordingSink::default());
    let images = Arc::new(StaticImages::with(&[
        ("api", "main", "v41"),
        ("api", "main", "v42"),
    ]));
    let mut builder = Engine::builder(store.clone(), images)
        .sink(sink.clone())
        .settings(settings);
    for kind in [WorkloadKind::Service, WorkloadKind::Job, WorkloadKind::AdHoc] {
        builder = builder.adapter(kind, target.clone());
    }
    Harness {
        engine: builder.build().unwrap(),
        target,
        sink,
        store,
    }
}

pub fn request(kind: WorkloadKind, tag: &str) -> StartRequest {
    StartRequest {
        env: "prod".to_string(),
        workload: "api".to_string(),
        kind,
        branch: "main".to_string(),
        tag: tag.to_string(),
        requested_by: "alice".to_string(),
        policy: None,
        trigger: None,
    }
}

/// Poll until the record reaches `state`.
pub async fn wait_for_state(engine: &Engine, key: &RecordKey, state: RolloutState) -> RolloutRecord {
    for _ in 0..600 {
        let record = engine.get(key).unwrap();
        if record.state == state {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{key} never reached {state}");
}

/// Poll until no episode holds a lock.
pub async fn wait_until_idle(engine: &Engine) {
    for _ in 0..600 {
        if engine.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("episodes still in flight");
}

pub fn has_log(record: &RolloutRecord, severity: Severity, needle: &str) -> bool {
    record
        .log
        .iter()
        .any(|entry| entry.severity == severity && entry.message.contains(needle))
}
