//! Simulated orchestrator: an in-process stand-in for a real cluster.
//!
//! Service incarnations surge `step` replicas per status read while the
//! predecessor drains by the same amount; `Recreate` drains the
//! predecessor at submission. Run incarnations finish after a fixed
//! number of reads, and a tag containing `fail` makes them fail.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::debug;

use helmsman_core::config::WorkloadConfig;
use helmsman_core::{WorkloadKind, WorkloadRef};
use helmsman_rollout::{
    AdapterError, AdapterFuture, Incarnation, LiveWorkload, RunOutcome, Selector, Submission,
    TargetAdapter, TargetEvent, TargetSpec, TargetStatus, TargetWatch,
};
use helmsman_state::{PodPhase, PodSummary, RolloutRecord, RolloutStrategy};

/// Status reads before a run incarnation reports its outcome.
const RUN_READS: u32 = 3;

const WATCH_CAPACITY: usize = 32;

struct SimIncarnation {
    workload: WorkloadRef,
    revision: String,
    created_at: u64,
    kind: WorkloadKind,
    target: u32,
    step: u32,
    ready: u32,
    running: u32,
    reads: u32,
    fails: bool,
    outcome: Option<RunOutcome>,
}

#[derive(Default)]
struct SimWorkload {
    replicas: u32,
    /// Incarnation currently serving.
    current: Option<String>,
    /// Most recent submission, if it has not been promoted yet.
    latest: Option<String>,
    submissions: u32,
    suspended: bool,
}

#[derive(Default)]
struct SimState {
    workloads: HashMap<WorkloadRef, SimWorkload>,
    incarnations: HashMap<String, SimIncarnation>,
    watchers: Vec<(String, mpsc::Sender<TargetEvent>)>,
}

impl SimState {
    fn notify(&mut self, key: &str, event: TargetEvent) {
        self.watchers.retain(|(watched, tx)| {
            if watched != key {
                return !tx.is_closed();
            }
            // A full watcher only misses an acceleration hint; polling continues.
            !matches!(tx.try_send(event.clone()), Err(mpsc::error::TrySendError::Closed(_)))
        });
    }

    fn remove(&mut self, reference: &str) {
        if let Some(inc) = self.incarnations.remove(reference) {
            if let Some(workload) = self.workloads.get_mut(&inc.workload) {
                if workload.current.as_deref() == Some(reference) {
                    workload.current = None;
                }
                if workload.latest.as_deref() == Some(reference) {
                    workload.latest = None;
                }
            }
            self.notify(reference, TargetEvent::Deleted(reference.to_string()));
            self.notify(&inc.workload.workload, TargetEvent::Deleted(reference.to_string()));
        }
    }

    /// Advance the successor one step and drain the predecessor to match.
    fn advance(&mut self, reference: &str) {
        let Some(inc) = self.incarnations.get_mut(reference) else {
            return;
        };
        let workload_ref = inc.workload.clone();
        let Some(workload) = self.workloads.get_mut(&workload_ref) else {
            return;
        };
        if workload.suspended || workload.latest.as_deref() != Some(reference) {
            return;
        }

        if inc.kind.is_run() {
            inc.reads += 1;
            inc.running = 1;
            if inc.reads >= RUN_READS {
                inc.running = 0;
                inc.outcome = Some(if inc.fails {
                    RunOutcome::Failed("exit code 1".to_string())
                } else {
                    RunOutcome::Succeeded
                });
                workload.latest = None;
            }
            return;
        }

        inc.ready = (inc.ready + inc.step).min(inc.target);
        inc.running = inc.ready;
        let ready = inc.ready;
        let converged = ready == inc.target;

        let predecessor = workload.current.clone().filter(|current| current != reference);
        if converged {
            workload.current = Some(reference.to_string());
            workload.latest = None;
        }
        if let Some(pred) = predecessor.as_ref() {
            if let Some(pred) = self.incarnations.get_mut(pred) {
                pred.running = pred.target.saturating_sub(ready);
                pred.ready = pred.ready.min(pred.running);
            }
        }
        debug!(%reference, ready, converged, "simulated surge");
        self.notify(reference, TargetEvent::Changed(reference.to_string()));
    }
}

pub struct SimulatedOrchestrator {
    state: Mutex<SimState>,
}

impl SimulatedOrchestrator {
    /// Seed one fully-ready incarnation per configured workload.
    pub fn from_config(workloads: &[WorkloadConfig]) -> Self {
        let mut state = SimState::default();
        for seed in workloads {
            let workload_ref = WorkloadRef::new(seed.env.clone(), seed.name.clone());
            let reference = format!("{}-live", seed.name);
            let replicas = if seed.kind.is_run() { 0 } else { seed.replicas };
            state.incarnations.insert(
                reference.clone(),
                SimIncarnation {
                    workload: workload_ref.clone(),
                    revision: format!("seed-{}", seed.tag),
                    created_at: now_secs(),
                    kind: seed.kind,
                    target: replicas,
                    step: 1,
                    ready: replicas,
                    running: replicas,
                    reads: 0,
                    fails: false,
                    outcome: None,
                },
            );
            state.workloads.insert(
                workload_ref,
                SimWorkload {
                    replicas,
                    current: Some(reference),
                    ..SimWorkload::default()
                },
            );
        }
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn done<T: Send + 'static>(value: Result<T, AdapterError>) -> AdapterFuture<'static, T> {
    Box::pin(async move { value })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn pods(reference: &str, inc: &SimIncarnation) -> Vec<PodSummary> {
    let phase = match (&inc.outcome, inc.kind.is_run()) {
        (Some(RunOutcome::Succeeded), _) => PodPhase::Succeeded,
        (Some(RunOutcome::Failed(_)), _) => PodPhase::Failed,
        (None, true) if inc.reads == 0 => PodPhase::Pending,
        _ => PodPhase::Running,
    };
    let count = if inc.outcome.is_some() { 1 } else { inc.running };
    (0..count)
        .map(|i| PodSummary {
            name: format!("{reference}-{i}"),
            created_at: inc.created_at,
            phase,
            ready: i < inc.ready,
            host: Some(format!("sim-node-{}", i % 3)),
        })
        .collect()
}

impl TargetAdapter for SimulatedOrchestrator {
    fn render_spec<'a>(&'a self, record: &'a RolloutRecord) -> AdapterFuture<'a, TargetSpec> {
        let state = self.lock();
        let workload = state.workloads.get(&record.workload_ref());
        let submissions = workload.map_or(0, |w| w.submissions);
        let replicas = match (record.kind.is_run(), record.desired_replicas) {
            (true, _) => 1,
            (false, 0) => workload.map_or(1, |w| w.replicas.max(1)),
            (false, desired) => desired,
        };
        done(Ok(TargetSpec {
            env: record.env.clone(),
            workload: record.workload.clone(),
            kind: record.kind,
            image: format!("{}:{}", record.workload, record.tag),
            revision: format!("{}-r{}", record.id, submissions + 1),
            replicas: Some(replicas),
            policy: record.policy.clone().unwrap_or_default(),
            body: serde_json::json!({
                "branch": record.branch,
                "tag": record.tag,
                "digest": record.digest,
                "requested_by": record.requested_by,
            }),
        }))
    }

    fn submit<'a>(&'a self, env: &'a str, spec: &'a TargetSpec) -> AdapterFuture<'a, Submission> {
        let mut state = self.lock();
        let workload_ref = WorkloadRef::new(env, spec.workload.clone());
        let target = spec.replicas.unwrap_or(1);
        let reference = format!("{}-{}", spec.workload, spec.revision);

        let workload = state.workloads.entry(workload_ref.clone()).or_default();
        workload.submissions += 1;
        workload.suspended = false;
        workload.replicas = target;
        let superseded = workload.latest.replace(reference.clone());
        let current = workload.current.clone();

        if let Some(old) = superseded {
            state.remove(&old);
        }
        if spec.policy.strategy == RolloutStrategy::Recreate {
            if let Some(pred) = current.as_ref() {
                if let Some(pred) = state.incarnations.get_mut(pred) {
                    pred.running = 0;
                    pred.ready = 0;
                }
            }
        }

        state.incarnations.insert(
            reference.clone(),
            SimIncarnation {
                workload: workload_ref,
                revision: spec.revision.clone(),
                created_at: now_secs(),
                kind: spec.kind,
                target,
                step: spec.policy.step.max(1),
                ready: 0,
                running: 0,
                reads: 0,
                fails: spec.image.contains("fail"),
                outcome: None,
            },
        );
        debug!(%reference, target, "simulated submission");

        done(Ok(Submission {
            parent_ref: format!("{env}/{}", spec.workload),
            revision: spec.revision.clone(),
        }))
    }

    fn describe<'a>(
        &'a self,
        env: &'a str,
        workload: &'a str,
    ) -> AdapterFuture<'a, Option<LiveWorkload>> {
        let state = self.lock();
        let live = state
            .workloads
            .get(&WorkloadRef::new(env, workload))
            .and_then(|w| w.current.as_ref())
            .and_then(|reference| {
                state.incarnations.get(reference).map(|inc| LiveWorkload {
                    current: Incarnation {
                        reference: reference.clone(),
                        revision: inc.revision.clone(),
                        created_at: inc.created_at,
                    },
                    replicas: inc.target,
                })
            });
        done(Ok(live))
    }

    fn status<'a>(&'a self, _env: &'a str, reference: &'a str) -> AdapterFuture<'a, TargetStatus> {
        let mut state = self.lock();
        state.advance(reference);
        let status = match state.incarnations.get(reference) {
            Some(inc) => Ok(TargetStatus {
                ready: inc.ready,
                running: inc.running,
                outcome: inc.outcome.clone(),
                pods: pods(reference, inc),
            }),
            None => Err(AdapterError::NotFound(reference.to_string())),
        };
        done(status)
    }

    fn list_children<'a>(
        &'a self,
        _env: &'a str,
        parent_ref: &'a str,
    ) -> AdapterFuture<'a, Vec<Incarnation>> {
        let state = self.lock();
        let children = state
            .incarnations
            .iter()
            .filter(|(_, inc)| inc.workload.table_key() == parent_ref)
            .map(|(reference, inc)| Incarnation {
                reference: reference.clone(),
                revision: inc.revision.clone(),
                created_at: inc.created_at,
            })
            .collect();
        done(Ok(children))
    }

    fn watch<'a>(&'a self, _env: &'a str, selector: Selector) -> AdapterFuture<'a, TargetWatch> {
        let key = match selector {
            Selector::Workload(name) | Selector::Incarnation(name) => name,
        };
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        self.lock().watchers.push((key, tx));
        done(Ok(rx))
    }

    fn suspend<'a>(&'a self, env: &'a str, workload: &'a str) -> AdapterFuture<'a, ()> {
        let mut state = self.lock();
        match state.workloads.get_mut(&WorkloadRef::new(env, workload)) {
            Some(w) => {
                w.suspended = true;
                done(Ok(()))
            }
            None => done(Err(AdapterError::NotFound(format!("{env}/{workload}")))),
        }
    }

    fn delete<'a>(&'a self, _env: &'a str, reference: &'a str) -> AdapterFuture<'a, ()> {
        let mut state = self.lock();
        if !state.incarnations.contains_key(reference) {
            return done(Err(AdapterError::NotFound(reference.to_string())));
        }
        state.remove(reference);
        done(Ok(()))
    }

    fn rollback_to<'a>(
        &'a self,
        env: &'a str,
        workload: &'a str,
        prior_ref: &'a str,
    ) -> AdapterFuture<'a, ()> {
        let mut state = self.lock();
        let workload_ref = WorkloadRef::new(env, workload);
        let Some(prior) = state.incarnations.get_mut(prior_ref) else {
            return done(Err(AdapterError::NotFound(prior_ref.to_string())));
        };
        prior.ready = prior.target;
        prior.running = prior.target;

        let newer: Vec<String> = state
            .incarnations
            .iter()
            .filter(|(reference, inc)| inc.workload == workload_ref && *reference != prior_ref)
            .map(|(reference, _)| reference.clone())
            .collect();
        for reference in newer {
            state.remove(&reference);
        }
        if let Some(w) = state.workloads.get_mut(&workload_ref) {
            w.current = Some(prior_ref.to_string());
            w.latest = None;
            w.suspended = false;
        }
        done(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SimulatedOrchestrator {
        SimulatedOrchestrator::from_config(&[WorkloadConfig {
            env: "prod".to_string(),
            name: "api".to_string(),
            kind: WorkloadKind::Service,
            replicas: 3,
            tag: "v41".to_string(),
        }])
    }

    fn spec(kind: WorkloadKind, revision: &str, image: &str) -> TargetSpec {
        TargetSpec {
            env: "prod".to_string(),
            workload: "api".to_string(),
            kind,
            image: image.to_string(),
            revision: revision.to_string(),
            replicas: Some(if kind.is_run() { 1 } else { 3 }),
            policy: Default::default(),
            body: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn seeds_live_predecessor() {
        let sim = seeded();
        let live = sim.describe("prod", "api").await.unwrap().unwrap();
        assert_eq!(live.current.reference, "api-live");
        assert_eq!(live.replicas, 3);
        assert!(sim.describe("prod", "web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn surge_drains_predecessor_and_promotes() {
        let sim = seeded();
        sim.submit("prod", &spec(WorkloadKind::Service, "r1", "api:v42"))
            .await
            .unwrap();

        let children = sim.list_children("prod", "prod/api").await.unwrap();
        assert!(children.iter().any(|c| c.reference == "api-r1"));

        let mut readings = Vec::new();
        for _ in 0..3 {
            let succ = sim.status("prod", "api-r1").await.unwrap();
            let pred = sim.status("prod", "api-live").await.unwrap();
            readings.push((succ.ready, pred.running));
        }
        assert_eq!(readings, vec![(1, 2), (2, 1), (3, 0)]);

        let live = sim.describe("prod", "api").await.unwrap().unwrap();
        assert_eq!(live.current.reference, "api-r1");
    }

    #[tokio::test]
    async fn suspended_workload_stops_surging() {
        let sim = seeded();
        sim.submit("prod", &spec(WorkloadKind::Service, "r1", "api:v42"))
            .await
            .unwrap();
        assert_eq!(sim.status("prod", "api-r1").await.unwrap().ready, 1);

        sim.suspend("prod", "api").await.unwrap();
        assert_eq!(sim.status("prod", "api-r1").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn runs_finish_after_fixed_reads() {
        let sim = SimulatedOrchestrator::from_config(&[]);
        sim.submit("prod", &spec(WorkloadKind::Job, "r1", "api:v42"))
            .await
            .unwrap();
        sim.submit("prod", &spec(WorkloadKind::Job, "r2", "api:v42-fail"))
            .await
            .unwrap();

        // r1 was superseded by r2.
        assert!(sim.status("prod", "api-r1").await.is_err());
        for _ in 0..RUN_READS - 1 {
            assert_eq!(sim.status("prod", "api-r2").await.unwrap().outcome, None);
        }
        let last = sim.status("prod", "api-r2").await.unwrap();
        assert!(matches!(last.outcome, Some(RunOutcome::Failed(_))));
        assert_eq!(last.pods[0].phase, PodPhase::Failed);
    }

    #[tokio::test]
    async fn delete_notifies_watchers() {
        let sim = seeded();
        sim.submit("prod", &spec(WorkloadKind::Job, "r1", "api:v42"))
            .await
            .unwrap();
        let mut events = sim
            .watch("prod", Selector::Incarnation("api-r1".to_string()))
            .await
            .unwrap();

        sim.delete("prod", "api-r1").await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(TargetEvent::Deleted("api-r1".to_string()))
        );
        assert!(matches!(
            sim.status("prod", "api-r1").await,
            Err(AdapterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rollback_restores_prior() {
        let sim = seeded();
        sim.submit("prod", &spec(WorkloadKind::Service, "r1", "api:v42"))
            .await
            .unwrap();
        sim.status("prod", "api-r1").await.unwrap();

        sim.rollback_to("prod", "api", "api-live").await.unwrap();

        let pred = sim.status("prod", "api-live").await.unwrap();
        assert_eq!((pred.ready, pred.running), (3, 3));
        assert!(sim.status("prod", "api-r1").await.is_err());
        assert!(sim.rollback_to("prod", "api", "api-r9").await.is_err());
    }
}
