//! Command dispatcher: the engine's public surface.
//!
//! Commands validate against the state machine before touching anything.
//! Commands that enter a supervised state (`trigger`, `resume`,
//! `rollback`) take the workload's lock first; a busy lock is returned to
//! the caller as `Conflict` and nothing is started. `pause` and
//! `terminate` only write the record's state and never need the lock;
//! a running monitor picks the change up at its next ping.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use helmsman_core::{humanize, EngineSettings, RecordKey, WorkloadKind, WorkloadRef};
use helmsman_state::{
    ChangeEvent, RecordStore, RolloutPolicy, RolloutRecord, RolloutState, Severity, WatchFilter,
};

use crate::adapter::{AdapterError, ImageRepository, NotificationSink, TargetAdapter};
use crate::error::{RolloutError, RolloutResult};
use crate::journal::Journal;
use crate::lock::{random_hex, LockManager};
use crate::machine::{self, Command};
use crate::monitor::{Episode, EpisodeDeps};
use crate::relay;
use crate::shutdown::Shutdown;

/// How a supervising command waits for its episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Return once the lock is held and the successor has a stable identity.
    #[default]
    Detached,
    /// Return when the episode ends.
    Wait,
}

/// Parameters for `Engine::start`.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub env: String,
    pub workload: String,
    pub kind: WorkloadKind,
    pub branch: String,
    pub tag: String,
    pub requested_by: String,
    pub policy: Option<RolloutPolicy>,
    /// Trigger right after creation.
    pub trigger: Option<RunMode>,
}

pub struct EngineBuilder {
    store: RecordStore,
    images: Arc<dyn ImageRepository>,
    adapters: HashMap<WorkloadKind, Arc<dyn TargetAdapter>>,
    sink: Option<Arc<dyn NotificationSink>>,
    settings: EngineSettings,
}

impl EngineBuilder {
    /// Register the adapter that drives workloads of `kind`.
    pub fn adapter(mut self, kind: WorkloadKind, adapter: Arc<dyn TargetAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fails if the settings would let a lease expire under a live episode.
    pub fn build(self) -> RolloutResult<Engine> {
        self.settings
            .validate()
            .map_err(|e| RolloutError::Validation(e.to_string()))?;
        let shutdown = Shutdown::new();
        let locks = LockManager::new(self.store.clone(), self.settings.lock_ttl, shutdown.clone());
        let journal = Journal::new(self.store.clone(), self.sink);
        Ok(Engine {
            inner: Arc::new(EngineInner {
                store: self.store,
                locks,
                journal,
                adapters: self.adapters,
                images: self.images,
                settings: self.settings,
                shutdown,
            }),
        })
    }
}

struct EngineInner {
    store: RecordStore,
    locks: LockManager,
    journal: Journal,
    adapters: HashMap<WorkloadKind, Arc<dyn TargetAdapter>>,
    images: Arc<dyn ImageRepository>,
    settings: EngineSettings,
    shutdown: Shutdown,
}

/// The rollout engine. Cheap to clone; clones share one lock table,
/// store, and shutdown barrier.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(store: RecordStore, images: Arc<dyn ImageRepository>) -> EngineBuilder {
        EngineBuilder {
            store,
            images,
            adapters: HashMap::new(),
            sink: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Create a record in `New` for a known image tag.
    pub async fn start(&self, req: StartRequest) -> RolloutResult<RolloutRecord> {
        for (field, value) in [
            ("env", &req.env),
            ("workload", &req.workload),
            ("branch", &req.branch),
            ("tag", &req.tag),
            ("requested_by", &req.requested_by),
        ] {
            if value.trim().is_empty() {
                return Err(RolloutError::Validation(format!("{field} is required")));
            }
        }
        if let Some(policy) = &req.policy {
            if policy.step == 0 {
                return Err(RolloutError::Validation(
                    "policy step must be at least 1".to_string(),
                ));
            }
        }
        let adapter = self.adapter(req.kind)?;

        let digest = match self
            .inner
            .images
            .resolve_tag(&req.workload, &req.branch, &req.tag)
            .await
        {
            Ok(Some(digest)) => digest,
            Ok(None) | Err(AdapterError::NotFound(_)) => {
                return Err(RolloutError::Validation(format!(
                    "unknown tag {} on branch {} for {}",
                    req.tag, req.branch, req.workload
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let live = adapter.describe(&req.env, &req.workload).await?;

        let key = RecordKey::new(req.env.clone(), req.workload.clone(), random_hex(8)?);
        let mut record =
            RolloutRecord::new(&key, req.kind, &req.branch, &req.tag, &req.requested_by);
        record.digest = Some(digest);
        record.policy = req.policy.clone();
        let predecessor = match &live {
            Some(live) => {
                record.desired_replicas = live.replicas;
                record.from_ref = Some(live.current.reference.clone());
                format!(
                    "predecessor {} with {} replicas",
                    live.current.reference, live.replicas
                )
            }
            None => "no live predecessor".to_string(),
        };
        let message = format!(
            "{} {} of {} ({}) created by {}; {predecessor}",
            req.kind, key.id, req.tag, req.branch, req.requested_by
        );
        record.push_log(Severity::Debug, message.clone());
        self.inner.store.create(&record)?;
        self.inner.journal.emit(&key, Severity::Debug, &message).await;

        match req.trigger {
            Some(mode) => self.trigger(&key, mode).await,
            None => Ok(record),
        }
    }

    /// `New → Running`: take the lock and spawn the monitor.
    pub async fn trigger(&self, key: &RecordKey, mode: RunMode) -> RolloutResult<RolloutRecord> {
        self.supervise(key, Command::Start, Severity::Info, mode).await
    }

    /// `Paused → Running`: supervise again with a fresh successor.
    pub async fn resume(&self, key: &RecordKey, mode: RunMode) -> RolloutResult<RolloutRecord> {
        self.supervise(key, Command::Resume, Severity::Warn, mode).await
    }

    /// Ask a running episode to pause. A second pause forces `Paused`.
    pub async fn pause(&self, key: &RecordKey) -> RolloutResult<RolloutRecord> {
        let record = self
            .inner
            .journal
            .transition(key, Command::Pause, Severity::Warn, |r| {
                if r.state == RolloutState::Pausing {
                    "pause forced without waiting for the monitor".to_string()
                } else {
                    "pause requested; supervision stops at its next check".to_string()
                }
            })
            .await?;

        if record.state == RolloutState::Paused {
            let adapter = self.adapter(record.kind)?;
            if let Err(e) = adapter.suspend(&key.env, &key.workload).await {
                self.inner
                    .journal
                    .log(key, Severity::Warn, format!("could not suspend target: {e}"))
                    .await?;
            }
        }
        Ok(record)
    }

    /// Ask a running run-style episode to stop. A second terminate forces `Terminated`.
    pub async fn terminate(&self, key: &RecordKey) -> RolloutResult<RolloutRecord> {
        let record = self
            .inner
            .journal
            .transition(key, Command::Terminate, Severity::Warn, |r| {
                if r.state == RolloutState::Terminating {
                    "termination forced without waiting for the monitor".to_string()
                } else {
                    "termination requested; supervision stops at its next check".to_string()
                }
            })
            .await?;

        if record.state == RolloutState::Terminated {
            if let Some(successor) = &record.to_ref {
                let adapter = self.adapter(record.kind)?;
                if let Err(e) = adapter.delete(&key.env, successor).await {
                    self.inner
                        .journal
                        .log(key, Severity::Warn, format!("could not delete {successor}: {e}"))
                        .await?;
                }
            }
        }
        Ok(record)
    }

    /// Restore the predecessor incarnation.
    ///
    /// Runs inline under the workload's lock. If the adapter fails the
    /// record lands in `Paused` so the rollback can be retried.
    pub async fn rollback(&self, key: &RecordKey) -> RolloutResult<RolloutRecord> {
        let record = self.get(key)?;
        machine::transition(record.kind, record.state, Command::Rollback)?;
        let prior = record.from_ref.clone().ok_or_else(|| {
            RolloutError::Validation(format!("{key} has no predecessor to roll back to"))
        })?;
        let adapter = self.adapter(record.kind)?;
        let guard = self
            .inner
            .locks
            .acquire_or_conflict(&key.workload_ref(), &key.id)?;

        let journal = &self.inner.journal;
        journal
            .transition(key, Command::Rollback, Severity::Warn, |_| {
                format!("rolling back to {prior}")
            })
            .await?;

        let result = match adapter.rollback_to(&key.env, &key.workload, &prior).await {
            Ok(()) => {
                journal
                    .transition(key, Command::FinishRollback, Severity::Warn, |_| {
                        format!("rolled back to {prior}")
                    })
                    .await
            }
            Err(e) => {
                let message = format!("rollback to {prior} failed: {e}");
                match journal
                    .transition(key, Command::Stall, Severity::Error, |_| message)
                    .await
                {
                    Ok(_) => Err(e.into()),
                    Err(write) => Err(write),
                }
            }
        };

        if let Err(e) = guard.release() {
            error!(%key, error = %e, "failed to release rollback lock");
        }
        result
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, key: &RecordKey) -> RolloutResult<RolloutRecord> {
        self.inner
            .store
            .get(key)?
            .ok_or_else(|| RolloutError::NotFound(key.to_string()))
    }

    /// All records of a workload, newest first.
    pub fn list(&self, env: &str, workload: &str) -> RolloutResult<Vec<RolloutRecord>> {
        Ok(self
            .inner
            .store
            .list_for_workload(&WorkloadRef::new(env, workload))?)
    }

    /// Every record in the store, newest first.
    pub fn list_all(&self) -> RolloutResult<Vec<RolloutRecord>> {
        Ok(self.inner.store.list()?)
    }

    /// Push stream of changes to one record.
    pub fn watch_record(&self, key: &RecordKey) -> RolloutResult<mpsc::Receiver<ChangeEvent>> {
        self.get(key)?;
        Ok(relay::spawn(
            self.inner.store.subscribe(WatchFilter::Record(key.clone())),
            self.inner.shutdown.subscribe(),
        ))
    }

    /// Push stream of changes to every record of a workload.
    pub fn watch_workload(&self, env: &str, workload: &str) -> mpsc::Receiver<ChangeEvent> {
        relay::spawn(
            self.inner
                .store
                .subscribe(WatchFilter::Workload(WorkloadRef::new(env, workload))),
            self.inner.shutdown.subscribe(),
        )
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Signal every episode to stop and wait until all have released their locks.
    pub async fn shutdown(&self) {
        info!(in_flight = self.inner.shutdown.in_flight(), "engine shutting down");
        self.inner.shutdown.drain().await;
        info!("engine stopped");
    }

    /// Number of episodes currently holding a lock.
    pub fn in_flight(&self) -> usize {
        self.inner.shutdown.in_flight()
    }

    // ── Internals ──────────────────────────────────────────────────

    fn adapter(&self, kind: WorkloadKind) -> RolloutResult<Arc<dyn TargetAdapter>> {
        self.inner
            .adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| RolloutError::Validation(format!("no target adapter for {kind} workloads")))
    }

    async fn supervise(
        &self,
        key: &RecordKey,
        command: Command,
        severity: Severity,
        mode: RunMode,
    ) -> RolloutResult<RolloutRecord> {
        let record = self.get(key)?;
        machine::transition(record.kind, record.state, command)?;
        let adapter = self.adapter(record.kind)?;
        let guard = self
            .inner
            .locks
            .acquire_or_conflict(&key.workload_ref(), &key.id)?;

        let record = self
            .inner
            .journal
            .transition(key, command, severity, |r| match command {
                Command::Resume => format!(
                    "resumed after {} of supervision",
                    humanize(r.clock)
                ),
                _ => format!("supervision started for {} {}", r.kind, r.tag),
            })
            .await?;

        let episode = Episode::new(
            key.clone(),
            record.kind,
            guard,
            EpisodeDeps {
                store: self.inner.store.clone(),
                journal: self.inner.journal.clone(),
                adapter,
                settings: self.inner.settings.clone(),
                shutdown: self.inner.shutdown.subscribe(),
            },
        );

        match mode {
            RunMode::Detached => {
                let (ready_tx, ready_rx) = oneshot::channel();
                tokio::spawn(episode.run(Some(ready_tx)));
                match ready_rx.await {
                    Ok(Ok(())) => self.get(key),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(RolloutError::Unexpected(
                        "episode ended before reporting readiness".to_string(),
                    )),
                }
            }
            RunMode::Wait => tokio::spawn(episode.run(None))
                .await
                .map_err(|e| RolloutError::Unexpected(format!("episode task failed: {e}")))?,
        }
    }
}
