//! Convergence monitor: one supervised episode from lock to release.
//!
//! An `Episode` is spawned once the dispatcher holds the workload's lock
//! and has moved the record to `Running`. It submits the successor spec,
//! waits for the successor to get a stable identity, then loops:
//! ping (advance the active clock, look for pause/terminate/shutdown),
//! check the wall-clock ceiling, sample the target, and decide. Every
//! exit path writes its outcome to the record and releases the lock.
//!
//! Cancellation is cooperative: commands only flip the record's state,
//! and the monitor notices at its next ping. Waits between pings are cut
//! short by state changes on the record and by target watch events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use helmsman_core::{humanize, EngineSettings, RecordKey, WorkloadKind};
use helmsman_state::{
    RecordField, RecordStore, RolloutRecord, RolloutState, Severity, Subscription, WatchFilter,
};

use crate::adapter::{
    AdapterError, Incarnation, Selector, Submission, TargetAdapter, TargetEvent, TargetStatus,
    TargetWatch,
};
use crate::convergence::{Convergence, Observation, Verdict};
use crate::error::{RolloutError, RolloutResult};
use crate::journal::Journal;
use crate::lock::LockGuard;
use crate::machine::Command;

/// Everything an episode needs from the engine.
pub(crate) struct EpisodeDeps {
    pub store: RecordStore,
    pub journal: Journal,
    pub adapter: Arc<dyn TargetAdapter>,
    pub settings: EngineSettings,
    pub shutdown: watch::Receiver<bool>,
}

/// Why the supervision loop stopped without an error.
#[derive(Debug)]
enum Halt {
    Converged,
    Succeeded,
    Failed(String),
    Checkpoint { ready: u32 },
    Shutdown,
    /// The record left `Running` underneath the monitor.
    Observed(RolloutState),
}

enum Ping {
    Continue,
    Halt(Halt),
}

enum Wake {
    Tick,
    Shutdown,
    StateChanged,
    Ignored,
    Closed,
    Target(Option<TargetEvent>),
}

pub(crate) struct Episode {
    key: RecordKey,
    kind: WorkloadKind,
    convergence: Convergence,
    store: RecordStore,
    journal: Journal,
    adapter: Arc<dyn TargetAdapter>,
    poll_interval: Duration,
    init_timeout: Duration,
    ceiling: Duration,
    shutdown: watch::Receiver<bool>,
    record_events: Subscription,
    target_events: Option<TargetWatch>,
    guard: Option<LockGuard>,

    started: Instant,
    last_ping: Instant,
    clock: Duration,

    successor: Option<Incarnation>,
    predecessor: Option<String>,
    desired: u32,
    checkpoint: Option<u32>,
    last_ready: Option<u32>,
    deleted: Option<String>,
}

impl Episode {
    pub(crate) fn new(key: RecordKey, kind: WorkloadKind, guard: LockGuard, deps: EpisodeDeps) -> Self {
        let record_events = deps.store.subscribe(WatchFilter::Record(key.clone()));
        let now = Instant::now();
        Self {
            convergence: Convergence::for_kind(kind),
            poll_interval: deps.settings.poll_interval,
            init_timeout: deps.settings.init_timeout,
            ceiling: deps.settings.ceiling(kind),
            key,
            kind,
            store: deps.store,
            journal: deps.journal,
            adapter: deps.adapter,
            shutdown: deps.shutdown,
            record_events,
            target_events: None,
            guard: Some(guard),
            started: now,
            last_ping: now,
            clock: Duration::ZERO,
            successor: None,
            predecessor: None,
            desired: 0,
            checkpoint: None,
            last_ready: None,
            deleted: None,
        }
    }

    /// Run the episode to its end.
    ///
    /// `ready`, if given, is answered once the successor has a stable
    /// identity (or with the error that prevented it).
    pub(crate) async fn run(
        mut self,
        mut ready: Option<oneshot::Sender<RolloutResult<()>>>,
    ) -> RolloutResult<RolloutRecord> {
        let outcome = match self.prepare().await {
            Ok(None) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                self.supervise().await
            }
            Ok(Some(halt)) => Ok(halt),
            Err(e) => Err(e),
        };

        let result = self.conclude(outcome).await;
        self.detach();

        if let Some(tx) = ready.take() {
            let _ = tx.send(result.as_ref().map(|_| ()).map_err(Clone::clone));
        }
        result
    }

    // ── Setup ──────────────────────────────────────────────────────

    /// Submit the successor and open its watch. Returns a halt if the
    /// episode must stop before supervision begins.
    async fn prepare(&mut self) -> RolloutResult<Option<Halt>> {
        let record = self.load()?;
        self.desired = record.desired_replicas;
        self.clock = record.clock;
        self.checkpoint = match &record.policy {
            Some(policy)
                if policy.autopause
                    && !record.autopaused
                    && self.convergence == Convergence::Service =>
            {
                Some(policy.step)
            }
            _ => None,
        };

        let spec = self.adapter.render_spec(&record).await?;
        let submission = self.adapter.submit(&self.key.env, &spec).await?;
        self.journal
            .log(
                &self.key,
                Severity::Debug,
                format!(
                    "submitted {} revision {} to {}",
                    spec.image, submission.revision, submission.parent_ref
                ),
            )
            .await?;

        let Some(successor) = self.await_identity(&submission).await? else {
            return Ok(Some(Halt::Shutdown));
        };

        let adopt = if self.desired == 0 { spec.replicas } else { None };
        let reference = successor.reference.clone();
        let created = self.store.update(&self.key, |r| {
            let created = r.to_ref.as_deref() != Some(reference.as_str());
            if created {
                r.to_ref = Some(reference.clone());
            }
            if let Some(replicas) = adopt {
                r.desired_replicas = replicas;
            }
            Ok::<_, RolloutError>(created)
        })?;
        if let Some(replicas) = adopt {
            self.desired = replicas;
        }
        if created {
            self.journal
                .log(
                    &self.key,
                    Severity::Info,
                    format!("successor {reference} created"),
                )
                .await?;
        }

        // Sampling the same incarnation as both sides would never drain.
        self.predecessor = record.from_ref.filter(|from| *from != successor.reference);

        self.target_events = match self
            .adapter
            .watch(&self.key.env, Selector::Incarnation(successor.reference.clone()))
            .await
        {
            Ok(events) => Some(events),
            Err(e) => {
                warn!(key = %self.key, error = %e, "target watch unavailable, polling only");
                None
            }
        };
        self.successor = Some(successor);
        Ok(None)
    }

    /// Wait until the orchestrator reports an incarnation for the submitted
    /// revision. `None` means shutdown was signalled first.
    async fn await_identity(
        &mut self,
        submission: &Submission,
    ) -> RolloutResult<Option<Incarnation>> {
        let init_timeout = self.init_timeout;
        let poll = self.poll_interval;
        let env = self.key.env.as_str();
        let adapter = &self.adapter;
        let shutdown = &mut self.shutdown;

        let search = async {
            loop {
                let children = adapter.list_children(env, &submission.parent_ref).await?;
                if let Some(found) = children
                    .into_iter()
                    .find(|c| c.revision == submission.revision)
                {
                    return Ok::<_, RolloutError>(found);
                }
                tokio::time::sleep(poll).await;
            }
        };

        let stop = async {
            let closed = shutdown.wait_for(|stop| *stop).await.is_err();
            if closed {
                // Engine gone without signalling; let the timeout decide.
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            found = tokio::time::timeout(init_timeout, search) => match found {
                Ok(found) => found.map(Some),
                Err(_) => Err(RolloutError::Timeout(format!(
                    "revision {} had no stable identity after {}",
                    submission.revision,
                    humanize(init_timeout)
                ))),
            },
            () = stop => Ok(None),
        }
    }

    // ── Supervision loop ───────────────────────────────────────────

    async fn supervise(&mut self) -> RolloutResult<Halt> {
        loop {
            if let Ping::Halt(halt) = self.ping()? {
                return Ok(halt);
            }

            if self.started.elapsed() > self.ceiling {
                return Err(RolloutError::Timeout(format!(
                    "not converged within {}",
                    humanize(self.ceiling)
                )));
            }

            if let Some(reference) = self.deleted.take() {
                return Err(RolloutError::Deletion(format!(
                    "{reference} was deleted out of band"
                )));
            }

            match self.sample().await? {
                Verdict::Pending => {}
                Verdict::Converged => return Ok(Halt::Converged),
                Verdict::Succeeded => return Ok(Halt::Succeeded),
                Verdict::Failed(reason) => return Ok(Halt::Failed(reason)),
                Verdict::Checkpoint { ready } => return Ok(Halt::Checkpoint { ready }),
            }

            self.wait().await;
        }
    }

    /// Advance the active clock and check for cancellation.
    fn ping(&mut self) -> RolloutResult<Ping> {
        let now = Instant::now();
        let delta = now.saturating_duration_since(self.last_ping);
        self.last_ping = now;

        let (state, clock) = self.store.update(&self.key, |r| {
            // Time up to the moment a soft stop is observed still counts.
            if matches!(
                r.state,
                RolloutState::Running | RolloutState::Pausing | RolloutState::Terminating
            ) {
                r.clock += delta;
            }
            Ok::<_, RolloutError>((r.state, r.clock))
        })?;
        self.clock = clock;

        if *self.shutdown.borrow() {
            return Ok(Ping::Halt(Halt::Shutdown));
        }
        match state {
            RolloutState::Running => Ok(Ping::Continue),
            other => Ok(Ping::Halt(Halt::Observed(other))),
        }
    }

    async fn sample(&mut self) -> RolloutResult<Verdict> {
        let env = self.key.env.clone();
        let successor = self
            .successor
            .as_ref()
            .map(|s| s.reference.clone())
            .ok_or_else(|| RolloutError::Unexpected("sampled before submission".to_string()))?;

        let succ = match self.adapter.status(&env, &successor).await {
            Ok(status) => status,
            Err(AdapterError::NotFound(_)) => {
                return Err(RolloutError::Deletion(format!(
                    "{successor} was deleted out of band"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let pred = match (&self.predecessor, self.convergence) {
            (Some(reference), Convergence::Service) => {
                match self.adapter.status(&env, reference).await {
                    Ok(status) => Some(status),
                    Err(AdapterError::NotFound(_)) => Some(TargetStatus::drained()),
                    Err(e) => return Err(e.into()),
                }
            }
            _ => None,
        };

        let to_pods = succ.pods.clone();
        let from_pods = pred.as_ref().map(|p| p.pods.clone()).unwrap_or_default();
        self.store.update(&self.key, |r| {
            r.to_pods = to_pods;
            r.from_pods = from_pods;
            Ok::<_, RolloutError>(())
        })?;

        let draining = pred.as_ref().map_or(0, |p| p.running);
        debug!(
            key = %self.key,
            ready = succ.ready,
            desired = self.desired,
            draining,
            "sampled target"
        );
        if self.convergence == Convergence::Service && self.last_ready != Some(succ.ready) {
            self.last_ready = Some(succ.ready);
            self.journal
                .log(
                    &self.key,
                    Severity::Debug,
                    format!(
                        "successor {}/{} ready, predecessor {} running",
                        succ.ready, self.desired, draining
                    ),
                )
                .await?;
        }

        Ok(self.convergence.evaluate(&Observation {
            desired: self.desired,
            predecessor: pred.as_ref(),
            successor: &succ,
            checkpoint: self.checkpoint,
        }))
    }

    /// Sleep one poll interval, cut short by state changes, shutdown, or target events.
    async fn wait(&mut self) {
        let sleep = tokio::time::sleep(self.poll_interval);
        tokio::pin!(sleep);

        loop {
            let wake = tokio::select! {
                _ = &mut sleep => Wake::Tick,
                changed = self.shutdown.changed() => match changed {
                    Ok(()) => Wake::Shutdown,
                    Err(_) => Wake::Closed,
                },
                event = self.record_events.recv() => match event {
                    Some(event) if event.touches(RecordField::State) => Wake::StateChanged,
                    Some(_) => Wake::Ignored,
                    None => Wake::Closed,
                },
                event = next_target_event(&mut self.target_events) => Wake::Target(event),
            };

            match wake {
                Wake::Tick | Wake::Shutdown | Wake::StateChanged => return,
                Wake::Ignored => continue,
                Wake::Closed => {
                    (&mut sleep).await;
                    return;
                }
                Wake::Target(Some(TargetEvent::Deleted(reference))) => {
                    self.deleted = Some(reference);
                    return;
                }
                Wake::Target(Some(TargetEvent::Changed(_))) => return,
                Wake::Target(None) => {
                    self.target_events = None;
                    continue;
                }
            }
        }
    }

    // ── Conclusion ─────────────────────────────────────────────────

    async fn conclude(&mut self, outcome: RolloutResult<Halt>) -> RolloutResult<RolloutRecord> {
        match outcome {
            Ok(halt) => self.settle(halt).await,
            Err(err) => {
                if let Err(e) = self.settle_error(&err).await {
                    error!(key = %self.key, error = %e, "failed to record episode failure");
                }
                Err(err)
            }
        }
    }

    async fn settle(&mut self, halt: Halt) -> RolloutResult<RolloutRecord> {
        let desired = self.desired;
        match halt {
            Halt::Converged => {
                self.finish(Command::Converge, Severity::Info, move |r| {
                    format!(
                        "rollout completed in {}: {desired}/{desired} ready, predecessor drained",
                        humanize(r.clock)
                    )
                })
                .await
            }
            Halt::Succeeded => {
                self.finish(Command::Succeed, Severity::Info, |r| {
                    format!("run succeeded after {}", humanize(r.clock))
                })
                .await
            }
            Halt::Failed(reason) => {
                self.finish(Command::Fail, Severity::Error, move |r| {
                    format!("run failed after {}: {reason}", humanize(r.clock))
                })
                .await
            }
            Halt::Checkpoint { ready } => {
                self.suspend().await;
                self.finish(Command::Stall, Severity::Warn, move |r| {
                    r.autopaused = true;
                    format!("autopaused at checkpoint: {ready}/{desired} ready")
                })
                .await
            }
            Halt::Shutdown => {
                self.finish(Command::Stall, Severity::Warn, |r| {
                    format!(
                        "supervision stopped by shutdown after {}; paused",
                        humanize(r.clock)
                    )
                })
                .await
            }
            Halt::Observed(state) => self.settle_observed(state).await,
        }
    }

    async fn settle_error(&mut self, err: &RolloutError) -> RolloutResult<RolloutRecord> {
        match err {
            RolloutError::Timeout(_) => {
                self.suspend().await;
                let message = err.to_string();
                self.finish(Command::Stall, Severity::Error, move |_| message).await
            }
            RolloutError::Deletion(_) => {
                let message = err.to_string();
                let command = if self.kind.is_run() {
                    Command::Fail
                } else {
                    Command::Stall
                };
                self.finish(command, Severity::Error, move |_| message).await
            }
            other => {
                self.journal
                    .log(
                        &self.key,
                        Severity::Error,
                        format!("supervision aborted: {other}"),
                    )
                    .await?;
                self.load()
            }
        }
    }

    /// Write the monitor's own decision, deferring to an operator who got there first.
    async fn finish<F>(
        &mut self,
        command: Command,
        severity: Severity,
        prepare: F,
    ) -> RolloutResult<RolloutRecord>
    where
        F: FnOnce(&mut RolloutRecord) -> String,
    {
        match self
            .journal
            .transition(&self.key, command, severity, prepare)
            .await
        {
            Err(RolloutError::InvalidTransition { from, .. }) => {
                debug!(key = %self.key, state = %from, %command, "record changed before decision was written");
                self.settle_observed(from).await
            }
            other => other,
        }
    }

    /// Complete a soft stop requested by an operator, or step aside.
    async fn settle_observed(&mut self, state: RolloutState) -> RolloutResult<RolloutRecord> {
        let written = match state {
            RolloutState::Pausing => {
                self.suspend().await;
                self.journal
                    .transition(&self.key, Command::Pause, Severity::Warn, |r| {
                        format!("paused after {} of supervision", humanize(r.clock))
                    })
                    .await
            }
            RolloutState::Terminating => {
                self.delete_successor().await;
                self.journal
                    .transition(&self.key, Command::Terminate, Severity::Warn, |r| {
                        format!("terminated after {}", humanize(r.clock))
                    })
                    .await
            }
            other => Err(RolloutError::InvalidTransition {
                from: other,
                command: Command::Stall,
            }),
        };

        match written {
            Err(RolloutError::InvalidTransition { from, .. }) => {
                self.journal
                    .log(
                        &self.key,
                        Severity::Debug,
                        format!("supervision ended; record is {from}"),
                    )
                    .await?;
                self.load()
            }
            other => other,
        }
    }

    /// Best-effort: stop the target from progressing.
    async fn suspend(&self) {
        if let Err(e) = self
            .adapter
            .suspend(&self.key.env, &self.key.workload)
            .await
        {
            let _ = self
                .journal
                .log(
                    &self.key,
                    Severity::Warn,
                    format!("could not suspend target: {e}"),
                )
                .await;
        }
    }

    /// Best-effort: remove the run unit.
    async fn delete_successor(&self) {
        let Some(successor) = &self.successor else {
            return;
        };
        if let Err(e) = self
            .adapter
            .delete(&self.key.env, &successor.reference)
            .await
        {
            let _ = self
                .journal
                .log(
                    &self.key,
                    Severity::Warn,
                    format!("could not delete {}: {e}", successor.reference),
                )
                .await;
        }
    }

    /// Release the lock and drop live subscriptions.
    fn detach(&mut self) {
        self.target_events = None;
        if let Some(guard) = self.guard.take() {
            if let Err(e) = guard.release() {
                error!(key = %self.key, error = %e, "failed to release supervision lock");
            }
        }
    }

    fn load(&self) -> RolloutResult<RolloutRecord> {
        self.store
            .get(&self.key)?
            .ok_or_else(|| RolloutError::NotFound(self.key.to_string()))
    }
}

async fn next_target_event(events: &mut Option<TargetWatch>) -> Option<TargetEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
