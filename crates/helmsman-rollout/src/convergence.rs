//! Convergence predicates: when an episode is done.

use helmsman_core::WorkloadKind;

use crate::adapter::{RunOutcome, TargetStatus};

/// Predicate family, chosen from the record's workload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Successor fully ready, predecessor drained.
    Service,
    /// Single pod or job ran to an outcome.
    Run,
}

/// What one sample of the target means for the episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Converged,
    /// Autopause point reached before convergence.
    Checkpoint { ready: u32 },
    Succeeded,
    Failed(String),
}

/// Inputs to a convergence decision.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub desired: u32,
    pub predecessor: Option<&'a TargetStatus>,
    pub successor: &'a TargetStatus,
    /// Ready count at which to autopause, if the checkpoint is armed.
    pub checkpoint: Option<u32>,
}

impl Convergence {
    pub fn for_kind(kind: WorkloadKind) -> Self {
        if kind.is_run() {
            Convergence::Run
        } else {
            Convergence::Service
        }
    }

    pub fn evaluate(&self, obs: &Observation<'_>) -> Verdict {
        match self {
            Convergence::Service => {
                let ready = obs.successor.ready;
                let draining = obs.predecessor.map_or(0, |p| p.running);
                if ready == obs.desired && draining == 0 {
                    return Verdict::Converged;
                }
                match obs.checkpoint {
                    Some(step) if step > 0 && ready >= step => Verdict::Checkpoint { ready },
                    _ => Verdict::Pending,
                }
            }
            Convergence::Run => match &obs.successor.outcome {
                Some(RunOutcome::Succeeded) => Verdict::Succeeded,
                Some(RunOutcome::Failed(reason)) => Verdict::Failed(reason.clone()),
                None => Verdict::Pending,
            },
        }
    }
}
