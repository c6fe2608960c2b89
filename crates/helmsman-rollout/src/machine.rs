//! Rollout state machine: the only place that decides whether a
//! command is legal in a given state.
//!
//! Operator commands (`start`, `resume`, `pause`, `rollback`,
//! `terminate`) and the monitor's own decisions (`converge`, `stall`,
//! `succeed`, `fail`, `finish_rollback`) go through the same table.

use std::fmt;

use serde::{Deserialize, Serialize};

use helmsman_core::WorkloadKind;
use helmsman_state::{RolloutRecord, RolloutState, Severity};

use crate::error::{RolloutError, RolloutResult};

/// Something that asks a record to change state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Start,
    Resume,
    /// Soft pause from `Running`; forced pause from `Pausing`.
    Pause,
    Rollback,
    /// Soft stop of a run from `Running`; forced stop from `Terminating`.
    Terminate,
    /// Service successor fully ready and predecessor drained.
    Converge,
    /// Monitor gave up without failing: timeout, checkpoint, shutdown.
    Stall,
    /// Run unit reported success.
    Succeed,
    /// Run unit reported failure or vanished.
    Fail,
    FinishRollback,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Start,
        Command::Resume,
        Command::Pause,
        Command::Rollback,
        Command::Terminate,
        Command::Converge,
        Command::Stall,
        Command::Succeed,
        Command::Fail,
        Command::FinishRollback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Resume => "resume",
            Command::Pause => "pause",
            Command::Rollback => "rollback",
            Command::Terminate => "terminate",
            Command::Converge => "converge",
            Command::Stall => "stall",
            Command::Succeed => "succeed",
            Command::Fail => "fail",
            Command::FinishRollback => "finish rollback",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state `command` moves a record of `kind` to from `from`.
pub fn transition(
    kind: WorkloadKind,
    from: RolloutState,
    command: Command,
) -> RolloutResult<RolloutState> {
    use Command as C;
    use RolloutState as S;

    let to = match (from, command) {
        (S::New, C::Start) => S::Running,
        (S::Paused, C::Resume) => S::Running,
        (S::Running, C::Pause) => S::Pausing,
        (S::Pausing, C::Pause) => S::Paused,
        (S::Running, C::Converge) if !kind.is_run() => S::Completed,
        (S::Running, C::Stall) => S::Paused,
        (S::RollingBack, C::Stall) => S::Paused,
        (S::Paused | S::Completed, C::Rollback) => S::RollingBack,
        (S::RollingBack, C::FinishRollback) => S::RolledBack,
        (S::Running, C::Terminate) if kind.is_run() => S::Terminating,
        (S::Terminating, C::Terminate) => S::Terminated,
        (S::Running, C::Succeed) if kind.is_run() => S::Completed,
        (S::Running, C::Fail) if kind.is_run() => S::Failed,
        _ => return Err(RolloutError::InvalidTransition { from, command }),
    };
    Ok(to)
}

/// Apply `command` to `record` and append `message` to its log.
///
/// On error the record is untouched.
pub fn apply(
    record: &mut RolloutRecord,
    command: Command,
    severity: Severity,
    message: impl Into<String>,
) -> RolloutResult<RolloutState> {
    let to = transition(record.kind, record.state, command)?;
    record.state = to;
    record.push_log(severity, message);
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::RecordKey;

    const ALL_KINDS: [WorkloadKind; 3] =
        [WorkloadKind::Service, WorkloadKind::Job, WorkloadKind::AdHoc];

    fn expected(kind: WorkloadKind, from: RolloutState, command: Command) -> Option<RolloutState> {
        use Command as C;
        use RolloutState as S;
        let run = kind.is_run();
        match (from, command) {
            (S::New, C::Start) | (S::Paused, C::Resume) => Some(S::Running),
            (S::Running, C::Pause) => Some(S::Pausing),
            (S::Pausing, C::Pause) => Some(S::Paused),
            (S::Running, C::Converge) if !run => Some(S::Completed),
            (S::Running | S::RollingBack, C::Stall) => Some(S::Paused),
            (S::Paused | S::Completed, C::Rollback) => Some(S::RollingBack),
            (S::RollingBack, C::FinishRollback) => Some(S::RolledBack),
            (S::Running, C::Terminate) if run => Some(S::Terminating),
            (S::Terminating, C::Terminate) => Some(S::Terminated),
            (S::Running, C::Succeed) if run => Some(S::Completed),
            (S::Running, C::Fail) if run => Some(S::Failed),
            _ => None,
        }
    }

    #[test]
    fn table_is_exhaustive() {
        for kind in ALL_KINDS {
            for from in RolloutState::ALL {
                for command in Command::ALL {
                    let got = transition(kind, from, command).ok();
                    assert_eq!(
                        got,
                        expected(kind, from, command),
                        "{kind} {from} --{command}-->"
                    );
                }
            }
        }
    }

    #[test]
    fn pause_from_new_is_rejected() {
        let err = transition(WorkloadKind::Service, RolloutState::New, Command::Pause).unwrap_err();
        assert!(matches!(
            err,
            RolloutError::InvalidTransition {
                from: RolloutState::New,
                command: Command::Pause
            }
        ));
    }

    #[test]
    fn terminate_is_run_only() {
        assert!(transition(WorkloadKind::Service, RolloutState::Running, Command::Terminate).is_err());
        assert_eq!(
            transition(WorkloadKind::Job, RolloutState::Running, Command::Terminate).unwrap(),
            RolloutState::Terminating
        );
    }

    #[test]
    fn rollback_needs_a_settled_state() {
        for from in [RolloutState::New, RolloutState::Running] {
            assert!(transition(WorkloadKind::Service, from, Command::Rollback).is_err());
        }
        assert_eq!(
            transition(WorkloadKind::Service, RolloutState::Completed, Command::Rollback).unwrap(),
            RolloutState::RollingBack
        );
    }

    #[test]
    fn apply_logs_and_leaves_record_on_error() {
        let mut record = RolloutRecord::new(
            &RecordKey::new("prod", "api", "a1"),
            WorkloadKind::Service,
            "main",
            "v42",
            "alice",
        );

        assert!(apply(&mut record, Command::Pause, Severity::Warn, "pause").is_err());
        assert_eq!(record.state, RolloutState::New);
        assert!(record.log.is_empty());

        let to = apply(&mut record, Command::Start, Severity::Debug, "started").unwrap();
        assert_eq!(to, RolloutState::Running);
        assert_eq!(record.log.len(), 1);
        assert_eq!(record.log[0].message, "started");
    }
}
