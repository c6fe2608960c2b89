//! Record writes that leave an audit trail.
//!
//! Every transition and decision point lands in the record's log, is
//! mirrored to `tracing` at the same level, and is posted to the
//! notification sink when one is configured.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use helmsman_core::RecordKey;
use helmsman_state::{RecordStore, RolloutRecord, Severity};

use crate::adapter::NotificationSink;
use crate::error::{RolloutError, RolloutResult};
use crate::machine::{self, Command};

#[derive(Clone)]
pub(crate) struct Journal {
    store: RecordStore,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl Journal {
    pub(crate) fn new(store: RecordStore, sink: Option<Arc<dyn NotificationSink>>) -> Self {
        Self { store, sink }
    }

    /// Apply `command` and log the message produced by `prepare`.
    ///
    /// `prepare` runs inside the store transaction; it may adjust
    /// bookkeeping fields and returns the log line. Nothing is written if
    /// the transition is illegal.
    pub(crate) async fn transition<F>(
        &self,
        key: &RecordKey,
        command: Command,
        severity: Severity,
        prepare: F,
    ) -> RolloutResult<RolloutRecord>
    where
        F: FnOnce(&mut RolloutRecord) -> String,
    {
        let record = self.store.update(key, |record| {
            let mut staged = record.clone();
            let message = prepare(&mut staged);
            machine::apply(&mut staged, command, severity, message)?;
            *record = staged;
            Ok::<_, RolloutError>(record.clone())
        })?;
        if let Some(entry) = record.log.last() {
            self.emit(key, entry.severity, &entry.message).await;
        }
        Ok(record)
    }

    /// Append a log line without changing state.
    pub(crate) async fn log(
        &self,
        key: &RecordKey,
        severity: Severity,
        message: impl Into<String>,
    ) -> RolloutResult<()> {
        let message = message.into();
        self.store.append_log(key, severity, message.clone())?;
        self.emit(key, severity, &message).await;
        Ok(())
    }

    /// Mirror a line that is already in the record.
    pub(crate) async fn emit(&self, key: &RecordKey, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => debug!(env = %key.env, workload = %key.workload, id = %key.id, "{message}"),
            Severity::Info => info!(env = %key.env, workload = %key.workload, id = %key.id, "{message}"),
            Severity::Warn => warn!(env = %key.env, workload = %key.workload, id = %key.id, "{message}"),
            Severity::Error => error!(env = %key.env, workload = %key.workload, id = %key.id, "{message}"),
        }
        if let Some(sink) = &self.sink {
            sink.post(&format!("[{key}] {message}"), severity).await;
        }
    }
}
