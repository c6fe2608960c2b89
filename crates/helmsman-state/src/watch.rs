//! Change subscriptions over the record store.

use tokio::sync::broadcast;
use tracing::warn;

use helmsman_core::{RecordKey, WorkloadRef};

use crate::types::ChangeEvent;

/// Which records a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchFilter {
    /// A single record.
    Record(RecordKey),
    /// Every record of one workload.
    Workload(WorkloadRef),
    /// Everything.
    All,
}

impl WatchFilter {
    pub fn matches(&self, key: &RecordKey) -> bool {
        match self {
            WatchFilter::Record(k) => k == key,
            WatchFilter::Workload(w) => w.env == key.env && w.workload == key.workload,
            WatchFilter::All => true,
        }
    }
}

/// A live subscription. Dropping it detaches from the store.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    filter: WatchFilter,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<ChangeEvent>, filter: WatchFilter) -> Self {
        Self { rx, filter }
    }

    pub fn filter(&self) -> &WatchFilter {
        &self.filter
    }

    /// Wait for the next matching event. Returns `None` once the store is gone.
    ///
    /// A subscriber that falls behind skips the missed events; each event
    /// carries a full record snapshot, so the next one is still consistent.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event.key) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, filter = ?self.filter, "record subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
