//! Supervision leases: set-if-absent entries with an expiry.
//!
//! The lease table is the arbiter of which record of a workload is
//! currently supervised. A lease is released explicitly by its holder;
//! the expiry only protects against a holder that crashed mid-episode.

use std::time::Duration;

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::debug;

use helmsman_core::WorkloadRef;

use crate::error::{map_err, StateResult};
use crate::store::RecordStore;
use crate::tables::LOCKS;

/// A held lease on a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Record id (or other description) of the holder.
    pub holder: String,
    /// Secret presented on release.
    pub token: String,
    /// Unix timestamp (milliseconds).
    pub acquired_at_ms: u64,
    /// Unix timestamp (milliseconds) after which the lease is void.
    pub expires_at_ms: u64,
}

impl LockLease {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(LockLease),
    /// Someone else holds a live lease.
    Held(LockLease),
}

impl RecordStore {
    /// Take the lease for `workload` unless a live one exists.
    pub fn try_lock(
        &self,
        workload: &WorkloadRef,
        holder: &str,
        token: &str,
        ttl: Duration,
    ) -> StateResult<LockAttempt> {
        let key = workload.table_key();
        let now = epoch_millis();
        let txn = self.db().begin_write().map_err(map_err!(Transaction))?;
        let attempt = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<LockLease>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };

            match existing {
                Some(lease) if lease.is_live(now) => LockAttempt::Held(lease),
                _ => {
                    let lease = LockLease {
                        holder: holder.to_string(),
                        token: token.to_string(),
                        acquired_at_ms: now,
                        expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
                    };
                    let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    LockAttempt::Acquired(lease)
                }
            }
        };

        match &attempt {
            LockAttempt::Acquired(_) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(%key, %holder, "lease acquired");
            }
            LockAttempt::Held(lease) => {
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(%key, holder = %lease.holder, "lease already held");
            }
        }
        Ok(attempt)
    }

    /// Drop the lease if `token` still owns it. Returns true if removed.
    pub fn unlock(&self, workload: &WorkloadRef, token: &str) -> StateResult<bool> {
        let key = workload.table_key();
        let txn = self.db().begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owned = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let lease: LockLease = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    lease.token == token
                }
                None => false,
            };
            if owned {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            owned
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, removed, "lease released");
        Ok(removed)
    }

    /// The current lease for `workload`, live or expired.
    pub fn get_lock(&self, workload: &WorkloadRef) -> StateResult<Option<LockLease>> {
        use redb::ReadableDatabase;

        let key = workload.table_key();
        let txn = self.db().begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
