//! Lock manager: at most one supervised episode per workload.
//!
//! Acquisition is set-if-absent against the record store's lease table.
//! A refused acquisition is not an error: the caller gets `Held` and must
//! surface it as a conflict. Holding a lease also registers the episode
//! with the shutdown barrier.

use std::time::Duration;

use tracing::{debug, error, info};

use helmsman_core::WorkloadRef;
use helmsman_state::{LockAttempt, LockLease, RecordStore};

use crate::error::{RolloutError, RolloutResult};
use crate::shutdown::{BarrierToken, Shutdown};

/// Outcome of `LockManager::acquire`.
pub enum Acquisition {
    Acquired(LockGuard),
    Held(LockLease),
}

#[derive(Clone)]
pub struct LockManager {
    store: RecordStore,
    ttl: Duration,
    shutdown: Shutdown,
}

impl LockManager {
    pub fn new(store: RecordStore, ttl: Duration, shutdown: Shutdown) -> Self {
        Self {
            store,
            ttl,
            shutdown,
        }
    }

    /// Try to take the supervision lease for `workload` on behalf of `holder`.
    pub fn acquire(&self, workload: &WorkloadRef, holder: &str) -> RolloutResult<Acquisition> {
        let barrier = self
            .shutdown
            .register()
            .ok_or_else(|| RolloutError::Unexpected("engine is shutting down".to_string()))?;
        let token = random_hex(16)?;

        match self.store.try_lock(workload, holder, &token, self.ttl)? {
            LockAttempt::Acquired(_) => {
                info!(%workload, %holder, ttl_secs = self.ttl.as_secs(), "supervision lock acquired");
                Ok(Acquisition::Acquired(LockGuard {
                    store: self.store.clone(),
                    workload: workload.clone(),
                    token,
                    released: false,
                    _barrier: barrier,
                }))
            }
            LockAttempt::Held(lease) => {
                debug!(%workload, holder = %lease.holder, "supervision lock busy");
                Ok(Acquisition::Held(lease))
            }
        }
    }

    /// Acquire or fail with `Conflict`.
    pub fn acquire_or_conflict(
        &self,
        workload: &WorkloadRef,
        holder: &str,
    ) -> RolloutResult<LockGuard> {
        match self.acquire(workload, holder)? {
            Acquisition::Acquired(guard) => Ok(guard),
            Acquisition::Held(lease) => Err(RolloutError::Conflict {
                workload: workload.clone(),
                holder: lease.holder,
            }),
        }
    }
}

/// A held supervision lease. Released explicitly or on drop.
pub struct LockGuard {
    store: RecordStore,
    workload: WorkloadRef,
    token: String,
    released: bool,
    _barrier: BarrierToken,
}

impl LockGuard {
    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    pub fn release(mut self) -> RolloutResult<()> {
        self.released = true;
        self.store.unlock(&self.workload, &self.token)?;
        info!(workload = %self.workload, "supervision lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.store.unlock(&self.workload, &self.token) {
            Ok(_) => debug!(workload = %self.workload, "supervision lock released on drop"),
            Err(e) => {
                error!(workload = %self.workload, error = %e, "failed to release supervision lock")
            }
        }
    }
}

/// Hex string of `bytes` random bytes.
pub(crate) fn random_hex(bytes: usize) -> RolloutResult<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf)
        .map_err(|e| RolloutError::Unexpected(format!("getrandom failed: {e}")))?;
    Ok(hex::encode(buf))
}
