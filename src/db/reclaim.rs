//! Best-effort recovery actions.
//!
//! Killing a server session and releasing a connection both run after the
//! caller's outcome is already decided. Their failures are reported as
//! [`ReclaimFailure`], logged, and dropped.

use crate::db::pool::{Connection, Pool};
use crate::error::ReclaimFailure;
use crate::models::Query;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Issues the administrative kill for a stalled session.
#[async_trait]
pub trait SessionKiller: Send + Sync {
    /// Kill `thread_id`. Never fails from the caller's point of view.
    async fn kill(&self, thread_id: u64);
}

/// Sends `KILL <thread_id>` through the native pool, never through the stalled connection.
pub struct PoolKiller<P: Pool> {
    pool: Arc<P>,
    kill_timeout: Duration,
}

impl<P: Pool> PoolKiller<P> {
    pub fn new(pool: Arc<P>, kill_timeout: Duration) -> Self {
        Self { pool, kill_timeout }
    }

    async fn try_kill(&self, thread_id: u64) -> Result<(), ReclaimFailure> {
        let statement = Query::kill(thread_id);
        match timeout(self.kill_timeout, self.pool.execute(&statement)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ReclaimFailure::Kill {
                thread_id,
                source: e.into_driver(),
            }),
            Err(_) => Err(ReclaimFailure::KillTimedOut {
                thread_id,
                timeout_ms: self.kill_timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl<P: Pool> SessionKiller for PoolKiller<P> {
    async fn kill(&self, thread_id: u64) {
        match self.try_kill(thread_id).await {
            Ok(()) => warn!(thread_id, "Killed stalled database session"),
            // The original error is what the caller sees; this one is only logged.
            Err(e) => warn!(thread_id, error = %e, "Kill of stalled session failed"),
        }
    }
}

/// Release `conn` to its pool if it supports it, logging and dropping any failure.
///
/// Returns whether a release was attempted.
pub async fn release_quietly<C: Connection>(conn: &mut C) -> bool {
    let thread_id = conn.thread_id();
    let Some(releasable) = conn.as_releasable() else {
        debug!(thread_id = ?thread_id, "Connection is not releasable; dropping it");
        return false;
    };

    if let Err(e) = releasable.release().await {
        let failure = ReclaimFailure::Release {
            source: e.into_driver(),
        };
        warn!(thread_id = ?thread_id, error = %failure, "Connection release failed");
    }
    true
}
