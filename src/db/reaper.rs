//! Reconciliation of abandoned acquires.
//!
//! When the acquire deadline wins, the native acquire is not cancelled: it keeps
//! running as a spawned task. The reaper owns those tasks. A connection that is
//! eventually delivered is released straight back to the pool; an acquire still
//! pending after the orphan deadline is aborted.

use crate::db::pool::Connection;
use crate::db::reclaim::release_quietly;
use crate::error::PoolResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct OrphanEntry {
    created_at: Instant,
    started_at: DateTime<Utc>,
}

/// Metadata about a pending orphaned acquire.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanMetadata {
    pub orphan_id: String,
    /// When the acquire was abandoned (absolute time)
    pub started_at: DateTime<Utc>,
    /// Milliseconds since the acquire was abandoned
    pub pending_ms: u64,
}

#[derive(Clone)]
pub struct OrphanReaper {
    orphans: Arc<RwLock<HashMap<String, OrphanEntry>>>,
    deadline: Duration,
    reclaimed: Arc<AtomicUsize>,
    expired: Arc<AtomicUsize>,
}

impl OrphanReaper {
    /// Create a reaper that waits up to `deadline` for each abandoned acquire.
    pub fn new(deadline: Duration) -> Self {
        Self {
            orphans: Arc::new(RwLock::new(HashMap::new())),
            deadline,
            reclaimed: Arc::new(AtomicUsize::new(0)),
            expired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take ownership of a native acquire that lost its race.
    ///
    /// Returns the id under which the orphan is tracked.
    pub async fn adopt<C: Connection>(&self, handle: JoinHandle<PoolResult<C>>) -> String {
        let orphan_id = generate_orphan_id();
        {
            let mut orphans = self.orphans.write().await;
            orphans.insert(
                orphan_id.clone(),
                OrphanEntry {
                    created_at: Instant::now(),
                    started_at: Utc::now(),
                },
            );
        }

        debug!(orphan_id = %orphan_id, "Adopted abandoned acquire");

        let reaper = self.clone();
        let id = orphan_id.clone();
        tokio::spawn(async move {
            reaper.reap(&id, handle).await;
        });

        orphan_id
    }

    async fn reap<C: Connection>(&self, orphan_id: &str, mut handle: JoinHandle<PoolResult<C>>) {
        match timeout(self.deadline, &mut handle).await {
            Ok(Ok(Ok(mut conn))) => {
                if release_quietly(&mut conn).await {
                    self.reclaimed.fetch_add(1, Ordering::SeqCst);
                    info!(
                        orphan_id = %orphan_id,
                        thread_id = ?conn.thread_id(),
                        "Returned late connection to the pool"
                    );
                } else {
                    debug!(
                        orphan_id = %orphan_id,
                        thread_id = ?conn.thread_id(),
                        "Dropped late connection that cannot be released"
                    );
                }
            }
            Ok(Ok(Err(e))) => {
                debug!(orphan_id = %orphan_id, error = %e, "Abandoned acquire failed; nothing to reclaim");
            }
            Ok(Err(e)) => {
                warn!(orphan_id = %orphan_id, error = %e, "Abandoned acquire task did not complete");
            }
            Err(_) => {
                handle.abort();
                self.expired.fetch_add(1, Ordering::SeqCst);
                warn!(
                    orphan_id = %orphan_id,
                    deadline_secs = self.deadline.as_secs(),
                    "Aborting abandoned acquire past its deadline"
                );
            }
        }

        let mut orphans = self.orphans.write().await;
        orphans.remove(orphan_id);
    }

    /// List all pending orphans with their metadata.
    pub async fn list_all(&self) -> Vec<OrphanMetadata> {
        let orphans = self.orphans.read().await;
        orphans
            .iter()
            .map(|(id, entry)| OrphanMetadata {
                orphan_id: id.clone(),
                started_at: entry.started_at,
                pending_ms: entry.created_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Get the number of orphans still being awaited.
    pub async fn pending(&self) -> usize {
        let orphans = self.orphans.read().await;
        orphans.len()
    }

    /// Number of late connections returned to the pool.
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::SeqCst)
    }

    /// Number of orphans aborted past the deadline.
    pub fn expired(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for OrphanReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanReaper")
            .field("deadline", &self.deadline)
            .field("reclaimed", &self.reclaimed())
            .field("expired", &self.expired())
            .finish_non_exhaustive()
    }
}

/// Generate a unique orphan ID.
fn generate_orphan_id() -> String {
    format!("orphan_{}", uuid::Uuid::new_v4().simple())
}
