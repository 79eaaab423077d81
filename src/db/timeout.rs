//! The timeout decorator.
//!
//! [`TimeoutPool`] wraps any [`Pool`] and implements `Pool` itself:
//!
//! - `acquire()` races the native acquire against the deadline. An acquire that
//!   completes at the deadline still wins. A lost race hands the still-running
//!   acquire to the [`OrphanReaper`].
//! - Every connection it hands out is a [`TimeoutConnection`] whose `execute`
//!   runs through the configured [`ReclaimStrategy`].
//! - `execute()` composes acquire, query and a best-effort release.
//!
//! # Usage
//!
//! ```ignore
//! let pool = TimeoutPool::with_seconds(native_pool, 2.0)?;
//! let output = pool.execute(&Query::new("SELECT 1")).await?;
//! ```

use crate::config::TimeoutConfig;
use crate::db::pool::{Connection, Destroyable, Pool, Releasable};
use crate::db::reaper::OrphanReaper;
use crate::db::reclaim::{PoolKiller, release_quietly};
use crate::db::strategy::{ConfiguredStrategy, ReclaimStrategy};
use crate::error::{DriverError, PoolError, PoolResult};
use crate::models::{Query, QueryOutput};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

struct Shared<P: Pool> {
    pool: Arc<P>,
    config: TimeoutConfig,
    strategy: ConfiguredStrategy,
    killer: PoolKiller<P>,
    reaper: OrphanReaper,
}

/// A pool whose acquires and queries are bounded by a deadline.
pub struct TimeoutPool<P: Pool> {
    shared: Arc<Shared<P>>,
}

impl<P: Pool> Clone for TimeoutPool<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Pool> std::fmt::Debug for TimeoutPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutPool")
            .field("config", &self.shared.config)
            .field("reaper", &self.shared.reaper)
            .finish_non_exhaustive()
    }
}

impl<P: Pool> TimeoutPool<P> {
    /// Decorate `pool` with the given settings.
    pub fn new(pool: P, config: TimeoutConfig) -> PoolResult<Self> {
        Self::from_arc(Arc::new(pool), config)
    }

    /// Decorate `pool` with a deadline of `seconds` and defaults elsewhere.
    pub fn with_seconds(pool: P, seconds: f64) -> PoolResult<Self> {
        Self::new(pool, TimeoutConfig::with_seconds(seconds))
    }

    /// Decorate a pool that is also shared elsewhere.
    pub fn from_arc(pool: Arc<P>, config: TimeoutConfig) -> PoolResult<Self> {
        config.validate()?;

        info!(
            timeout_ms = config.timeout().as_millis() as u64,
            reclaim = %config.reclaim,
            "Attaching timeout behavior to pool"
        );

        let shared = Shared {
            strategy: ConfiguredStrategy::from_config(&config),
            killer: PoolKiller::new(Arc::clone(&pool), config.kill_timeout()),
            reaper: OrphanReaper::new(config.orphan_deadline()),
            pool,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.shared.config
    }

    /// The undecorated pool.
    pub fn inner(&self) -> &Arc<P> {
        &self.shared.pool
    }

    pub fn reaper(&self) -> &OrphanReaper {
        &self.shared.reaper
    }

    /// Attach query timeouts to `conn` unless it already carries them.
    fn decorate(&self, conn: P::Connection) -> TimeoutConnection<P> {
        let passthrough = conn.is_timeout_decorated();
        if passthrough {
            debug!(thread_id = ?conn.thread_id(), "Connection already carries timeout behavior");
        } else {
            debug!(thread_id = ?conn.thread_id(), "Attached timeout behavior to connection");
        }

        TimeoutConnection {
            inner: conn,
            shared: Arc::clone(&self.shared),
            passthrough,
        }
    }
}

#[async_trait]
impl<P: Pool> Pool for TimeoutPool<P> {
    type Connection = TimeoutConnection<P>;

    async fn acquire(&self) -> PoolResult<TimeoutConnection<P>> {
        let deadline = self.shared.config.timeout();
        let pool = Arc::clone(&self.shared.pool);
        let mut native = tokio::spawn(async move { pool.acquire().await });

        let mut first = tokio::select! {
            biased;
            joined = &mut native => Some(joined),
            _ = sleep(deadline) => None,
        };

        // A native acquire due at the same instant sits behind a JoinHandle and
        // has not been polled yet. Let it run once before declaring a timeout.
        if first.is_none() {
            tokio::task::yield_now().await;
            first = (&mut native).now_or_never();
        }

        match first {
            Some(Ok(result)) => Ok(self.decorate(result?)),
            Some(Err(e)) => Err(DriverError::other(format!("acquire task failed: {}", e)).into()),
            None => {
                warn!(
                    timeout_ms = deadline.as_millis() as u64,
                    "Acquire timed out; leaving native acquire to the reaper"
                );
                self.shared.reaper.adopt(native).await;
                Err(PoolError::timeout_acquire(deadline))
            }
        }
    }

    async fn execute(&self, query: &Query) -> PoolResult<QueryOutput> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(query).await;
        release_quietly(&mut conn).await;
        result
    }
}

/// A connection handed out by [`TimeoutPool`].
pub struct TimeoutConnection<P: Pool> {
    inner: P::Connection,
    shared: Arc<Shared<P>>,
    /// Inner connection already enforces deadlines.
    passthrough: bool,
}

impl<P: Pool> TimeoutConnection<P> {
    /// The undecorated connection.
    pub fn inner(&self) -> &P::Connection {
        &self.inner
    }

    pub fn into_inner(self) -> P::Connection {
        self.inner
    }
}

impl<P: Pool> std::fmt::Debug for TimeoutConnection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutConnection")
            .field("thread_id", &self.inner.thread_id())
            .field("passthrough", &self.passthrough)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<P: Pool> Connection for TimeoutConnection<P> {
    async fn execute(&mut self, query: &Query) -> PoolResult<QueryOutput> {
        if self.passthrough {
            return self.inner.execute(query).await;
        }
        self.shared
            .strategy
            .execute(&mut self.inner, query, &self.shared.killer)
            .await
    }

    fn thread_id(&self) -> Option<u64> {
        self.inner.thread_id()
    }

    fn as_releasable(&mut self) -> Option<&mut dyn Releasable> {
        self.inner.as_releasable()
    }

    fn destroyer(&self) -> Option<Arc<dyn Destroyable>> {
        self.inner.destroyer()
    }

    fn is_timeout_decorated(&self) -> bool {
        true
    }
}
