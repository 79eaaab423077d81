//! Query reclaim strategies.
//!
//! Both strategies race the native query against the configured deadline and
//! differ only in what happens to the loser:
//!
//! - `PassiveRace`: the query is abandoned and the server session is killed.
//! - `ActiveDestroy`: the transport is destroyed the moment the timer fires,
//!   the query gets a short grace period to settle, then the session is killed.
//!
//! Ties go to the native query: every `select!` below is `biased` with the
//! native arm first.

use crate::config::{ReclaimMode, TimeoutConfig};
use crate::db::pool::Connection;
use crate::db::reclaim::SessionKiller;
use crate::error::{PoolError, PoolResult};
use crate::models::{Query, QueryOutput};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Runs one query on a connection under a deadline and reclaims the session on timeout.
#[async_trait]
pub trait ReclaimStrategy: Send + Sync {
    async fn execute<C: Connection>(
        &self,
        conn: &mut C,
        query: &Query,
        killer: &dyn SessionKiller,
    ) -> PoolResult<QueryOutput>;

    fn mode(&self) -> ReclaimMode;
}

fn stalled_in_flight(err: &PoolError) -> bool {
    err.as_driver()
        .is_some_and(|e| e.is_protocol_sequence_timeout())
}

/// Race the query against the timer; on timeout kill the session and report it.
#[derive(Debug, Clone)]
pub struct PassiveRace {
    deadline: Duration,
}

impl PassiveRace {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

#[async_trait]
impl ReclaimStrategy for PassiveRace {
    async fn execute<C: Connection>(
        &self,
        conn: &mut C,
        query: &Query,
        killer: &dyn SessionKiller,
    ) -> PoolResult<QueryOutput> {
        let timeout_ms = self.deadline.as_millis() as u64;
        debug!(sql = %query.sql, timeout_ms, "Racing query against deadline");

        let settled = tokio::select! {
            biased;
            result = conn.execute(query) => Some(result),
            _ = sleep(self.deadline) => None,
        };

        match settled {
            Some(Ok(output)) => Ok(output),
            Some(Err(e)) => {
                if stalled_in_flight(&e) {
                    if let Some(thread_id) = conn.thread_id() {
                        killer.kill(thread_id).await;
                    }
                }
                Err(e)
            }
            None => {
                let thread_id = conn.thread_id();
                warn!(sql = %query.sql, timeout_ms, thread_id = ?thread_id, "Query timed out");
                if let Some(thread_id) = thread_id {
                    killer.kill(thread_id).await;
                }
                Err(PoolError::timeout_query(query, self.deadline))
            }
        }
    }

    fn mode(&self) -> ReclaimMode {
        ReclaimMode::Race
    }
}

/// Destroy the transport when the timer fires, then kill the session.
#[derive(Debug, Clone)]
pub struct ActiveDestroy {
    deadline: Duration,
    grace: Duration,
}

/// What the timer recorded when it fired.
struct Expired {
    thread_id: Option<u64>,
}

enum Settled {
    Completed(PoolResult<QueryOutput>),
    /// Still pending after the grace period; dropped.
    Abandoned,
}

impl ActiveDestroy {
    pub fn new(deadline: Duration, grace: Duration) -> Self {
        Self { deadline, grace }
    }
}

#[async_trait]
impl ReclaimStrategy for ActiveDestroy {
    async fn execute<C: Connection>(
        &self,
        conn: &mut C,
        query: &Query,
        killer: &dyn SessionKiller,
    ) -> PoolResult<QueryOutput> {
        let timeout_ms = self.deadline.as_millis() as u64;
        debug!(sql = %query.sql, timeout_ms, "Running query with destroy-on-timeout");

        let destroyer = conn.destroyer();
        let (settled, expired) = {
            let mut native = conn.execute(query);
            let first = tokio::select! {
                biased;
                result = &mut native => Some(result),
                _ = sleep(self.deadline) => None,
            };

            match first {
                // Timer dropped unfired.
                Some(result) => (Settled::Completed(result), None),
                None => {
                    let thread_id = destroyer.as_ref().and_then(|d| d.thread_id());
                    match &destroyer {
                        Some(d) => {
                            warn!(
                                sql = %query.sql,
                                timeout_ms,
                                thread_id = ?thread_id,
                                "Query timed out; destroying transport"
                            );
                            d.destroy();
                        }
                        None => warn!(
                            sql = %query.sql,
                            timeout_ms,
                            "Query timed out; connection cannot be destroyed"
                        ),
                    }
                    let settled = match timeout(self.grace, &mut native).await {
                        Ok(result) => Settled::Completed(result),
                        Err(_) => Settled::Abandoned,
                    };
                    (settled, Some(Expired { thread_id }))
                }
            }
        };

        match (settled, expired) {
            (Settled::Completed(Ok(output)), None) => Ok(output),
            (Settled::Completed(Ok(_)), Some(expired)) => {
                debug!(sql = %query.sql, "Discarding result that arrived after the deadline");
                if let Some(thread_id) = expired.thread_id.or_else(|| conn.thread_id()) {
                    killer.kill(thread_id).await;
                }
                Err(PoolError::timeout_query(query, self.deadline))
            }
            (Settled::Completed(Err(e)), expired) => {
                let live = if stalled_in_flight(&e) {
                    conn.thread_id()
                } else {
                    None
                };
                if let Some(thread_id) = live.or(expired.and_then(|x| x.thread_id)) {
                    killer.kill(thread_id).await;
                }
                Err(e)
            }
            (Settled::Abandoned, expired) => {
                let captured = expired.and_then(|x| x.thread_id);
                if let Some(thread_id) = captured.or_else(|| conn.thread_id()) {
                    killer.kill(thread_id).await;
                }
                Err(PoolError::timeout_query(query, self.deadline))
            }
        }
    }

    fn mode(&self) -> ReclaimMode {
        ReclaimMode::Destroy
    }
}

/// The strategy selected by [`TimeoutConfig::reclaim`].
#[derive(Debug, Clone)]
pub enum ConfiguredStrategy {
    PassiveRace(PassiveRace),
    ActiveDestroy(ActiveDestroy),
}

impl ConfiguredStrategy {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        match config.reclaim {
            ReclaimMode::Race => Self::PassiveRace(PassiveRace::new(config.timeout())),
            ReclaimMode::Destroy => Self::ActiveDestroy(ActiveDestroy::new(
                config.timeout(),
                config.destroy_grace(),
            )),
        }
    }
}

#[async_trait]
impl ReclaimStrategy for ConfiguredStrategy {
    async fn execute<C: Connection>(
        &self,
        conn: &mut C,
        query: &Query,
        killer: &dyn SessionKiller,
    ) -> PoolResult<QueryOutput> {
        match self {
            Self::PassiveRace(s) => s.execute(conn, query, killer).await,
            Self::ActiveDestroy(s) => s.execute(conn, query, killer).await,
        }
    }

    fn mode(&self) -> ReclaimMode {
        match self {
            Self::PassiveRace(s) => s.mode(),
            Self::ActiveDestroy(s) => s.mode(),
        }
    }
}
