//! Pool and connection interfaces.
//!
//! The decorator only talks to a pool through these traits. A native pool
//! adapter (see [`crate::db::mysql`]) implements them over a real driver; the
//! decorator then implements them again on top, so a decorated pool has the
//! same shape as the pool it wraps.

use crate::error::PoolResult;
use crate::models::{Query, QueryOutput};
use async_trait::async_trait;
use std::sync::Arc;

/// A shared manager of reusable connections.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    type Connection: Connection;

    /// Obtain a connection. The caller holds it exclusively until it is released.
    async fn acquire(&self) -> PoolResult<Self::Connection>;

    /// Run a statement on any available connection.
    async fn execute(&self, query: &Query) -> PoolResult<QueryOutput>;
}

/// One live session to the database server.
#[async_trait]
pub trait Connection: Send + 'static {
    async fn execute(&mut self, query: &Query) -> PoolResult<QueryOutput>;

    /// Server-assigned thread/session id, when known.
    fn thread_id(&self) -> Option<u64>;

    /// Capability to return this connection to its pool.
    fn as_releasable(&mut self) -> Option<&mut dyn Releasable> {
        None
    }

    /// Capability to tear down the transport while a query is in flight.
    ///
    /// The handle is shared so it can be used while `execute` holds the connection.
    fn destroyer(&self) -> Option<Arc<dyn Destroyable>> {
        None
    }

    /// Marker set once timeout behavior is attached.
    fn is_timeout_decorated(&self) -> bool {
        false
    }
}

/// A connection that can be handed back to its pool.
#[async_trait]
pub trait Releasable: Send {
    async fn release(&mut self) -> PoolResult<()>;
}

/// A transport that can be invalidated from outside the task using it.
pub trait Destroyable: Send + Sync {
    /// Forcibly invalidate the transport. Must not block.
    fn destroy(&self);

    /// Session id of the transport, if the driver tracks it here.
    fn thread_id(&self) -> Option<u64> {
        None
    }
}
