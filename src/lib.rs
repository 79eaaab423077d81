//! Timeout decorator for database connection pools.
//!
//! Wraps a pool so that acquiring a connection and running a query are both
//! bounded by a deadline. When the deadline wins, the caller gets a timeout
//! error right away and the abandoned work is reclaimed in the background:
//! late connections go back to the pool and stuck server sessions are killed.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{ReclaimMode, TimeoutConfig};
pub use db::{
    Connection, Destroyable, MySqlBackend, Pool, Releasable, TimeoutConnection, TimeoutPool,
};
pub use error::{DriverError, DriverResult, PoolError, PoolResult};
pub use models::{Query, QueryOutput, QueryParam};
