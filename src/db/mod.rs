//! Pool abstraction and the timeout decorator.
//!
//! This module provides:
//! - The `Pool` / `Connection` capability traits the decorator is written against
//! - Query reclaim strategies (passive race, active destroy)
//! - Session kill and best-effort release helpers
//! - The orphan reaper for acquires that lost their race
//! - A sqlx-backed MySQL adapter

pub mod mysql;
pub mod pool;
pub mod reaper;
pub mod reclaim;
pub mod strategy;
pub mod timeout;

pub use mysql::{MySqlBackend, MySqlSession};
pub use pool::{Connection, Destroyable, Pool, Releasable};
pub use reaper::{OrphanMetadata, OrphanReaper};
pub use reclaim::{PoolKiller, SessionKiller, release_quietly};
pub use strategy::{ActiveDestroy, ConfiguredStrategy, PassiveRace, ReclaimStrategy};
pub use timeout::{TimeoutConnection, TimeoutPool};
