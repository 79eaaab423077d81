//! Data models shared by the decorator and pool adapters.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;

// Re-export commonly used types
pub use query::{Query, QueryOutput, QueryParam};
