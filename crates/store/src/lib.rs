//! Durable task/event storage.
//!
//! One relational row per investigation, with the append-only event log and
//! the subtask list as JSON columns. All access goes through a connection
//! mutex, so concurrent writers to the same task serialize and step-index
//! appends stay atomic.

mod store;

pub use store::{AppendOutcome, EventStore, StoreError};
