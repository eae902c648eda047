//! Versioned, observable key/value store shared by the orchestrator and its
//! workers (a "blackboard").
//!
//! Writes take a per-key lock, so writers on different keys never contend.
//! Every committed write bumps the key's version and synchronously notifies
//! the key's observers. The whole store can be persisted to a JSON file.
//!
//! # Main types
//!
//! - [`SharedStateStore`]: The store itself, with optional file persistence.
//! - [`StateEntry`]: A committed value with author, version, and timestamp.
//! - [`StateObserver`]: Change callback, implemented for plain closures.
//! - [`StateStatistics`]: Read/write/notification counters.

/// Shared state store and observer types.
pub mod store;

pub use store::{SharedStateStore, StateEntry, StateObserver, StateStatistics, SubscriptionId};
