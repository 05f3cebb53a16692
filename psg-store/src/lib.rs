//! SQLite-backed rule store and decision log.
//!
//! Backs the policy data model: tenants, versioned policy bundles with their
//! filter rules and allow/block lists, and the append-only decision log.
//! Bundle activation is an atomic swap — every prior active bundle for the
//! `(tenant, channel)` pair moves to retired and the target becomes active in
//! a single transaction, serialized per pair; a concurrent activation loses
//! with [`StoreError::Conflict`] and the caller retries.
//!
//! The store runs on a single pooled connection behind `spawn_blocking`, so
//! async callers never park an I/O worker on SQLite.

pub mod schema;
mod store;

pub use store::{DecisionFilter, DecisionStats, NewListEntry, NewRule, RuleStore};

use thiserror::Error;

/// Store-level errors, mapped to the gateway taxonomy at the boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Concurrent activation, or editing a bundle that is not a draft.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Row data failed validation (bad action, out-of-range threshold, ...).
    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("store worker task failed")]
    Join,
}
