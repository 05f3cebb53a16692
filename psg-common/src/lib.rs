//! Shared types and utilities for the Prompt Screening Gateway.
//!
//! Everything that more than one gateway crate needs lives here: the action
//! lattice and finding/decision types, the `PSG_`-prefixed configuration
//! system, the error taxonomy, the audit digest, the masking engine, and the
//! language heuristic used by tenant guards.

pub mod config;
pub mod digest;
pub mod errors;
pub mod lang;
pub mod masking;
pub mod types;

pub use config::{GatewayConfig, validate_config};
pub use errors::GatewayError;
pub use types::{
    Action, BundleRef, BundleStatus, Channel, Decision, DecisionRecord, DetectionMethod,
    DetectorKind, Finding, FindingsSummary, FilterRule, ListEntry, ListKind, PolicyBundle,
    RequestContext, Severity, Span,
};
