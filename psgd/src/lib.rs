//! Prompt Screening Gateway daemon.
//!
//! An inline screening gateway between an application and an LLM service.
//! For every candidate prompt it decides, under tenant-scoped policy, whether
//! to allow, redact, require approval, alert, or block — and applies the same
//! discipline to model responses on the outbound path.
//!
//! Crate layout mirrors the request flow: the boundary ([`http_api`]) builds
//! a request context and hands it to the [`engine`], whose [`pipeline`] runs
//! normalization, the allow/block short-circuit, the detector fan-out, the
//! policy [`evaluator`], the decision [`fuser`], masking, and finally the
//! [`audit`] logger. The [`cache`] serves immutable policy snapshots;
//! [`clients`] holds the HTTP implementations of every external contract so
//! tests can swap in fakes through the same [`engine::Backends`] seam.

pub mod audit;
pub mod cache;
pub mod clients;
pub mod engine;
pub mod evaluator;
pub mod fuser;
pub mod http_api;
pub mod metrics;
pub mod pipeline;
