//! Gateway error taxonomy.
//!
//! Kinds, not types: every failure the gateway can surface maps to one of
//! these variants, and the boundary layer maps variants to HTTP statuses.
//! Detector-local failures are deliberately *not* represented here; they
//! degrade a single detector to "no findings" and are recorded in the
//! findings summary instead of failing the request.

use thiserror::Error;

/// Top-level gateway error. `Unauthorized`/`Forbidden` are reserved for an
/// outer auth layer and never produced by the core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed request at the boundary.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Concurrent bundle activation, or editing an active bundle.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown tenant, bundle, or rule.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request or a mandatory stage timed out.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A required external collaborator failed.
    #[error("dependency unavailable ({dependency}): {message}")]
    DependencyUnavailable {
        dependency: &'static str,
        message: String,
    },

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable kind string used in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => "invalid_input",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::DeadlineExceeded => "deadline_exceeded",
            GatewayError::DependencyUnavailable { .. } => "dependency_unavailable",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn dependency(dependency: &'static str, message: impl std::fmt::Display) -> Self {
        GatewayError::DependencyUnavailable {
            dependency,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(GatewayError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(GatewayError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(GatewayError::DeadlineExceeded.kind(), "deadline_exceeded");
        assert_eq!(
            GatewayError::dependency("store", "gone").kind(),
            "dependency_unavailable"
        );
    }
}
