//! Error types for meshca
//!
//! Errors carry the namespace or context they occurred in so that log lines
//! emitted by the rotation loop can be traced back to a specific record.

use thiserror::Error;

/// Main error type for trust store and cluster operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A trust store record could not be read or written
    #[error("store error in {namespace}: {message}")]
    Store {
        /// Namespace holding the record
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "rotation", "resolver")
        context: String,
    },
}

impl Error {
    /// Create a store error for the given namespace
    pub fn store(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with specific context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses (other than conflicts) need a config or RBAC
    /// fix and will fail the same way on the next refresh tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Store { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the namespace if this error is associated with a specific record
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Error::Store { namespace, .. } => Some(namespace),
            _ => None,
        }
    }
}

/// Returns true if the kube error is a 409 from the API server
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn store_error_carries_namespace() {
        let err = Error::store("mesh", "configmap update rejected");
        assert_eq!(err.namespace(), Some("mesh"));
        assert!(err.to_string().contains("mesh"));
        assert!(err.to_string().contains("configmap update rejected"));
        assert!(err.is_retryable());
    }

    #[test]
    fn internal_error_with_context() {
        let err = Error::internal_with_context("rotation", "generation failed");
        assert!(err.to_string().contains("[rotation]"));
        assert!(err.namespace().is_none());
    }

    #[test]
    fn kube_client_errors_are_not_retryable_except_conflicts() {
        assert!(!Error::from(api_error(403)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
        assert!(Error::from(api_error(409)).is_retryable());
        assert!(Error::from(api_error(503)).is_retryable());
    }

    #[test]
    fn conflict_helper() {
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(404)));
    }
}
