//! Error types for the load balancer reconciler

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Finalizer add/remove failed
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// The referenced cloud resource does not exist
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    /// ETag mismatch on a write; the cached copy was stale
    #[error("precondition failed writing {kind} {name:?}: etag mismatch")]
    PreconditionFailed { kind: String, name: String },

    /// Write superseded by a concurrent operation
    #[error("conflict writing {kind} {name:?}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Any other cloud API failure
    #[error("cloud API error (status {status}): {message}")]
    Cloud {
        status: u16,
        message: String,
        retriable: bool,
    },

    /// Malformed annotation, unsupported protocol/SKU combination, port collision
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A resource is unmanaged or owned by somebody else
    #[error("Ownership conflict: {0}")]
    OwnershipConflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The batched route updater stopped before the operation was applied
    #[error("route batch aborted: {0}")]
    BatchAborted(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Map an HTTP-like status code returned by a cloud client into the taxonomy.
    pub fn from_status(status: u16, kind: &str, name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            412 => Error::PreconditionFailed {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message,
            },
            429 | 500..=599 => Error::Cloud {
                status,
                message,
                retriable: true,
            },
            _ => Error::Cloud {
                status,
                message,
                retriable: false,
            },
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::ValidationError(message.into())
    }

    pub fn not_found(kind: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether the caller should simply re-run reconciliation.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::FinalizerError(_)
            | Error::NotFound { .. }
            | Error::PreconditionFailed { .. }
            | Error::Conflict { .. }
            | Error::Timeout(_)
            | Error::BatchAborted(_)
            | Error::IoError(_) => true,
            Error::Cloud { retriable, .. } => *retriable,
            Error::ValidationError(_)
            | Error::OwnershipConflict(_)
            | Error::ConfigError(_)
            | Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::TomlError(_) => false,
        }
    }

    /// True when the cached copy of the resource must be dropped before retrying.
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::PreconditionFailed { .. } | Error::Conflict { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Short stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::NotFound { .. } => "not_found",
            Error::PreconditionFailed { .. } => "precondition_failed",
            Error::Conflict { .. } => "conflict",
            Error::Cloud { .. } => "cloud",
            Error::ValidationError(_) => "validation",
            Error::OwnershipConflict(_) => "ownership",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) | Error::YamlError(_) | Error::TomlError(_) => {
                "serialization"
            }
            Error::IoError(_) => "io",
            Error::Timeout(_) => "timeout",
            Error::BatchAborted(_) => "batch_aborted",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match e {
            FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            Error::from_status(404, "LoadBalancer", "lb", ""),
            Error::NotFound { .. }
        ));
        let stale = Error::from_status(412, "LoadBalancer", "lb", "etag");
        assert!(stale.is_retriable());
        assert!(stale.invalidates_cache());
        assert!(Error::from_status(503, "PublicIP", "pip", "busy").is_retriable());
        assert!(!Error::from_status(400, "PublicIP", "pip", "bad").is_retriable());
    }

    #[test]
    fn validation_and_ownership_are_fatal() {
        assert!(!Error::validation("SCTP").is_retriable());
        assert!(!Error::OwnershipConflict("pls".into()).is_retriable());
        assert_eq!(Error::validation("x").kind(), "validation");
    }
}
