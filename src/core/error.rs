use super::types::Eid;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by a storage adapter.
///
/// Any of them is fatal to the running transaction. `ConnectionLost` is the
/// only one the core reacts to, with a single reconnect-and-retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Validation error on entity {eid}: {}", format_errors(.errors))]
    Validation {
        eid: Eid,
        errors: BTreeMap<String, String>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(
        "no connections set available after {timeout:?} (pool size {size}); \
         the pool may be too small for the load or some transactions are never closed"
    )]
    PoolExhausted { size: usize, timeout: Duration },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unknown eid {0}")]
    UnknownEid(Eid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad connection id: {0}")]
    BadConnectionId(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl RepoError {
    /// Single-field validation error.
    pub fn validation(eid: Eid, field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.into(), message.into());
        Self::Validation { eid, errors }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Storage(StorageError::ConnectionLost(_)))
    }

    /// Errors that abort the whole transaction when raised from a hook.
    pub fn is_business_rule(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::Unauthorized(_))
    }
}

fn format_errors(errors: &BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(field, message)| format!("{}: {}", field, message))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, RepoError>;

impl<T> From<std::sync::PoisonError<T>> for RepoError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = RepoError::validation(42, "login", "required attribute");
        assert_eq!(
            err.to_string(),
            "Validation error on entity 42: login: required attribute"
        );
        assert!(err.is_business_rule());
    }

    #[test]
    fn test_pool_exhaustion_hints_at_leaks() {
        let err = RepoError::PoolExhausted {
            size: 4,
            timeout: Duration::from_secs(5),
        };
        let message = err.to_string();
        assert!(message.contains("pool size 4"));
        assert!(message.contains("never closed"));
    }

    #[test]
    fn test_connection_lost_detection() {
        let lost: RepoError = StorageError::ConnectionLost("server gone".into()).into();
        assert!(lost.is_connection_lost());

        let other: RepoError = StorageError::Constraint("unique".into()).into();
        assert!(!other.is_connection_lost());
    }
}
