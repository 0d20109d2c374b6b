// Error handling framework
// Job-level errors are translated into state transitions by the runner;
// everything else is caught at the boundary of the operation that raised it.

use thiserror::Error;

/// Errors reported by the execution callback for a single attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Retryable according to the job's attempt budget
    #[error("Transient execution error: {0}")]
    Transient(String),

    /// Short-circuits the remaining attempts
    #[error("Permanent execution error: {0}")]
    Permanent(String),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),
}

impl ExecutionError {
    /// Whether another attempt may be made after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Permanent(_))
    }
}

/// Job repository errors. Fatal to the current dispatch cycle only.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Repository health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invariant violation for job {job_id}: {reason}")]
    InvariantViolation { job_id: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Runner lock backend errors. A busy lock is not an error.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Backend(String),

    #[error("Lock connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Lock {resource} is not owned by {owner_id}")]
    NotOwner { resource: String, owner_id: String },
}

/// Lease acquisition and renewal errors
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Lease request failed: {0}")]
    Request(String),

    #[error("Lease issuer rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Lease request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Issuer returned an invalid lease: {0}")]
    InvalidLease(String),

    #[error("A lease renewal is already in flight")]
    RenewalInProgress,

    #[error("No lease has been acquired")]
    NotAcquired,

    /// Grace period exhausted; only a fresh acquisition can recover
    #[error("Lease expired at {0} and the grace period is exhausted")]
    Exhausted(String),
}

impl LeaseError {
    /// Renewal failures that should simply be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LeaseError::Request(_) | LeaseError::Timeout(_) | LeaseError::Rejected { .. }
        )
    }
}

/// Errors that abort one dispatch cycle
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Runner lock ownership lost during cycle for owner {0}")]
    LockLost(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

// Implement From for common external errors
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Record not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RepositoryError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::Database(db_err) => RepositoryError::QueryFailed(db_err.message().to_string()),
            _ => RepositoryError::QueryFailed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for LeaseError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return LeaseError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return LeaseError::InvalidLease(err.to_string());
        }
        LeaseError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout(300);
        assert!(err.to_string().contains("300 seconds"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_permanent_error_is_not_retryable() {
        assert!(!ExecutionError::Permanent("bad stream key".into()).is_retryable());
        assert!(ExecutionError::Transient("ingest refused".into()).is_retryable());
    }

    #[test]
    fn test_lease_error_retryability() {
        assert!(LeaseError::Request("connection reset".into()).is_retryable());
        assert!(LeaseError::Timeout(5).is_retryable());
        assert!(!LeaseError::Exhausted("2024-01-01T00:00:00Z".into()).is_retryable());
        assert!(!LeaseError::RenewalInProgress.is_retryable());
    }

    #[test]
    fn test_scheduler_error_from_repository() {
        let err: SchedulerError = RepositoryError::QueryFailed("boom".into()).into();
        assert!(err.to_string().contains("boom"));
    }
}
