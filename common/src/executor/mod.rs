// Executor module for job execution
// The runner hands each dispatched job's payload to a `JobExecutor`; the
// platform-specific publishing mechanics live behind this trait.

pub mod pipeline;

pub use pipeline::{PipelinePayload, PipelineSummary};

use crate::errors::ExecutionError;
use async_trait::async_trait;
use tracing::{info, instrument};

/// Execution callback invoked once per attempt. Implementations must not
/// keep references to job state beyond the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job_id: &str, payload: &serde_json::Value) -> Result<(), ExecutionError>;
}

/// Default executor for the binary: renders the publishing pipeline the job
/// describes and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExecutor;

#[async_trait]
impl JobExecutor for LoggingExecutor {
    #[instrument(skip(self, payload))]
    async fn execute(&self, job_id: &str, payload: &serde_json::Value) -> Result<(), ExecutionError> {
        let pipeline = PipelinePayload::from_value(payload)?;
        info!(pipeline = %pipeline.summary(), "Starting publishing pipeline");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_executor_accepts_object_payload() {
        let payload = serde_json::json!({ "destination": { "endpoint": "rtmp://a/b" } });
        assert!(LoggingExecutor.execute("job-1", &payload).await.is_ok());
    }

    #[tokio::test]
    async fn test_logging_executor_rejects_malformed_payload() {
        let payload = serde_json::json!("rtmp://a/b");
        let err = LoggingExecutor.execute("job-1", &payload).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Permanent(_)));
    }
}
