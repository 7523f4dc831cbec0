use std::time::Duration;

/// Errors raised synchronously when a task is submitted to the [`crate::scheduler::Scheduler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// An argument (delay, period, priority) is outside its allowed range
    InvalidParameter(String),
    /// The scheduler has been shut down and no longer accepts work
    ShutDown,
    /// The operating system refused to start a dedicated worker thread
    ThreadSpawn(String),
}

impl std::fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            SchedulingError::ShutDown => write!(f, "Scheduler is shut down"),
            SchedulingError::ThreadSpawn(msg) => write!(f, "Failed to spawn worker thread: {}", msg),
        }
    }
}

impl std::error::Error for SchedulingError {}

/// Failure categories of the ingestion pipeline
///
/// Every variant has a fixed recovery policy:
/// - `Network`: the area or upload is skipped, the next cycle retries
/// - `MalformedRecord`: the record is skipped, the rest of the response is kept
/// - `Persistence`: the whole batch is rolled back and reported
/// - `Scheduling`: rejected at call time
/// - `Timeout`: the task was cancelled after its deadline
#[derive(Debug)]
pub enum PipelineError {
    Network(String),
    MalformedRecord(String),
    Persistence(anyhow::Error),
    Scheduling(SchedulingError),
    Timeout(Duration),
}

impl PipelineError {
    /// Short label used as a metrics tag
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Network(_) => "network",
            PipelineError::MalformedRecord(_) => "malformed_record",
            PipelineError::Persistence(_) => "persistence",
            PipelineError::Scheduling(_) => "scheduling",
            PipelineError::Timeout(_) => "timeout",
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Network(msg) => write!(f, "Network error: {}", msg),
            PipelineError::MalformedRecord(msg) => write!(f, "Malformed record: {}", msg),
            PipelineError::Persistence(e) => write!(f, "Persistence error: {:#}", e),
            PipelineError::Scheduling(e) => write!(f, "Scheduling error: {}", e),
            PipelineError::Timeout(d) => write!(f, "Timed out after {:?}", d),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Persistence(e) => Some(e.as_ref()),
            PipelineError::Scheduling(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SchedulingError> for PipelineError {
    fn from(e: SchedulingError) -> Self {
        PipelineError::Scheduling(e)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PipelineError::Network(format!("request timed out: {}", e))
        } else {
            PipelineError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_cause() {
        let err = PipelineError::Persistence(
            anyhow::anyhow!("duplicate key").context("Failed to commit batch"),
        );
        let text = err.to_string();
        assert!(text.contains("Failed to commit batch"));
        assert!(text.contains("duplicate key"));
        assert_eq!(err.kind(), "persistence");
    }

    #[test]
    fn test_scheduling_error_converts() {
        let err: PipelineError =
            SchedulingError::InvalidParameter("period must be 1 or higher".into()).into();
        assert_eq!(err.kind(), "scheduling");
        assert!(std::error::Error::source(&err).is_some());
    }
}
