use std::time::Duration;

use tracing::error;

/// Reason a scheduled or executed task did not complete normally
#[derive(Debug)]
pub enum TaskError {
    /// The task returned an error
    Failed(anyhow::Error),
    /// The task panicked; the payload message is kept when it is a string
    Panicked(String),
    /// The task exceeded its deadline and was cancelled
    TimedOut(Duration),
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Failed(_) => "failed",
            TaskError::Panicked(_) => "panicked",
            TaskError::TimedOut(_) => "timed_out",
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked(message)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Failed(e) => write!(f, "task failed: {:#}", e),
            TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            TaskError::TimedOut(d) => write!(f, "task timed out after {:?} and was cancelled", d),
        }
    }
}

impl std::error::Error for TaskError {}

/// Receives every failure of every task run by a scheduler.
///
/// One handler is injected per scheduler; implementations must not block.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, task: &str, error: &TaskError);
}

/// Default handler: logs at error level (forwarded to Sentry when configured)
/// and counts failures by kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle(&self, task: &str, error: &TaskError) {
        error!(task = %task, kind = error.kind(), "{}", error);
        metrics::counter!("scheduler.task_errors_total", "kind" => error.kind()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_extraction() {
        let err = TaskError::from_panic(Box::new("boom"));
        assert!(matches!(err, TaskError::Panicked(ref m) if m == "boom"));

        let err = TaskError::from_panic(Box::new(String::from("owned boom")));
        assert!(matches!(err, TaskError::Panicked(ref m) if m == "owned boom"));

        let err = TaskError::from_panic(Box::new(42_u32));
        assert_eq!(err.kind(), "panicked");
    }

    #[test]
    fn test_timeout_display() {
        let err = TaskError::TimedOut(Duration::from_secs(15));
        assert_eq!(err.to_string(), "task timed out after 15s and was cancelled");
    }
}
