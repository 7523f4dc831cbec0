use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SchedulingError;

/// Task priority from 1 (lowest) to 10 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(2);
    pub const MID: Priority = Priority(5);
    pub const HIGH: Priority = Priority(9);

    pub fn new(value: u8) -> Result<Self, SchedulingError> {
        if !(1..=10).contains(&value) {
            return Err(SchedulingError::InvalidParameter(format!(
                "priority must be between 1 and 10, got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Niceness applied to dedicated threads on Linux.
    /// Unprivileged processes can only lower their priority, so anything at
    /// or above MID maps to the default niceness.
    pub(crate) fn niceness(self) -> i32 {
        (Priority::MID.0 as i32 - self.0 as i32).max(0) * 2
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MID
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Launch properties of a single unit of work.
///
/// Passed by value into every launch call, so two concurrent submissions can
/// never observe each other's name or priority.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub name: String,
    pub daemon: bool,
    pub priority: Priority,
    pub with_timeout: bool,
}

impl TaskOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            daemon: false,
            priority: Priority::default(),
            with_timeout: true,
        }
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, with_timeout: bool) -> Self {
        self.with_timeout = with_timeout;
        self
    }
}

/// Handle to a task launched with `exec` or `run_thread`
#[derive(Debug)]
pub struct TaskHandle {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) cancel: CancellationToken,
    pub(crate) done: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Whether an interrupt has been requested for this task
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the task has finished, whatever its outcome
    pub async fn join(&self) {
        self.done.cancelled().await;
    }

    /// Wait for the task to finish, giving up after `timeout`.
    /// Returns true if the task finished in time.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.done.cancelled())
            .await
            .is_ok()
    }
}
