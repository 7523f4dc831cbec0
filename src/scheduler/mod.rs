//! Task scheduling substrate shared by the whole pipeline.
//!
//! Two kinds of work are supported:
//! - one-off tasks (`exec`) admitted to a bounded worker pool. When every
//!   worker is busy the submitter waits for a free slot, so there is never an
//!   unbounded backlog.
//! - periodic tasks (`schedule`) that run at a fixed rate on their own lane.
//!
//! Tasks that must never wait behind the pool go to `run_thread`, which starts
//! a dedicated OS thread. Every failure (error, panic, timeout) of every task
//! is delivered to the single [`ErrorHandler`] the scheduler was built with.

mod error_handler;
mod task;

pub use error_handler::{ErrorHandler, LoggingErrorHandler, TaskError};
pub use task::{Priority, TaskHandle, TaskOptions};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use crate::error::SchedulingError;

pub const DEFAULT_POOL_SIZE: usize = 16;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15);

/// How long `interrupt` waits for a task to acknowledge cancellation
const INTERRUPT_GRACE: Duration = Duration::from_millis(250);
/// How long `shutdown_now` waits for aborted tasks to unwind
const SHUTDOWN_NOW_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running one-off tasks
    pub pool_size: usize,
    /// Deadline applied to `exec` tasks launched with `with_timeout`
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Pooled,
    Periodic,
    Thread,
}

struct RunningTask {
    name: String,
    kind: TaskKind,
    daemon: bool,
    done: CancellationToken,
    abort: Option<AbortHandle>,
}

struct Inner {
    workers: Arc<Semaphore>,
    pool_size: usize,
    task_timeout: Duration,
    pooled: TaskTracker,
    periodic: TaskTracker,
    /// Parent of every task's cancellation token
    root: CancellationToken,
    /// Stops periodic loops from starting new runs
    periodic_stop: CancellationToken,
    running: DashMap<u64, RunningTask>,
    next_id: AtomicU64,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn report(&self, name: &str, result: Result<(), TaskError>) {
        match result {
            Ok(()) => {
                metrics::counter!("scheduler.tasks_completed_total").increment(1);
            }
            Err(e) => self.error_handler.handle(name, &e),
        }
    }
}

/// Shared, cheaply cloneable scheduler. Construct one per process and pass
/// clones to the components that need it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, error_handler: Arc<dyn ErrorHandler>) -> Self {
        let pool_size = config.pool_size.max(1);
        let root = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                task_timeout: config.task_timeout,
                pooled: TaskTracker::new(),
                periodic: TaskTracker::new(),
                periodic_stop: root.child_token(),
                root,
                running: DashMap::new(),
                next_id: AtomicU64::new(1),
                error_handler,
            }),
        }
    }

    /// Scheduler with default pool size and timeout that logs task failures
    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::default(), Arc::new(LoggingErrorHandler))
    }

    /// Run `task` every `period_secs` seconds, first after `initial_delay_secs`.
    ///
    /// Runs are fixed-rate: a run that overruns its period is followed
    /// immediately by the next one. A failing or panicking run is reported to
    /// the error handler and does not stop later runs.
    ///
    /// Returns `&Self` so several schedules can be chained.
    pub fn schedule<F, Fut>(
        &self,
        name: &str,
        initial_delay_secs: i64,
        period_secs: i64,
        task: F,
    ) -> Result<&Self, SchedulingError>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if initial_delay_secs < 0 {
            return Err(SchedulingError::InvalidParameter(format!(
                "initial delay must be 0 or higher, got {}",
                initial_delay_secs
            )));
        }
        if period_secs < 1 {
            return Err(SchedulingError::InvalidParameter(format!(
                "period must be 1 or higher, got {}",
                period_secs
            )));
        }
        if self.inner.periodic_stop.is_cancelled() {
            return Err(SchedulingError::ShutDown);
        }

        let period = Duration::from_secs(period_secs as u64);
        // The interval adds the period to the start instant on every tick
        let start = Instant::now()
            .checked_add(Duration::from_secs(initial_delay_secs as u64))
            .filter(|start| start.checked_add(period).is_some())
            .ok_or_else(|| {
                SchedulingError::InvalidParameter(format!(
                    "initial delay {}s with period {}s is out of range",
                    initial_delay_secs, period_secs
                ))
            })?;
        let id = self.inner.next_id();
        let stop = self.inner.periodic_stop.clone();
        let inner = Arc::clone(&self.inner);
        let task_name = name.to_string();

        self.inner.running.insert(
            id,
            RunningTask {
                name: task_name.clone(),
                kind: TaskKind::Periodic,
                daemon: false,
                done: CancellationToken::new(),
                abort: None,
            },
        );

        let join = self.inner.periodic.spawn(
            async move {
                let mut interval = tokio::time::interval_at(start, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
                let mut runs: u64 = 0;

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {}
                    }

                    runs += 1;
                    let started = std::time::Instant::now();
                    let result = run_guarded(task(), None, &stop).await;
                    metrics::histogram!("scheduler.periodic_run_seconds", "task" => task_name.clone())
                        .record(started.elapsed().as_secs_f64());
                    inner.report(&task_name, result);
                }

                debug!("Periodic task '{}' stopped after {} runs", task_name, runs);
                if let Some((_, entry)) = inner.running.remove(&id) {
                    entry.done.cancel();
                }
            }
            .instrument(tracing::info_span!("periodic", task = %name)),
        );

        if let Some(mut entry) = self.inner.running.get_mut(&id) {
            entry.abort = Some(join.abort_handle());
        }

        info!(
            "Scheduled '{}' every {}s (initial delay {}s)",
            name, period_secs, initial_delay_secs
        );
        Ok(self)
    }

    /// Run `task` once on the bounded worker pool.
    ///
    /// Waits for a free worker when the pool is saturated. The task receives a
    /// cancellation token it should observe to honour `interrupt`. With
    /// `options.with_timeout` the task is cancelled after the configured
    /// deadline and a [`TaskError::TimedOut`] is reported.
    pub async fn exec<F, Fut>(
        &self,
        options: TaskOptions,
        task: F,
    ) -> Result<TaskHandle, SchedulingError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permit = Arc::clone(&self.inner.workers)
            .acquire_owned()
            .await
            .map_err(|_| SchedulingError::ShutDown)?;

        let id = self.inner.next_id();
        let cancel = self.inner.root.child_token();
        let done = CancellationToken::new();
        let deadline = options.with_timeout.then_some(self.inner.task_timeout);

        self.inner.running.insert(
            id,
            RunningTask {
                name: options.name.clone(),
                kind: TaskKind::Pooled,
                daemon: options.daemon,
                done: done.clone(),
                abort: None,
            },
        );

        let span = tracing::info_span!(
            "task",
            name = %options.name,
            priority = options.priority.value(),
            daemon = options.daemon
        );
        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let task_done = done.clone();
        let task_name = options.name.clone();

        let fut = async move {
            // The permit is released before the task is marked done
            let _done = task_done.drop_guard();
            let _permit = permit;
            metrics::gauge!("scheduler.active_tasks").increment(1.0);

            let token = task_cancel.clone();
            let result = run_guarded(async move { task(token).await }, deadline, &task_cancel).await;

            metrics::gauge!("scheduler.active_tasks").decrement(1.0);
            inner.running.remove(&id);
            inner.report(&task_name, result);
        }
        .instrument(span);

        // Daemon tasks are not waited for on a graceful shutdown
        let join = if options.daemon {
            tokio::spawn(fut)
        } else {
            self.inner.pooled.spawn(fut)
        };

        if let Some(mut entry) = self.inner.running.get_mut(&id) {
            entry.abort = Some(join.abort_handle());
        }

        Ok(TaskHandle {
            id,
            name: options.name,
            cancel,
            done,
        })
    }

    /// Run a blocking `task` on a dedicated OS thread, bypassing the pool.
    ///
    /// The thread is named after the task and, on Linux, low priorities are
    /// applied as thread niceness. Non-daemon threads are waited for on
    /// graceful shutdown.
    pub fn run_thread<F>(&self, options: TaskOptions, task: F) -> Result<TaskHandle, SchedulingError>
    where
        F: FnOnce(CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        if self.inner.root.is_cancelled() {
            return Err(SchedulingError::ShutDown);
        }

        let id = self.inner.next_id();
        let cancel = self.inner.root.child_token();
        let done = CancellationToken::new();

        self.inner.running.insert(
            id,
            RunningTask {
                name: options.name.clone(),
                kind: TaskKind::Thread,
                daemon: options.daemon,
                done: done.clone(),
                abort: None,
            },
        );

        let inner = Arc::clone(&self.inner);
        let thread_cancel = cancel.clone();
        let thread_done = done.clone();
        let task_name = options.name.clone();
        let priority = options.priority;

        let spawned = std::thread::Builder::new()
            .name(options.name.replace('\0', ""))
            .spawn(move || {
                let _done = thread_done.drop_guard();
                apply_thread_priority(priority);

                let result = match std::panic::catch_unwind(AssertUnwindSafe(|| task(thread_cancel))) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TaskError::Failed(e)),
                    Err(payload) => Err(TaskError::from_panic(payload)),
                };

                inner.running.remove(&id);
                inner.report(&task_name, result);
            });

        if let Err(e) = spawned {
            self.inner.running.remove(&id);
            return Err(SchedulingError::ThreadSpawn(e.to_string()));
        }

        Ok(TaskHandle {
            id,
            name: options.name,
            cancel,
            done,
        })
    }

    /// Ask a running task to stop. Cancellation is cooperative: the task has to
    /// observe its token. Returns true if the task finished shortly after.
    pub async fn interrupt(&self, handle: &TaskHandle) -> bool {
        if handle.is_finished() {
            debug!("Task '{}' already finished, nothing to interrupt", handle.name);
            return false;
        }

        handle.cancel.cancel();
        let stopped = handle.join_timeout(INTERRUPT_GRACE).await;
        if stopped {
            info!("Interrupted task '{}'", handle.name);
        } else {
            warn!("Could not interrupt task '{}', it is still running", handle.name);
        }
        stopped
    }

    /// Stop accepting work and wait up to `timeout` for non-daemon tasks and
    /// the current periodic runs to finish. Returns true on a clean drain.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("Shutting down scheduler (timeout {:?})", timeout);
        self.inner.workers.close();
        self.inner.periodic_stop.cancel();
        self.inner.pooled.close();
        self.inner.periodic.close();

        let threads = self.non_daemon_threads();
        let drained = tokio::time::timeout(timeout, async {
            self.inner.pooled.wait().await;
            self.inner.periodic.wait().await;
            for done in threads {
                done.cancelled().await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!("Scheduler drained cleanly");
        } else {
            warn!(
                "Scheduler did not drain within {:?}; still running: {:?}",
                timeout,
                self.running_tasks()
            );
        }
        drained
    }

    /// Cancel every task, abort pooled and periodic ones, and report whether
    /// everything stopped within a short grace period. Dedicated threads can
    /// only be asked to stop.
    pub async fn shutdown_now(&self) -> bool {
        warn!("Forcing scheduler shutdown");
        self.inner.workers.close();
        self.inner.root.cancel();
        self.inner.pooled.close();
        self.inner.periodic.close();

        for entry in self.inner.running.iter() {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }

        let aborted = tokio::time::timeout(SHUTDOWN_NOW_GRACE, async {
            self.inner.pooled.wait().await;
            self.inner.periodic.wait().await;
        })
        .await
        .is_ok();

        let threads_left = self
            .non_daemon_threads()
            .iter()
            .filter(|done| !done.is_cancelled())
            .count();
        if threads_left > 0 {
            warn!("{} dedicated threads ignored the shutdown signal", threads_left);
        }

        aborted && threads_left == 0
    }

    /// Number of pool workers currently busy
    pub fn active(&self) -> usize {
        self.inner.pool_size - self.inner.workers.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Names of all tasks that have not finished yet
    pub fn running_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .running
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    fn non_daemon_threads(&self) -> Vec<CancellationToken> {
        self.inner
            .running
            .iter()
            .filter(|entry| entry.kind == TaskKind::Thread && !entry.daemon)
            .map(|entry| entry.done.clone())
            .collect()
    }
}

/// Drive a task future, converting errors, panics and deadline overruns into
/// a [`TaskError`]. On timeout the task's token is cancelled and the future
/// dropped.
async fn run_guarded<Fut>(
    fut: Fut,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), TaskError>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    let guarded = AssertUnwindSafe(fut).catch_unwind();
    let outcome = match deadline {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                return Err(TaskError::TimedOut(limit));
            }
        },
        None => guarded.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(payload) => Err(TaskError::from_panic(payload)),
    }
}

#[cfg(target_os = "linux")]
fn apply_thread_priority(priority: Priority) {
    let nice = priority.niceness();
    if nice == 0 {
        return;
    }
    // With PRIO_PROCESS and who = 0 Linux adjusts only the calling thread
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        debug!(
            "Could not set niceness {} for priority {}: {}",
            nice,
            priority,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_thread_priority(_priority: Priority) {}
