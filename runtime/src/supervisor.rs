//! Supervised background tasks with cooperative shutdown.
//!
//! ## Architecture
//!
//! - **[`TaskSupervisor`]**: owns named long-lived tasks in a `JoinSet`
//! - **[`ShutdownSignal`]**: cloneable `watch`-backed flag each task polls
//! - **[`wait_for_signal`]**: waits for SIGTERM or Ctrl+C
//!
//! Tasks are expected to observe the signal, finish their in-flight unit of
//! work and return. Tasks still running when the grace period ends are aborted.
//!
//! ## Usage
//!
//! ```ignore
//! let mut supervisor = TaskSupervisor::new();
//! let signal = supervisor.signal();
//! supervisor.spawn("rebuild-scheduler", scheduler.run(signal));
//!
//! wait_for_signal().await;
//! supervisor.shutdown(Duration::from_secs(30)).await?;
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{error, info, warn};

/// Cooperative shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a signal and the sender that fires it.
    #[must_use]
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested or the sender is gone.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`, returning early on shutdown.
    ///
    /// Returns `true` if shutdown was requested.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let interrupted = tokio::select! {
            () = tokio::time::sleep(duration) => false,
            () = self.wait() => true,
        };
        interrupted || self.is_shutdown()
    }
}

/// Owner of the process's long-lived background tasks.
pub struct TaskSupervisor {
    tasks: JoinSet<()>,
    names: HashMap<Id, String>,
    shutdown_tx: watch::Sender<bool>,
    signal: ShutdownSignal,
}

impl TaskSupervisor {
    /// Create a supervisor with no tasks.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, signal) = ShutdownSignal::channel();
        Self {
            tasks: JoinSet::new(),
            names: HashMap::new(),
            shutdown_tx,
            signal,
        }
    }

    /// Signal handed to supervised tasks.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Spawn a named task. Its error, if any, is logged.
    pub fn spawn<F, E>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = self.tasks.spawn(async move {
            match task.await {
                Ok(()) => info!(task = %task_name, "Task finished"),
                Err(e) => error!(task = %task_name, error = %e, "Task failed"),
            }
        });
        info!(task = %name, "Spawned supervised task");
        self.names.insert(handle.id(), name);
    }

    /// Number of tasks still tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Request shutdown and wait for every task, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the names of tasks that panicked or had to be aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), Vec<String>> {
        info!(tasks = self.tasks.len(), ?timeout, "Initiating graceful shutdown");
        if self.shutdown_tx.send(true).is_err() {
            warn!("No active shutdown signal receivers");
        }

        let mut failures = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(None) => break,
                Ok(Some(Ok((id, ())))) => {
                    self.names.remove(&id);
                }
                Ok(Some(Err(e))) => {
                    let name = self.names.remove(&e.id()).unwrap_or_default();
                    error!(task = %name, error = %e, "Task panicked");
                    failures.push(name);
                }
                Err(_) => {
                    warn!(remaining = self.tasks.len(), "Shutdown timed out, aborting tasks");
                    self.tasks.abort_all();
                    failures.extend(self.names.drain().map(|(_, name)| format!("{name}: timeout")));
                    break;
                }
            }
        }

        if failures.is_empty() {
            info!("All tasks shut down");
            Ok(())
        } else {
            error!(failed = failures.len(), "Shutdown completed with failures");
            Err(failures)
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGTERM or Ctrl+C.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_tasks_observe_signal() {
        let mut supervisor = TaskSupervisor::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let mut signal = supervisor.signal();
        let flag = Arc::clone(&stopped);
        supervisor.spawn("waiter", async move {
            signal.wait().await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        assert_eq!(supervisor.len(), 1);

        let result = supervisor.shutdown(Duration::from_secs(1)).await;
        assert!(result.is_ok());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let mut supervisor = TaskSupervisor::new();
        supervisor.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(())
        });

        let result = supervisor.shutdown(Duration::from_millis(20)).await;
        assert_eq!(result, Err(vec!["stuck: timeout".to_string()]));
    }

    #[tokio::test]
    async fn test_task_error_is_not_a_shutdown_failure() {
        let mut supervisor = TaskSupervisor::new();
        supervisor.spawn("failing", async { Err::<(), _>("boom") });
        assert!(supervisor.shutdown(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_signal_sleep_returns_early() {
        let (tx, mut signal) = ShutdownSignal::channel();
        tx.send(true).ok();
        assert!(signal.sleep(Duration::from_secs(3600)).await);
    }
}
