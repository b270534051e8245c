//! Periodic background commands (§4.F `backgroundExecute`/`stopBackground`).
//!
//! At most one [`BackgroundTask`] exists per connection; starting a new one
//! replaces and stops the prior timer. The task's own tick loop dereferences
//! the connection id each time and exits once the connection leaves
//! `connected`, rather than holding a reference back to the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// A periodic command bound to a connection.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub connection_id: String,
    pub command: String,
    pub interval_ms: u64,
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

struct RunningTask {
    task: BackgroundTask,
    handle: JoinHandle<()>,
}

/// Tracks at most one running [`BackgroundTask`] per connection id.
#[derive(Default, Clone)]
pub struct BackgroundExecutor {
    tasks: Arc<Mutex<HashMap<String, RunningTask>>>,
}

impl BackgroundExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a background task for `connection_id`, replacing any existing one.
    ///
    /// `run_once` is invoked immediately and then every `interval_ms` while
    /// `still_connected` returns true; invocation errors are recorded on the
    /// task record but never stop the timer.
    pub async fn start<F, Fut, C, CFut>(
        &self,
        connection_id: &str,
        command: &str,
        interval_ms: u64,
        run_once: F,
        still_connected: C,
    ) where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
        C: Fn(String) -> CFut + Send + Sync + 'static,
        CFut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.stop(connection_id).await;

        let task = BackgroundTask {
            connection_id: connection_id.to_string(),
            command: command.to_string(),
            interval_ms,
            last_check: None,
            last_error: None,
        };

        let tasks = self.tasks.clone();
        let conn_id = connection_id.to_string();
        let cmd = command.to_string();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                interval.tick().await;
                if !still_connected(conn_id.clone()).await {
                    break;
                }
                let result = run_once(cmd.clone()).await;
                let mut tasks = tasks.lock().await;
                if let Some(running) = tasks.get_mut(&conn_id) {
                    running.task.last_check = Some(chrono::Utc::now());
                    match result {
                        Ok(()) => running.task.last_error = None,
                        Err(err) => {
                            warn!(connection_id = %conn_id, error = %err, "background task tick failed");
                            running.task.last_error = Some(err);
                        }
                    }
                } else {
                    break;
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.insert(connection_id.to_string(), RunningTask { task, handle });
    }

    /// Idempotent stop: aborts the timer and removes the record, if any.
    pub async fn stop(&self, connection_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(running) = tasks.remove(connection_id) {
            running.handle.abort();
        }
    }

    pub async fn get(&self, connection_id: &str) -> Option<BackgroundTask> {
        let tasks = self.tasks.lock().await;
        tasks.get(connection_id).map(|r| r.task.clone())
    }

    pub async fn list(&self) -> Vec<BackgroundTask> {
        let tasks = self.tasks.lock().await;
        tasks.values().map(|r| r.task.clone()).collect()
    }

    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, running) in tasks.drain() {
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn starting_replaces_prior_task() {
        let executor = BackgroundExecutor::new();
        executor
            .start(
                "c1",
                "echo a",
                3600_000,
                |_| async { Ok(()) },
                |_| async { true },
            )
            .await;
        executor
            .start(
                "c1",
                "echo b",
                3600_000,
                |_| async { Ok(()) },
                |_| async { true },
            )
            .await;
        let task = executor.get("c1").await.unwrap();
        assert_eq!(task.command, "echo b");
        assert_eq!(executor.list().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let executor = BackgroundExecutor::new();
        executor.stop("missing").await;
        executor
            .start(
                "c1",
                "echo a",
                3600_000,
                |_| async { Ok(()) },
                |_| async { true },
            )
            .await;
        executor.stop("c1").await;
        executor.stop("c1").await;
        assert!(executor.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn ticks_run_immediately_and_record_errors() {
        let executor = BackgroundExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        executor
            .start(
                "c1",
                "fail",
                10,
                move |_| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("boom".to_string())
                    }
                },
                |_| async { true },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = executor.get("c1").await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        executor.stop_all().await;
    }

    #[tokio::test]
    async fn timer_stops_when_connection_leaves_connected() {
        let executor = BackgroundExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        executor
            .start(
                "c1",
                "echo a",
                10,
                move |_| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                |_| async { false },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
