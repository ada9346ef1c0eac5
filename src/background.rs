use std::fmt::Display;
use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A best-effort computation running on the runtime.
///
/// The result is delivered at most once. Failures are logged and never reach the
/// caller. Dropping the handle aborts the task, so a caller that moves on simply
/// stops waiting.
pub struct BackgroundTask<T> {
    label: &'static str,
    handle: JoinHandle<()>,
    result: oneshot::Receiver<T>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F, E>(label: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            match future.await {
                Ok(value) => {
                    if tx.send(value).is_err() {
                        debug!("{} finished after its receiver was dropped", label);
                    }
                }
                Err(e) => warn!("{} failed: {}", label, e),
            }
        });
        Self {
            label,
            handle,
            result: rx,
        }
    }
}

impl<T> BackgroundTask<T> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Takes the result if it is already there.
    pub fn try_take(&mut self) -> Option<T> {
        self.result.try_recv().ok()
    }

    /// Waits for the result. `None` if the computation failed or was aborted.
    pub async fn wait(mut self) -> Option<T> {
        (&mut self.result).await.ok()
    }

    pub fn cancel(self) {
        debug!("Cancelling {}", self.label);
    }
}

impl<T> Drop for BackgroundTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_successful_result() {
        let task = BackgroundTask::spawn("answer", async { Ok::<_, String>(42u64) });
        assert_eq!(task.wait().await, Some(42));
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let task = BackgroundTask::<u64>::spawn("broken", async { Err("boom".to_string()) });
        assert_eq!(task.wait().await, None);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_work() {
        let (tx, rx) = oneshot::channel::<()>();
        let task = BackgroundTask::spawn("slow", async move {
            let _guard = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(())
        });

        task.cancel();

        // The sender inside the aborted task is dropped with it.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_try_take_before_completion_is_empty() {
        let mut task = BackgroundTask::spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, String>(1u8)
        });
        assert_eq!(task.try_take(), None);
        assert!(!task.is_finished());
    }
}
