//! Exit monitor: at-most-once exit fan-out per tracked process

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::ExitStatus;

/// Completion handler invoked with the process id and its exit status.
pub type ExitHandler =
    Box<dyn FnOnce(String, ExitStatus) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Entry {
    on_exit: ExitHandler,
    task: Option<JoinHandle<()>>,
}

/// Supervises the terminal wait of each tracked process id.
///
/// `register_process` reserves the id and installs the handler;
/// `track` attaches the long-running wait and spawns the supervising task;
/// `stop_tracking` cancels and drops the entry. The handler fires at most
/// once per registration, regardless of how the race between resolution and
/// cancellation goes.
pub struct ExitMonitor {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ExitMonitor {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve `id` and install its completion handler. Fails with `Exists`
    /// when the id is already registered.
    pub fn register_process(&self, id: &str, on_exit: ExitHandler) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Err(Error::exists(format!(
                "process {} is already registered with the exit monitor",
                id
            )));
        }
        entries.insert(
            id.to_string(),
            Entry {
                on_exit,
                task: None,
            },
        );
        Ok(())
    }

    /// Attach the wait future for a registered id and start supervising it.
    ///
    /// A wait that fails or panics is reported as `ExitStatus{code: 255}`.
    pub fn track<F>(self: &Arc<Self>, id: &str, wait: F) -> Result<()>
    where
        F: Future<Output = Result<ExitStatus>> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or_else(|| {
            Error::not_found(format!("process {} is not registered with the exit monitor", id))
        })?;
        if entry.task.is_some() {
            return Err(Error::exists(format!("process {} is already tracked", id)));
        }

        let monitor = Arc::clone(self);
        let id_owned = id.to_string();
        entry.task = Some(tokio::spawn(async move {
            // An inner task so a panicking wait handler surfaces as a
            // JoinError instead of tearing down the supervisor.
            let status = match tokio::spawn(wait).await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    warn!("wait handler for {} failed: {}", id_owned, err);
                    ExitStatus::new(ExitStatus::WAIT_FAILED_CODE)
                }
                Err(join_err) => {
                    warn!("wait handler for {} panicked: {}", id_owned, join_err);
                    ExitStatus::new(ExitStatus::WAIT_FAILED_CODE)
                }
            };
            monitor.fire(&id_owned, status).await;
        }));
        Ok(())
    }

    /// Stop supervising `id`. Idempotent; a no-op once the exit has fired.
    pub fn stop_tracking(&self, id: &str) {
        let entry = self.entries.lock().remove(id);
        if let Some(entry) = entry {
            if let Some(task) = entry.task {
                task.abort();
            }
            debug!("stopped tracking {}", id);
        }
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Remove the entry and run its handler. Removing under the lock and
    /// invoking outside it is the at-most-once barrier: whichever of
    /// resolution and `stop_tracking` takes the entry first wins, and a
    /// handler that itself calls `stop_tracking` finds nothing left.
    async fn fire(&self, id: &str, status: ExitStatus) {
        let entry = self.entries.lock().remove(id);
        if let Some(entry) = entry {
            debug!("process {} exited with code {}", id, status.code);
            (entry.on_exit)(id.to_string(), status).await;
        }
    }
}

impl Default for ExitMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn counting_handler(
        counter: Arc<AtomicUsize>,
        tx: oneshot::Sender<ExitStatus>,
    ) -> ExitHandler {
        Box::new(move |_id, status| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(status);
            })
        })
    }

    #[tokio::test]
    async fn test_exit_fires_exactly_once() {
        let monitor = Arc::new(ExitMonitor::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        monitor
            .register_process("p1", counting_handler(fired.clone(), tx))
            .unwrap();
        monitor
            .track("p1", async { Ok(ExitStatus::new(0)) })
            .unwrap();

        let status = rx.await.unwrap();
        assert_eq!(status.code, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_tracked("p1"));

        // Late stop_tracking is a no-op.
        monitor.stop_tracking("p1");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let monitor = Arc::new(ExitMonitor::new());
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let counter = Arc::new(AtomicUsize::new(0));

        monitor
            .register_process("p1", counting_handler(counter.clone(), tx1))
            .unwrap();
        let err = monitor
            .register_process("p1", counting_handler(counter, tx2))
            .unwrap_err();
        assert!(err.is_kind(crate::error::ErrorKind::Exists));
    }

    #[tokio::test]
    async fn test_stop_tracking_before_resolution_suppresses_handler() {
        let monitor = Arc::new(ExitMonitor::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = oneshot::channel();

        monitor
            .register_process("p1", counting_handler(fired.clone(), tx))
            .unwrap();
        monitor
            .track("p1", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ExitStatus::new(0))
            })
            .unwrap();

        monitor.stop_tracking("p1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_tracked("p1"));
    }

    #[tokio::test]
    async fn test_removal_before_track_is_legal() {
        let monitor = Arc::new(ExitMonitor::new());
        let (tx, _rx) = oneshot::channel();
        let counter = Arc::new(AtomicUsize::new(0));

        monitor
            .register_process("p1", counting_handler(counter, tx))
            .unwrap();
        monitor.stop_tracking("p1");
        assert!(!monitor.is_tracked("p1"));

        // Tracking after removal fails cleanly.
        let err = monitor
            .track("p1", async { Ok(ExitStatus::new(0)) })
            .unwrap_err();
        assert!(err.is_kind(crate::error::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_failed_wait_reports_255() {
        let monitor = Arc::new(ExitMonitor::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        monitor
            .register_process("p1", counting_handler(fired, tx))
            .unwrap();
        monitor
            .track("p1", async { Err(Error::internal("vm went away")) })
            .unwrap();

        let status = rx.await.unwrap();
        assert_eq!(status.code, ExitStatus::WAIT_FAILED_CODE);
    }

    #[tokio::test]
    async fn test_panicking_wait_reports_255() {
        let monitor = Arc::new(ExitMonitor::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        monitor
            .register_process("p1", counting_handler(fired, tx))
            .unwrap();
        monitor
            .track("p1", async { panic!("wait handler blew up") })
            .unwrap();

        let status = rx.await.unwrap();
        assert_eq!(status.code, ExitStatus::WAIT_FAILED_CODE);
    }
}
