//! Waiter registry: pending wait-for-exit continuations per process id

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::types::ExitStatus;

enum WaitState {
    Pending(Vec<(u64, oneshot::Sender<ExitStatus>)>),
    Done(ExitStatus),
}

struct Inner {
    states: HashMap<String, WaitState>,
    next_token: u64,
}

/// Maps a process id to its pending waiters, then to its cached exit code.
///
/// Every waiter for an id observes the same `ExitStatus`; waiters arriving
/// after resolution get the cached code immediately. Resolution is
/// idempotent: the first code wins.
#[derive(Clone)]
pub struct WaiterRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                states: HashMap::new(),
                next_token: 0,
            })),
        }
    }

    /// Wait for `id` to exit. Cancellation-safe: dropping the future
    /// removes this waiter without resolving the others.
    pub async fn wait(&self, id: &str) -> ExitStatus {
        let (token, rx) = {
            let mut inner = self.inner.lock();
            match inner.states.get(id) {
                Some(WaitState::Done(status)) => return *status,
                _ => {}
            }
            let token = inner.next_token;
            inner.next_token += 1;
            let (tx, rx) = oneshot::channel();
            match inner
                .states
                .entry(id.to_string())
                .or_insert_with(|| WaitState::Pending(Vec::new()))
            {
                WaitState::Pending(waiters) => waiters.push((token, tx)),
                WaitState::Done(status) => return *status,
            }
            (token, rx)
        };

        let guard = WaiterGuard {
            registry: self.inner.clone(),
            id: id.to_string(),
            token,
            armed: true,
        };
        let status = rx.await;
        let mut guard = guard;
        guard.armed = false;
        match status {
            Ok(status) => status,
            // The registry was dropped wholesale; report a failed wait.
            Err(_) => ExitStatus::new(ExitStatus::WAIT_FAILED_CODE),
        }
    }

    /// Resolve every pending waiter for `id` and cache the code. Later
    /// resolutions for the same id are ignored.
    pub fn resolve(&self, id: &str, status: ExitStatus) {
        let waiters = {
            let mut inner = self.inner.lock();
            match inner.states.insert(id.to_string(), WaitState::Done(status)) {
                Some(WaitState::Done(first)) => {
                    // First resolution wins; restore it.
                    inner.states.insert(id.to_string(), WaitState::Done(first));
                    return;
                }
                Some(WaitState::Pending(waiters)) => waiters,
                None => Vec::new(),
            }
        };
        debug!(
            "resolved {} waiter(s) for {} with code {}",
            waiters.len(),
            id,
            status.code
        );
        for (_, tx) in waiters {
            let _ = tx.send(status);
        }
    }

    /// The cached exit status, when `id` has already exited.
    pub fn cached(&self, id: &str) -> Option<ExitStatus> {
        match self.inner.lock().states.get(id) {
            Some(WaitState::Done(status)) => Some(*status),
            _ => None,
        }
    }

    /// Drop any record of `id`, pending or cached.
    pub fn forget(&self, id: &str) {
        self.inner.lock().states.remove(id);
    }
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct WaiterGuard {
    registry: Arc<Mutex<Inner>>,
    id: String,
    token: u64,
    armed: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.registry.lock();
        if let Some(WaitState::Pending(waiters)) = inner.states.get_mut(&self.id) {
            waiters.retain(|(token, _)| *token != self.token);
        }
    }
}
