//! System utilities module
//!
//! Lifecycle locking and byte-stream fan-out shared by the sandbox and the
//! orchestrator.

mod lock;
mod stream;

pub use lock::{LifecycleGuard, LifecycleLock, LockError};
pub use stream::StreamPool;
