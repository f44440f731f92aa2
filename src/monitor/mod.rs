//! Process exit supervision
//!
//! The exit monitor owns one supervising task per tracked process id and
//! fans its terminal status out to a completion handler exactly once. The
//! waiter registry holds pending wait-for-exit continuations and caches the
//! code once a process has exited.

mod exit;
mod waiter;

pub use exit::{ExitHandler, ExitMonitor};
pub use waiter::WaiterRegistry;
