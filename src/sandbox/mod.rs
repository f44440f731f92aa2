//! Per-container sandbox
//!
//! One sandbox owns one VM, its network attachments, its published-port
//! forwarders, the init process, and any exec processes. Every lifecycle
//! transition runs under a single lifecycle lock; the control server
//! answers the helper's request surface against it.

mod hosts;
mod logio;
mod sandbox;
mod server;
mod state;

pub use sandbox::{Sandbox, SandboxStdio, StopOptions};
pub use server::SandboxServer;
pub use state::SandboxState;
