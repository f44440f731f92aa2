//! Virtual machine backend abstraction
//!
//! Trait-based seam between the sandbox and the hypervisor. Production
//! backends (Virtualization.framework and friends) plug in as runtime
//! handler plugins; the in-tree fake drives the sandbox in tests.

mod traits;

#[cfg(test)]
pub(crate) mod fake;

pub use traits::{
    GuestMount, GuestStdio, InterfaceConfiguration, SocketAttachment, TerminalSize,
    VirtualMachine, VirtualMachineFactory, VmConfiguration,
};

use std::sync::Arc;

use crate::error::{Error, Result};

/// Resolve the hypervisor backend for a runtime handler.
///
/// Backends are linked in by the platform build; a build without one
/// cannot boot sandboxes and says so instead of failing later.
pub fn platform_factory(handler: &str) -> Result<Arc<dyn VirtualMachineFactory>> {
    Err(Error::unsupported(format!(
        "no virtual machine backend for runtime handler {} in this build",
        handler
    )))
}
