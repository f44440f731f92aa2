//! Containers orchestrator
//!
//! The directory of containers and their persistent bundles: create,
//! restore at boot, proxy control calls to sandbox helpers, track
//! per-container liveness through the exit monitor, and enforce
//! create/delete/stop ordering under the orchestrator lock.

mod bundle;
mod orchestrator;
mod runtime;

pub use bundle::{clone_filesystem, Bundle, CreateOptions};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub(crate) use orchestrator::dir_size;
pub use runtime::{RuntimeHandler, RuntimeRegistry};
