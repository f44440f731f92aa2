//! Control channel
//!
//! Request/reply message passing between the CLI, the API daemon, and the
//! per-container sandbox helpers. Messages carry a route opcode, a
//! string-keyed bag of typed values, and up to three passed file handles
//! riding `SCM_RIGHTS` on a UNIX socket.

mod client;
mod message;
mod server;
mod transport;

pub use client::{ControlClient, LIST_TIMEOUT, REQUEST_TIMEOUT};
pub use message::{MessageBag, Reply, Request, Route, Value, WireError};
pub use server::{bind, serve, serve_connection, RequestHandler, RequestOutcome};
pub use transport::FramedSocket;
