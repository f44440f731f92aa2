//! Workload I/O fan-out
//!
//! The guest writes its stdout/stderr into a pipe owned by the sandbox; a
//! pump duplicates every chunk to the per-container `stdio.log`, the
//! caller-provided handle when one was attached, and the live stream pool,
//! so `logs` and attached clients observe the same bytes.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::system::StreamPool;

/// Build the write end handed to the VM and start the pump for one stream.
///
/// The pump runs on a blocking thread and ends when the guest side closes
/// the pipe.
pub fn start_pump(
    log_path: &Path,
    caller: Option<OwnedFd>,
    pool: StreamPool,
) -> Result<OwnedFd> {
    let (reader, writer) = std::io::pipe().map_err(|e| Error::wrap("stdio pipe", e))?;

    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| Error::wrap(format!("failed to open {}", log_path.display()), e))?;
    let mut caller = caller.map(std::fs::File::from);
    let log_path = log_path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 16 * 1024];
        loop {
            let len = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stdio pump for {} failed: {}", log_path.display(), e);
                    break;
                }
            };
            let chunk = &buf[..len];
            if let Err(e) = log.write_all(chunk) {
                debug!("log write to {} failed: {}", log_path.display(), e);
            }
            if let Some(out) = caller.as_mut() {
                if out.write_all(chunk).is_err() {
                    // The attached client went away; keep logging.
                    caller = None;
                }
            }
            pool.publish(Bytes::copy_from_slice(chunk));
        }
        let _ = log.flush();
        trace!("stdio pump for {} ended", log_path.display());
    });

    Ok(OwnedFd::from(writer))
}

/// Open a log file for reading, to be passed back over the control channel.
pub fn open_log(path: &Path) -> Result<OwnedFd> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| Error::wrap(format!("failed to open {}", path.display()), e))?;
    Ok(OwnedFd::from(file))
}
