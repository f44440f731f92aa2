//! Framed UNIX-socket transport with descriptor passing
//!
//! A frame is a 4-byte little-endian body length followed by a JSON body.
//! Passed file handles ride `SCM_RIGHTS` on the sendmsg that carries the
//! frame's first byte and attach to the frame being received.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use bytes::{Buf, BytesMut};
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Upper bound on a frame body; anything larger is a protocol violation.
const MAX_FRAME_LEN: usize = 16 << 20;

/// Most descriptors one frame may carry.
pub const MAX_FRAME_FDS: usize = 8;

struct ReadState {
    buf: BytesMut,
    fds: Vec<OwnedFd>,
}

/// One framed control-channel connection.
///
/// Reads are serialized behind one mutex and writes behind another, so a
/// single reader task can run while request tasks send replies.
pub struct FramedSocket {
    stream: UnixStream,
    read: Mutex<ReadState>,
    write: Mutex<()>,
}

impl FramedSocket {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            read: Mutex::new(ReadState {
                buf: BytesMut::with_capacity(16 * 1024),
                fds: Vec::new(),
            }),
            write: Mutex::new(()),
        }
    }

    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            Error::wrap(format!("failed to connect to {}", path.display()), e)
        })?;
        Ok(Self::new(stream))
    }

    /// Send one frame. The descriptors are duplicated into the peer; the
    /// caller keeps ownership of its own copies.
    pub async fn send(&self, body: &[u8], fds: &[BorrowedFd<'_>]) -> Result<()> {
        if body.len() > MAX_FRAME_LEN {
            return Err(Error::invalid_argument(format!(
                "frame body of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_FRAME_LEN
            )));
        }
        if fds.len() > MAX_FRAME_FDS {
            return Err(Error::invalid_argument(format!(
                "frame carries {} descriptors, limit is {}",
                fds.len(),
                MAX_FRAME_FDS
            )));
        }

        let _guard = self.write.lock().await;

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);

        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let mut offset = 0usize;
        let mut fds_pending = !raw.is_empty();

        while offset < frame.len() {
            self.stream
                .writable()
                .await
                .map_err(|e| Error::wrap("control socket became unwritable", e))?;

            let attempt = self.stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&frame[offset..])];
                let cmsg_storage;
                let cmsgs: &[ControlMessage] = if fds_pending {
                    cmsg_storage = [ControlMessage::ScmRights(&raw)];
                    &cmsg_storage
                } else {
                    &[]
                };
                sendmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &iov,
                    cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(io::Error::from)
            });

            match attempt {
                Ok(written) => {
                    if written > 0 {
                        fds_pending = false;
                    }
                    offset += written;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::wrap("control socket write failed", e)),
            }
        }

        Ok(())
    }

    /// Receive the next frame, or `None` on a clean peer close.
    pub async fn recv(&self) -> Result<Option<(Vec<u8>, Vec<OwnedFd>)>> {
        let mut state = self.read.lock().await;

        loop {
            if state.buf.len() >= 4 {
                let len = u32::from_le_bytes([
                    state.buf[0],
                    state.buf[1],
                    state.buf[2],
                    state.buf[3],
                ]) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(Error::internal(format!(
                        "peer announced an oversized {} byte frame",
                        len
                    )));
                }
                if state.buf.len() >= 4 + len {
                    let mut frame = state.buf.split_to(4 + len);
                    frame.advance(4);
                    let fds = std::mem::take(&mut state.fds);
                    return Ok(Some((frame.to_vec(), fds)));
                }
            }

            self.stream
                .readable()
                .await
                .map_err(|e| Error::wrap("control socket became unreadable", e))?;

            let mut chunk = [0u8; 16 * 1024];
            let attempt = self.stream.try_io(Interest::READABLE, || {
                let mut cmsg_buf = cmsg_space!([RawFd; MAX_FRAME_FDS]);
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let msg = recvmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                let mut received = Vec::new();
                let cmsgs = msg.cmsgs().map_err(io::Error::from)?;
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            received.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                Ok((msg.bytes, received))
            });

            match attempt {
                Ok((0, received)) if received.is_empty() => {
                    if state.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::interrupted(
                        "peer closed the control socket mid-frame",
                    ));
                }
                Ok((n, received)) => {
                    state.buf.extend_from_slice(&chunk[..n]);
                    state.fds.extend(received);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::wrap("control socket read failed", e)),
            }
        }
    }
}
