//! Control-channel client

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::message::{MessageBag, Reply, Request, Route};
use super::transport::FramedSocket;

/// Default deadline for a control request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for `containerList`, which never crosses into a helper.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<(Reply, Vec<OwnedFd>)>>>;

/// A request/reply client over one framed connection.
///
/// Requests may be issued concurrently; a background task reads replies and
/// routes them to their callers by correlation id.
pub struct ControlClient {
    socket: Arc<FramedSocket>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl ControlClient {
    /// Connect to a control socket and start the reply reader.
    pub async fn connect(path: &Path) -> Result<Self> {
        let socket = Arc::new(FramedSocket::connect(path).await?);
        Ok(Self::attach(socket))
    }

    /// Wrap an already-connected socket.
    pub fn attach(socket: Arc<FramedSocket>) -> Self {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));

        let reader_socket = Arc::clone(&socket);
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            loop {
                match reader_socket.recv().await {
                    Ok(Some((body, fds))) => {
                        let reply: Reply = match serde_json::from_slice(&body) {
                            Ok(reply) => reply,
                            Err(e) => {
                                warn!("discarding malformed control reply: {}", e);
                                continue;
                            }
                        };
                        let waiter = reader_pending.lock().remove(&reply.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send((reply, fds));
                            }
                            None => debug!("no waiter for control reply {}", reply.id),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("control connection closed: {}", e);
                        break;
                    }
                }
            }
            // Fail everything still in flight.
            let orphans: Vec<_> = reader_pending.lock().drain().collect();
            drop(orphans);
        });

        Self {
            socket,
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Issue one request with the default 15 second deadline.
    pub async fn request(
        &self,
        route: Route,
        bag: MessageBag,
        fds: &[BorrowedFd<'_>],
    ) -> Result<(MessageBag, Vec<OwnedFd>)> {
        self.request_with_deadline(route, bag, fds, Some(self.deadline_for(route)))
            .await
    }

    /// Issue one request with no deadline; used for `containerWait`
    /// long-polls which resolve whenever the process exits.
    pub async fn request_unbounded(
        &self,
        route: Route,
        bag: MessageBag,
    ) -> Result<(MessageBag, Vec<OwnedFd>)> {
        self.request_with_deadline(route, bag, &[], None).await
    }

    fn deadline_for(&self, route: Route) -> Duration {
        match route {
            Route::ContainerList => LIST_TIMEOUT,
            _ => REQUEST_TIMEOUT,
        }
    }

    async fn request_with_deadline(
        &self,
        route: Route,
        bag: MessageBag,
        fds: &[BorrowedFd<'_>],
        deadline: Option<Duration>,
    ) -> Result<(MessageBag, Vec<OwnedFd>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = Request { id, route, bag };
        let body = serde_json::to_vec(&request)?;
        if let Err(e) = self.socket.send(&body, fds).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(Error::interrupted(format!(
                        "control request {:?} timed out after {:?}",
                        route, deadline
                    )));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok((reply, reply_fds)) => Ok((reply.into_result()?, reply_fds)),
            Err(_) => Err(Error::interrupted(
                "control connection closed before the reply arrived",
            )),
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::server::{RequestHandler, RequestOutcome};
    use async_trait::async_trait;
    use tokio::net::UnixStream;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            route: Route,
            bag: MessageBag,
            _fds: Vec<OwnedFd>,
        ) -> Result<RequestOutcome> {
            match route {
                Route::ContainerState => Ok(RequestOutcome::bag(bag)),
                _ => Err(Error::unsupported("echo handles containerState only")),
            }
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_pair() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let server = Arc::new(FramedSocket::new(server_end));
        let handler = Arc::new(Echo);
        tokio::spawn(crate::protocol::server::serve_connection(server, handler));

        let client = ControlClient::attach(Arc::new(FramedSocket::new(client_end)));

        let mut bag = MessageBag::new();
        bag.set_string("id", "c1");
        let (reply, fds) = client.request(Route::ContainerState, bag, &[]).await.unwrap();
        assert_eq!(reply.string("id").unwrap(), "c1");
        assert!(fds.is_empty());

        let err = client
            .request(Route::ContainerKill, MessageBag::new(), &[])
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Unsupported));
    }

    #[tokio::test]
    async fn test_closed_server_fails_pending() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let client = ControlClient::attach(Arc::new(FramedSocket::new(client_end)));

        // Server accepts one request and hangs up without replying.
        tokio::spawn(async move {
            let server = FramedSocket::new(server_end);
            let _ = server.recv().await;
        });

        let err = client
            .request(Route::ContainerState, MessageBag::new(), &[])
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Interrupted));
    }
}
