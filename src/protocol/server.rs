//! Control-channel server loop

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::message::{MessageBag, Reply, Request, Route};
use super::transport::FramedSocket;

/// What a handler produced for one request: a value bag plus any file
/// handles the reply should pass back.
pub struct RequestOutcome {
    pub bag: MessageBag,
    pub fds: Vec<OwnedFd>,
}

impl RequestOutcome {
    pub fn empty() -> Self {
        Self {
            bag: MessageBag::new(),
            fds: Vec::new(),
        }
    }

    pub fn bag(bag: MessageBag) -> Self {
        Self {
            bag,
            fds: Vec::new(),
        }
    }

    pub fn with_fds(bag: MessageBag, fds: Vec<OwnedFd>) -> Self {
        Self { bag, fds }
    }
}

/// Dispatches one decoded request.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        route: Route,
        bag: MessageBag,
        fds: Vec<OwnedFd>,
    ) -> Result<RequestOutcome>;
}

/// Accept connections until `shutdown` fires, serving each on its own task.
pub async fn serve(
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("control listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let socket = Arc::new(FramedSocket::new(stream));
                        tokio::spawn(serve_connection(socket, Arc::clone(&handler)));
                    }
                    Err(e) => {
                        warn!("control accept failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Serve one connection: decode frames, run each request on its own task so
/// a long-poll `wait` does not block later requests, reply with preserved
/// correlation ids.
pub async fn serve_connection(socket: Arc<FramedSocket>, handler: Arc<dyn RequestHandler>) {
    loop {
        let (body, fds) = match socket.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!("control connection error: {}", e);
                return;
            }
        };

        let request: Request = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!("discarding malformed control request: {}", e);
                continue;
            }
        };

        let socket = Arc::clone(&socket);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let id = request.id;
            let route = request.route;
            let reply = match handler.handle(route, request.bag, fds).await {
                Ok(outcome) => (Reply::for_request(id, outcome.bag), outcome.fds),
                Err(err) => {
                    debug!("request {:?} failed: {}", route, err);
                    (Reply::for_error(id, &err), Vec::new())
                }
            };

            let (reply, reply_fds) = reply;
            let body = match serde_json::to_vec(&reply) {
                Ok(body) => body,
                Err(e) => {
                    warn!("failed to encode reply for {:?}: {}", route, e);
                    return;
                }
            };
            let borrowed: Vec<_> = reply_fds.iter().map(|fd| fd.as_fd()).collect();
            if let Err(e) = socket.send(&body, &borrowed).await {
                debug!("failed to send reply for {:?}: {}", route, e);
            }
        });
    }
}

/// Bind a control listener, replacing a stale socket file left by a
/// previous process.
pub fn bind(path: &std::path::Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| Error::wrap(format!("failed to remove stale socket {}", path.display()), e))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
        .map_err(|e| Error::wrap(format!("failed to bind control socket {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlClient;

    struct Slow;

    #[async_trait]
    impl RequestHandler for Slow {
        async fn handle(
            &self,
            route: Route,
            _bag: MessageBag,
            _fds: Vec<OwnedFd>,
        ) -> Result<RequestOutcome> {
            match route {
                Route::ContainerWait => {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    let mut bag = MessageBag::new();
                    bag.set_i64("code", 0);
                    Ok(RequestOutcome::bag(bag))
                }
                Route::ContainerState => {
                    let mut bag = MessageBag::new();
                    bag.set_string("status", "running");
                    Ok(RequestOutcome::bag(bag))
                }
                _ => Err(Error::unsupported("not handled")),
            }
        }
    }

    #[tokio::test]
    async fn test_long_poll_does_not_block_other_requests() {
        let (client_end, server_end) = tokio::net::UnixStream::pair().unwrap();
        tokio::spawn(serve_connection(
            Arc::new(FramedSocket::new(server_end)),
            Arc::new(Slow),
        ));
        let client = Arc::new(ControlClient::attach(Arc::new(FramedSocket::new(
            client_end,
        ))));

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .request_unbounded(Route::ContainerWait, MessageBag::new())
                    .await
            })
        };

        // The state query resolves while the wait is still pending.
        let (bag, _) = client
            .request(Route::ContainerState, MessageBag::new(), &[])
            .await
            .unwrap();
        assert_eq!(bag.string("status").unwrap(), "running");

        let (bag, _) = waiter.await.unwrap().unwrap();
        assert_eq!(bag.i64("code").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");

        let first = bind(&path).unwrap();
        drop(first);
        // The socket file is left behind; bind must clean it up.
        assert!(path.exists());
        let _second = bind(&path).unwrap();
    }
}
