//! TCP forwarder: accept and splice

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Bind `host` and relay each accepted connection to its own upstream
/// connection at `upstream` until `token` fires.
pub async fn spawn(
    host: SocketAddr,
    upstream: SocketAddr,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(host)
        .await
        .map_err(|e| Error::wrap(format!("failed to bind {}", host), e))?;
    debug!("forwarding tcp {} -> {}", host, upstream);

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("tcp forwarder {} stopped", host);
                    return;
                }
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept on {} failed: {}", host, e);
                            continue;
                        }
                    };
                    trace!("tcp {} accepted {}", host, peer);
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = splice(conn, upstream, token).await {
                            trace!("tcp session {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }
    }))
}

async fn splice(
    mut conn: TcpStream,
    upstream: SocketAddr,
    token: CancellationToken,
) -> std::io::Result<()> {
    let mut remote = TcpStream::connect(upstream).await?;
    tokio::select! {
        _ = token.cancelled() => Ok(()),
        result = tokio::io::copy_bidirectional(&mut conn, &mut remote) => {
            result.map(|_| ())
        }
    }
}
