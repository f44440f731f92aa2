//! UDP forwarder: per-client sessions with idle eviction

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Sessions with no traffic in either direction for this long are evicted.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_DATAGRAM: usize = 64 * 1024;

/// Bind `host` and relay datagrams to `upstream`, one ephemeral socket per
/// `(client address, client port)`, until `token` fires.
pub async fn spawn(
    host: SocketAddr,
    upstream: SocketAddr,
    token: CancellationToken,
    idle: Duration,
) -> Result<JoinHandle<()>> {
    let listener = Arc::new(
        UdpSocket::bind(host)
            .await
            .map_err(|e| Error::wrap(format!("failed to bind {}", host), e))?,
    );
    debug!("forwarding udp {} -> {}", host, upstream);

    Ok(tokio::spawn(async move {
        let sessions: Arc<DashMap<SocketAddr, Arc<UdpSocket>>> = Arc::new(DashMap::new());
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, client) = tokio::select! {
                _ = token.cancelled() => {
                    debug!("udp forwarder {} stopped", host);
                    return;
                }
                received = listener.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("recv on {} failed: {}", host, e);
                        continue;
                    }
                }
            };

            let session = match sessions.get(&client) {
                Some(existing) => Arc::clone(existing.value()),
                None => {
                    let bind_addr: SocketAddr = if upstream.is_ipv4() {
                        "0.0.0.0:0".parse().unwrap_or(upstream)
                    } else {
                        "[::]:0".parse().unwrap_or(upstream)
                    };
                    let socket = match UdpSocket::bind(bind_addr).await {
                        Ok(socket) => Arc::new(socket),
                        Err(e) => {
                            warn!("udp session socket for {} failed: {}", client, e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.connect(upstream).await {
                        warn!("udp connect {} failed: {}", upstream, e);
                        continue;
                    }
                    sessions.insert(client, Arc::clone(&socket));
                    trace!("udp {} opened session for {}", host, client);
                    spawn_session_reader(
                        Arc::clone(&socket),
                        Arc::clone(&listener),
                        Arc::clone(&sessions),
                        client,
                        token.child_token(),
                        idle,
                    );
                    socket
                }
            };

            if let Err(e) = session.send(&buf[..len]).await {
                trace!("udp relay to {} failed: {}", upstream, e);
                sessions.remove(&client);
            }
        }
    }))
}

/// Relay replies back to the client; evict the session after `idle` with no
/// upstream traffic.
fn spawn_session_reader(
    session: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    sessions: Arc<DashMap<SocketAddr, Arc<UdpSocket>>>,
    client: SocketAddr,
    token: CancellationToken,
    idle: Duration,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = tokio::time::timeout(idle, session.recv(&mut buf)) => received,
            };
            match received {
                Ok(Ok(len)) => {
                    if listener.send_to(&buf[..len], client).await.is_err() {
                        break;
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    trace!("udp session for {} idled out", client);
                    break;
                }
            }
        }
        sessions.remove(&client);
    });
}
