//! Published-port forwarding
//!
//! Validates published-port specs at bootstrap and runs one forwarder per
//! host port: TCP accepts and splices to a single upstream connection per
//! accepted connection, UDP keeps a session table keyed by client address
//! with idle-timeout eviction. Every forwarder runs until the pool's close
//! handle resolves.

mod tcp;
mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::network::PacketFilter;
use crate::types::{PortProtocol, PublishedPort};

pub use udp::UDP_IDLE_TIMEOUT;

/// Reject malformed or conflicting published-port specs.
///
/// Ports below 1024 require effective uid 0; host ranges for the same
/// protocol must not overlap; ranges must stay inside the port space.
pub fn validate(ports: &[PublishedPort]) -> Result<()> {
    let privileged = unsafe { libc::geteuid() } == 0;

    for port in ports {
        if port.count < 1 {
            return Err(Error::invalid_argument(format!(
                "published port {} has a zero count",
                port.host_port
            )));
        }
        let host_end = port.host_port as u32 + port.count as u32;
        let container_end = port.container_port as u32 + port.count as u32;
        if host_end > 65536 || container_end > 65536 {
            return Err(Error::invalid_argument(format!(
                "published range {}..{} leaves the port space",
                port.host_port, host_end
            )));
        }
        if port.host_port < 1024 && !privileged {
            return Err(Error::invalid_argument(format!(
                "publishing port {} requires root",
                port.host_port
            )));
        }
        port.host_address
            .parse::<IpAddr>()
            .map_err(|_| {
                Error::invalid_argument(format!(
                    "bad published host address {}",
                    port.host_address
                ))
            })?;
    }

    for (i, a) in ports.iter().enumerate() {
        for b in ports.iter().skip(i + 1) {
            if a.protocol != b.protocol {
                continue;
            }
            let a_range = a.host_port as u32..a.host_port as u32 + a.count as u32;
            let b_range = b.host_port as u32..b.host_port as u32 + b.count as u32;
            let overlaps = a_range.start < b_range.end && b_range.start < a_range.end;
            if overlaps && addresses_collide(&a.host_address, &b.host_address) {
                return Err(Error::invalid_argument(format!(
                    "published {} ranges {}+{} and {}+{} overlap",
                    a.protocol, a.host_port, a.count, b.host_port, b.count
                )));
            }
        }
    }
    Ok(())
}

fn addresses_collide(a: &str, b: &str) -> bool {
    a == b || a == "0.0.0.0" || b == "0.0.0.0" || a == "::" || b == "::"
}

/// One live forwarder and where it listens.
struct Forwarder {
    task: JoinHandle<()>,
    rule: Option<(SocketAddr, SocketAddr)>,
}

/// All forwarders for one container, torn down collectively.
pub struct ForwarderPool {
    token: CancellationToken,
    forwarders: Mutex<Vec<Forwarder>>,
    filter: Arc<dyn PacketFilter>,
    domain: String,
    udp_idle: Duration,
}

impl ForwarderPool {
    /// Validate `ports`, bind every listener, install packet-filter rules
    /// for non-loopback addresses, and start the proxy tasks. Any bind
    /// failure tears down what already started.
    pub async fn start(
        ports: &[PublishedPort],
        guest_ip: IpAddr,
        filter: Arc<dyn PacketFilter>,
        domain: &str,
    ) -> Result<Self> {
        Self::start_with_idle(ports, guest_ip, filter, domain, UDP_IDLE_TIMEOUT).await
    }

    pub async fn start_with_idle(
        ports: &[PublishedPort],
        guest_ip: IpAddr,
        filter: Arc<dyn PacketFilter>,
        domain: &str,
        udp_idle: Duration,
    ) -> Result<Self> {
        validate(ports)?;

        let pool = Self {
            token: CancellationToken::new(),
            forwarders: Mutex::new(Vec::new()),
            filter,
            domain: domain.to_string(),
            udp_idle,
        };

        for port in ports {
            let host_ip: IpAddr = port.host_address.parse().map_err(|_| {
                Error::invalid_argument(format!("bad host address {}", port.host_address))
            })?;
            for offset in 0..port.count {
                let host = SocketAddr::new(host_ip, port.host_port + offset);
                let upstream = SocketAddr::new(guest_ip, port.container_port + offset);
                let outcome = match port.protocol {
                    PortProtocol::Tcp => {
                        tcp::spawn(host, upstream, pool.token.child_token()).await
                    }
                    PortProtocol::Udp => {
                        udp::spawn(host, upstream, pool.token.child_token(), pool.udp_idle).await
                    }
                };
                match outcome {
                    Ok(task) => {
                        let rule = if host_ip.is_loopback() {
                            None
                        } else {
                            pool.filter
                                .create_redirect_rule(host, upstream, &pool.domain)
                                .await?;
                            Some((host, upstream))
                        };
                        pool.forwarders.lock().push(Forwarder { task, rule });
                    }
                    Err(e) => {
                        pool.close().await;
                        return Err(Error::wrap(
                            format!("failed to publish {}/{}", host, port.protocol),
                            e,
                        ));
                    }
                }
            }
        }
        Ok(pool)
    }

    /// An empty pool for containers publishing nothing.
    pub fn idle(filter: Arc<dyn PacketFilter>, domain: &str) -> Self {
        Self {
            token: CancellationToken::new(),
            forwarders: Mutex::new(Vec::new()),
            filter,
            domain: domain.to_string(),
            udp_idle: UDP_IDLE_TIMEOUT,
        }
    }

    pub fn len(&self) -> usize {
        self.forwarders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.lock().is_empty()
    }

    /// Stop every forwarder, await their tasks, and remove installed
    /// packet-filter rules.
    pub async fn close(&self) {
        self.token.cancel();
        let forwarders: Vec<Forwarder> = self.forwarders.lock().drain(..).collect();
        for forwarder in forwarders {
            if let Err(e) = forwarder.task.await {
                if !e.is_cancelled() {
                    warn!("forwarder task failed: {}", e);
                }
            }
            if let Some((from, to)) = forwarder.rule {
                if let Err(e) = self
                    .filter
                    .remove_redirect_rule(from, to, &self.domain)
                    .await
                {
                    warn!("failed to remove redirect rule {} -> {}: {}", from, to, e);
                }
            }
        }
        debug!("forwarder pool for {} closed", self.domain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::network::NullPacketFilter;
    use std::net::Ipv4Addr;

    fn port(host_port: u16, container_port: u16, proto: PortProtocol, count: u16) -> PublishedPort {
        PublishedPort {
            host_address: "127.0.0.1".into(),
            host_port,
            container_port,
            protocol: proto,
            count,
        }
    }

    #[test]
    fn test_validate_accepts_disjoint_ranges() {
        let ports = vec![
            port(49000, 8080, PortProtocol::Tcp, 4),
            port(49004, 9090, PortProtocol::Tcp, 1),
            port(49000, 5353, PortProtocol::Udp, 1),
        ];
        validate(&ports).unwrap();
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let ports = vec![
            port(49000, 8080, PortProtocol::Tcp, 4),
            port(49003, 9090, PortProtocol::Tcp, 2),
        ];
        let err = validate(&ports).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_validate_rejects_privileged_for_non_root() {
        if unsafe { libc::geteuid() } == 0 {
            return; // meaningless as root
        }
        let err = validate(&[port(80, 8080, PortProtocol::Tcp, 1)]).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_validate_rejects_range_escape() {
        let err = validate(&[port(65530, 8080, PortProtocol::Tcp, 10)]).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
        let err = validate(&[port(49000, 65530, PortProtocol::Udp, 10)]).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_validate_rejects_zero_count() {
        let err = validate(&[port(49000, 8080, PortProtocol::Tcp, 0)]).unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn test_pool_covers_count_range_and_closes() {
        // Guest side: two TCP listeners standing in for container ports.
        let upstream_a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = upstream_a.local_addr().unwrap().port();
        // Contiguity is required for a count=2 spec; skip when the OS
        // handed us non-adjacent ports.
        if upstream_b.local_addr().unwrap().port() != base + 1 {
            return;
        }
        for upstream in [upstream_a, upstream_b] {
            tokio::spawn(async move {
                while let Ok((mut conn, _)) = upstream.accept().await {
                    let _ = tokio::io::AsyncWriteExt::write_all(&mut conn, b"pong").await;
                }
            });
        }

        let host_base = free_port_pair().await;
        let spec = PublishedPort {
            host_address: "127.0.0.1".into(),
            host_port: host_base,
            container_port: base,
            protocol: PortProtocol::Tcp,
            count: 2,
        };
        let pool = ForwarderPool::start(
            &[spec],
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Arc::new(NullPacketFilter),
            "c1",
        )
        .await
        .unwrap();
        assert_eq!(pool.len(), 2);

        for offset in 0..2u16 {
            let mut conn =
                tokio::net::TcpStream::connect(("127.0.0.1", host_base + offset))
                    .await
                    .unwrap();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut conn, &mut buf)
                .await
                .unwrap();
            assert_eq!(buf, b"pong");
        }

        pool.close().await;
        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", host_base))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_non_loopback_ports_install_redirect_rules() {
        let filter = Arc::new(crate::network::RecordingPacketFilter::default());

        let probe = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let host_port = probe.local_addr().unwrap().port();
        drop(probe);

        let spec = PublishedPort {
            host_address: "0.0.0.0".into(),
            host_port,
            container_port: 8080,
            protocol: PortProtocol::Tcp,
            count: 1,
        };
        let pool = ForwarderPool::start(
            &[spec],
            IpAddr::V4(Ipv4Addr::new(192, 168, 64, 3)),
            filter.clone(),
            "c1",
        )
        .await
        .unwrap();

        {
            let installed = filter.installed.lock();
            assert_eq!(installed.len(), 1);
            assert_eq!(installed[0].0.port(), host_port);
            assert_eq!(installed[0].1.port(), 8080);
            assert_eq!(installed[0].2, "c1");
        }

        pool.close().await;
        assert_eq!(filter.removed.lock().len(), 1);
    }

    /// Find two adjacent free ports by binding and releasing.
    async fn free_port_pair() -> u16 {
        loop {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = probe.local_addr().unwrap().port();
            drop(probe);
            if base < 65000 && tokio::net::TcpListener::bind(("127.0.0.1", base + 1))
                .await
                .is_ok()
            {
                return base;
            }
        }
    }
}
