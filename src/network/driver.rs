//! Network driver trait and the built-in subnet allocator

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::Attachment;

/// Observable state of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum NetworkState {
    /// Defined but not yet carrying traffic
    Created,
    /// Up, with its gateway and subnet resolved
    Running { gateway: String, subnet: String },
}

/// Allocates addresses and host identities for container interfaces.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate an address for `hostname`, optionally honouring a fixed
    /// MAC. Fails with `Exists` when the hostname already holds an
    /// allocation on this network.
    async fn allocate(&self, hostname: &str, mac: Option<&str>) -> Result<Attachment>;

    /// Release the allocation held by `hostname`. Idempotent.
    async fn deallocate(&self, hostname: &str) -> Result<()>;

    async fn state(&self) -> Result<NetworkState>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    subnet: String,
    /// hostname → (address without prefix, mac)
    allocations: HashMap<String, (String, String)>,
}

/// The built-in IPv4 subnet allocator.
///
/// The gateway takes the first host address; containers are handed the
/// following addresses in ascending order. Allocations survive restarts via
/// `state.json` in the network's state directory.
pub struct SubnetDriver {
    name: String,
    base: Ipv4Addr,
    prefix: u8,
    state_path: PathBuf,
    state: Mutex<PersistedState>,
}

impl SubnetDriver {
    /// Create or reopen a subnet network rooted at `state_dir`.
    pub fn open(name: &str, subnet: &str, state_dir: &std::path::Path) -> Result<Self> {
        let (base, prefix) = parse_subnet(subnet)?;
        std::fs::create_dir_all(state_dir)?;
        let state_path = state_dir.join("state.json");

        let state = if state_path.exists() {
            let content = std::fs::read(&state_path)?;
            serde_json::from_slice(&content)
                .map_err(|e| Error::wrap(format!("corrupt network state for {}", name), e))?
        } else {
            PersistedState {
                subnet: subnet.to_string(),
                allocations: HashMap::new(),
            }
        };

        Ok(Self {
            name: name.to_string(),
            base,
            prefix,
            state_path,
            state: Mutex::new(state),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        host_at(self.base, 1)
    }

    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    fn persist(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        std::fs::write(&self.state_path, json)?;
        Ok(())
    }

    fn capacity(&self) -> u32 {
        // Host addresses minus network, gateway, and broadcast.
        (1u32 << (32 - self.prefix)).saturating_sub(3)
    }
}

#[async_trait]
impl NetworkDriver for SubnetDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn allocate(&self, hostname: &str, mac: Option<&str>) -> Result<Attachment> {
        let mut state = self.state.lock();
        if state.allocations.contains_key(hostname) {
            return Err(Error::exists(format!(
                "hostname {} already holds an address on network {}",
                hostname, self.name
            )));
        }

        let taken: Vec<Ipv4Addr> = state
            .allocations
            .values()
            .filter_map(|(addr, _)| addr.parse().ok())
            .collect();

        let mut chosen = None;
        for offset in 2..(2 + self.capacity()) {
            let candidate = host_at(self.base, offset);
            if !taken.contains(&candidate) {
                chosen = Some(candidate);
                break;
            }
        }
        let address = chosen.ok_or_else(|| {
            Error::internal(format!("network {} has no free addresses", self.name))
        })?;

        let mac = match mac {
            Some(mac) => mac.to_string(),
            None => mac_for(address),
        };

        state
            .allocations
            .insert(hostname.to_string(), (address.to_string(), mac.clone()));
        self.persist(&state)?;

        debug!(
            "allocated {} ({}) for {} on {}",
            address, mac, hostname, self.name
        );
        Ok(Attachment {
            network: self.name.clone(),
            hostname: hostname.to_string(),
            address: format!("{}/{}", address, self.prefix),
            gateway: self.gateway().to_string(),
            mac_address: mac,
        })
    }

    async fn deallocate(&self, hostname: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.allocations.remove(hostname).is_some() {
            self.persist(&state)?;
            debug!("released address for {} on {}", hostname, self.name);
        }
        Ok(())
    }

    async fn state(&self) -> Result<NetworkState> {
        Ok(NetworkState::Running {
            gateway: self.gateway().to_string(),
            subnet: self.state.lock().subnet.clone(),
        })
    }
}

fn parse_subnet(subnet: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = subnet
        .split_once('/')
        .ok_or_else(|| Error::invalid_argument(format!("subnet {} is not CIDR", subnet)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::invalid_argument(format!("bad subnet address in {}", subnet)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::invalid_argument(format!("bad prefix length in {}", subnet)))?;
    if prefix < 8 || prefix > 30 {
        return Err(Error::invalid_argument(format!(
            "prefix /{} is outside the supported 8..=30 range",
            prefix
        )));
    }
    let mask = u32::MAX << (32 - prefix);
    let base = Ipv4Addr::from(u32::from(addr) & mask);
    Ok((base, prefix))
}

fn host_at(base: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base) + offset)
}

/// Locally-administered MAC derived from the guest address.
fn mac_for(address: Ipv4Addr) -> String {
    let octets = address.octets();
    format!(
        "06:1e:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}
