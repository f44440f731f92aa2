//! Packet-filter collaborator trait
//!
//! The pf anchor writer runs outside this crate. Published ports on
//! non-loopback addresses ask it for redirect rules; teardown removes them.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Install a redirect from `from` to `to`, scoped to `domain` (one
    /// domain per container so teardown is collective).
    async fn create_redirect_rule(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        domain: &str,
    ) -> Result<()>;

    async fn remove_redirect_rule(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        domain: &str,
    ) -> Result<()>;

    /// Rebuild the anchor from scratch, dropping every rule.
    async fn reinitialize(&self) -> Result<()>;
}

/// Filter used when no anchor writer is wired in; rules become no-ops,
/// which is correct for loopback-only published ports.
pub struct NullPacketFilter;

#[async_trait]
impl PacketFilter for NullPacketFilter {
    async fn create_redirect_rule(
        &self,
        _from: SocketAddr,
        _to: SocketAddr,
        _domain: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_redirect_rule(
        &self,
        _from: SocketAddr,
        _to: SocketAddr,
        _domain: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        Ok(())
    }
}
