//! Guest resolver derivation and `/etc/hosts` composition

use crate::types::{Attachment, DnsConfiguration};

/// Fill in the nameserver list when the configuration left it empty: the
/// primary attachment's gateway answers DNS for the built-in networks.
pub fn derive_dns(configured: &DnsConfiguration, attachments: &[Attachment]) -> DnsConfiguration {
    let mut dns = configured.clone();
    if dns.nameservers.is_empty() {
        if let Some(primary) = attachments.first() {
            dns.nameservers.push(primary.gateway.clone());
        }
    }
    dns
}

/// Render the guest `/etc/hosts`: loopback entries plus the primary
/// interface mapped to the container's hostname.
pub fn render_hosts(id: &str, attachments: &[Attachment]) -> String {
    let mut hosts = String::new();
    hosts.push_str("127.0.0.1\tlocalhost\n");
    hosts.push_str("::1\tlocalhost ip6-localhost ip6-loopback\n");
    if let Some(primary) = attachments.first() {
        let name = if primary.hostname.is_empty() {
            id
        } else {
            &primary.hostname
        };
        hosts.push_str(&format!("{}\t{}\n", primary.ip(), name));
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(hostname: &str, address: &str, gateway: &str) -> Attachment {
        Attachment {
            network: "default".into(),
            hostname: hostname.into(),
            address: address.into(),
            gateway: gateway.into(),
            mac_address: "06:1e:c0:a8:40:03".into(),
        }
    }

    #[test]
    fn test_dns_defaults_to_primary_gateway() {
        let attachments = vec![
            attachment("web", "192.168.64.3/24", "192.168.64.1"),
            attachment("web2", "10.0.0.3/24", "10.0.0.1"),
        ];
        let dns = derive_dns(&DnsConfiguration::default(), &attachments);
        assert_eq!(dns.nameservers, vec!["192.168.64.1"]);
    }

    #[test]
    fn test_dns_keeps_explicit_nameservers() {
        let configured = DnsConfiguration {
            nameservers: vec!["1.1.1.1".into()],
            ..Default::default()
        };
        let attachments = vec![attachment("web", "192.168.64.3/24", "192.168.64.1")];
        let dns = derive_dns(&configured, &attachments);
        assert_eq!(dns.nameservers, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_hosts_contains_loopback_and_primary() {
        let attachments = vec![attachment("web", "192.168.64.3/24", "192.168.64.1")];
        let hosts = render_hosts("c1", &attachments);
        assert!(hosts.contains("127.0.0.1\tlocalhost"));
        assert!(hosts.contains("::1\tlocalhost"));
        assert!(hosts.contains("192.168.64.3\tweb"));
    }

    #[test]
    fn test_hosts_falls_back_to_container_id() {
        let attachments = vec![attachment("", "192.168.64.3/24", "192.168.64.1")];
        let hosts = render_hosts("c1", &attachments);
        assert!(hosts.contains("192.168.64.3\tc1"));
    }

    #[test]
    fn test_hosts_without_attachments() {
        let hosts = render_hosts("c1", &[]);
        assert!(hosts.contains("localhost"));
        assert!(!hosts.contains("c1"));
    }
}
