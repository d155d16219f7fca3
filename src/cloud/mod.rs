use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{de::IgnoredAny, Deserialize};

use crate::error::CloudError;

pub mod openstack;
pub use openstack::OpenStackCompute;

/// Address type Nova reports for floating IPs.
pub const FLOATING: &str = "floating";

#[async_trait]
pub trait ComputeInventory: Send + Sync {
    /// Lists every server across all projects, all pages concatenated in
    /// listing order.
    async fn list_servers(&self) -> Result<Vec<Server>, CloudError>;
}

/// The parts of a Nova server record used for floating IP resolution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Network name to the addresses the server holds on it.
    #[serde(default)]
    pub addresses: BTreeMap<String, NetworkAddresses>,
}

/// Addresses on one network.  Anything that is not a list is kept as
/// `Unknown` and never matches.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NetworkAddresses {
    Entries(Vec<AddressEntry>),
    Unknown(IgnoredAny),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressEntry {
    Address(ServerAddress),
    /// Entry missing a string `addr` or type.
    Unknown(IgnoredAny),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerAddress {
    #[serde(rename = "OS-EXT-IPS:type", alias = "type")]
    pub kind: String,
    pub addr: String,
}

impl AddressEntry {
    pub fn is_floating(&self, ip: &str) -> bool {
        match self {
            AddressEntry::Address(a) => a.kind == FLOATING && a.addr == ip,
            AddressEntry::Unknown(_) => false,
        }
    }
}

impl Server {
    /// Whether any network of this server lists `ip` as a floating address.
    pub fn holds_floating_ip(&self, ip: &str) -> bool {
        self.addresses.values().any(|network| match network {
            NetworkAddresses::Entries(entries) => entries.iter().any(|e| e.is_floating(ip)),
            NetworkAddresses::Unknown(_) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_nova_addresses() {
        let server: Server = serde_json::from_value(json!({
            "id": "7c3c",
            "name": "web-01",
            "addresses": {
                "private": [
                    {"OS-EXT-IPS:type": "fixed", "addr": "10.0.0.7", "version": 4},
                    {"OS-EXT-IPS:type": "floating", "addr": "203.0.113.5", "version": 4}
                ]
            }
        }))
        .unwrap();

        let NetworkAddresses::Entries(entries) = &server.addresses["private"] else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 2);
        assert!(server.holds_floating_ip("203.0.113.5"));
        assert!(!server.holds_floating_ip("10.0.0.7"));
    }

    #[test]
    fn odd_shapes_become_unknown() {
        let server: Server = serde_json::from_value(json!({
            "name": "odd",
            "addresses": {
                "weird": {"addr": "203.0.113.5"},
                "partial": [
                    {"addr": "203.0.113.5"},
                    {"OS-EXT-IPS:type": null, "addr": "203.0.113.5"},
                    "203.0.113.5",
                    {"type": "floating", "addr": "198.51.100.1"}
                ]
            }
        }))
        .unwrap();

        assert!(matches!(server.addresses["weird"], NetworkAddresses::Unknown(_)));
        let NetworkAddresses::Entries(entries) = &server.addresses["partial"] else {
            panic!("expected entries");
        };
        assert!(matches!(entries[0], AddressEntry::Unknown(_)));
        assert!(matches!(entries[1], AddressEntry::Unknown(_)));
        assert!(matches!(entries[2], AddressEntry::Unknown(_)));
        assert!(!server.holds_floating_ip("203.0.113.5"));
        assert!(server.holds_floating_ip("198.51.100.1"));
    }

    #[test]
    fn missing_addresses_is_empty() {
        let server: Server = serde_json::from_value(json!({"name": "bare"})).unwrap();
        assert!(server.addresses.is_empty());
        assert!(!server.holds_floating_ip("203.0.113.5"));
    }
}
