//! VPN profiles and split-tunnel destination networks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),
    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(String),
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("Netmask is not a contiguous prefix mask: {0}")]
    InvalidNetmask(Ipv4Addr),
}

/// A network routed through the tunnel, stored the way route tables want it:
/// destination address plus dotted netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDestinationNetwork")]
pub struct DestinationNetwork {
    destination_ip: Ipv4Addr,
    netmask: Ipv4Addr,
}

#[derive(Deserialize)]
struct RawDestinationNetwork {
    destination_ip: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl TryFrom<RawDestinationNetwork> for DestinationNetwork {
    type Error = ProfileError;

    fn try_from(raw: RawDestinationNetwork) -> Result<Self, Self::Error> {
        Self::new(raw.destination_ip, raw.netmask)
    }
}

impl DestinationNetwork {
    pub fn new(destination_ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, ProfileError> {
        let bits = u32::from(netmask);
        // contiguous ones followed by contiguous zeros
        if bits.leading_ones() + bits.trailing_zeros() != 32 {
            return Err(ProfileError::InvalidNetmask(netmask));
        }
        Ok(Self {
            destination_ip,
            netmask,
        })
    }

    /// Parse `a.b.c.d/prefix`.
    pub fn from_cidr(cidr: &str) -> Result<Self, ProfileError> {
        let (network, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| ProfileError::InvalidCidr(cidr.to_string()))?;

        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| ProfileError::InvalidPrefix(prefix.to_string()))?;
        if prefix_len > 32 {
            return Err(ProfileError::InvalidPrefix(prefix.to_string()));
        }

        // Ipv4Addr's parser rejects wrong octet counts and octets above 255
        let destination_ip: Ipv4Addr = network
            .parse()
            .map_err(|_| ProfileError::InvalidAddress(network.to_string()))?;

        Ok(Self {
            destination_ip,
            netmask: prefix_to_netmask(prefix_len),
        })
    }

    pub fn to_cidr(&self) -> String {
        format!("{}/{}", self.destination_ip, self.prefix_len())
    }

    pub fn destination_ip(&self) -> Ipv4Addr {
        self.destination_ip
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).leading_ones()
    }
}

fn prefix_to_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
    Ipv4Addr::from(bits)
}

impl FromStr for DestinationNetwork {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for DestinationNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cidr())
    }
}

/// Connection profile handed to the service for a single connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnProfile {
    pub name: String,
    pub url: String,
    #[serde(rename = "destination_networks", default)]
    pub routes: Vec<DestinationNetwork>,
}

impl VpnProfile {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            routes: Vec::new(),
        }
    }

    pub fn with_routes(mut self, routes: Vec<DestinationNetwork>) -> Self {
        self.routes = routes;
        self
    }
}

impl fmt::Display for VpnProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cidr() {
        let net = DestinationNetwork::from_cidr("10.20.0.0/16").unwrap();
        assert_eq!(net.destination_ip(), Ipv4Addr::new(10, 20, 0, 0));
        assert_eq!(net.netmask(), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(net.prefix_len(), 16);
    }

    #[test]
    fn test_prefix_extremes() {
        let any = DestinationNetwork::from_cidr("0.0.0.0/0").unwrap();
        assert_eq!(any.netmask(), Ipv4Addr::new(0, 0, 0, 0));

        let host = DestinationNetwork::from_cidr("192.168.1.7/32").unwrap();
        assert_eq!(host.netmask(), Ipv4Addr::new(255, 255, 255, 255));

        let odd = DestinationNetwork::from_cidr("172.16.0.0/12").unwrap();
        assert_eq!(odd.netmask(), Ipv4Addr::new(255, 240, 0, 0));
    }

    #[test]
    fn test_cidr_round_trip() {
        for cidr in [
            "0.0.0.0/0",
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.100.0/23",
            "8.8.8.8/32",
        ] {
            let net: DestinationNetwork = cidr.parse().unwrap();
            assert_eq!(net.to_cidr(), cidr);
            assert_eq!(DestinationNetwork::from_cidr(&net.to_cidr()).unwrap(), net);
        }
    }

    #[test]
    fn test_malformed_cidr_rejected() {
        assert!(matches!(
            DestinationNetwork::from_cidr("10.0.0.0/33"),
            Err(ProfileError::InvalidPrefix(_))
        ));
        assert!(matches!(
            DestinationNetwork::from_cidr("10.0.0.0/-1"),
            Err(ProfileError::InvalidPrefix(_))
        ));
        assert!(matches!(
            DestinationNetwork::from_cidr("10.0.0/8"),
            Err(ProfileError::InvalidAddress(_))
        ));
        assert!(matches!(
            DestinationNetwork::from_cidr("10.0.0.0.1/8"),
            Err(ProfileError::InvalidAddress(_))
        ));
        assert!(matches!(
            DestinationNetwork::from_cidr("10.0.256.0/24"),
            Err(ProfileError::InvalidAddress(_))
        ));
        assert!(matches!(
            DestinationNetwork::from_cidr("10.0.0.0"),
            Err(ProfileError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_non_contiguous_netmask_rejected() {
        let result = DestinationNetwork::new(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(255, 0, 255, 0),
        );
        assert!(matches!(result, Err(ProfileError::InvalidNetmask(_))));
    }

    #[test]
    fn test_deserialize_validates_netmask() {
        let ok: DestinationNetwork =
            serde_json::from_str(r#"{"destination_ip":"10.1.0.0","netmask":"255.255.0.0"}"#)
                .unwrap();
        assert_eq!(ok.to_cidr(), "10.1.0.0/16");

        let bad = serde_json::from_str::<DestinationNetwork>(
            r#"{"destination_ip":"10.1.0.0","netmask":"0.255.0.0"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_profile_wire_shape() {
        let profile = VpnProfile::new("corp", "vpn.example.com")
            .with_routes(vec!["10.0.0.0/8".parse().unwrap()]);
        let value = serde_json::to_value(&profile).unwrap();
        assert_eq!(value["name"], "corp");
        assert_eq!(value["destination_networks"][0]["destination_ip"], "10.0.0.0");
        assert_eq!(value["destination_networks"][0]["netmask"], "255.0.0.0");
    }
}
