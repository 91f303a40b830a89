//! Container networking: IPv4 subnets, networks, endpoints, and drivers.
//!
//! A network is a Linux bridge with a gateway address; an endpoint is a
//! veth pair with one end on the bridge and the other inside a container's
//! network namespace. Addresses come from the shared [`ipam::Ipam`].

pub mod bridge;
pub mod command;
pub mod ipam;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use capsule_common::config::EndpointConfig;
use capsule_common::constants::BRIDGE_DRIVER;
use capsule_common::error::{CapsuleError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An IPv4 network in CIDR form, always stored by its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Builds a subnet, masking host bits off `addr`.
    ///
    /// # Errors
    ///
    /// Returns `Network` if the prefix is longer than 30 bits, which would
    /// leave no room for a gateway and a container.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 30 {
            return Err(CapsuleError::Network {
                message: format!("prefix /{prefix} leaves no usable addresses"),
            });
        }
        let mask = Self::mask_bits(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    const fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    /// Network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of assignable host addresses (network and broadcast
    /// excluded).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn host_capacity(&self) -> u32 {
        let size = 1_u64 << (32 - self.prefix as u32);
        (size - 2) as u32
    }

    /// Host address for allocation index `index` (`network + index + 1`).
    #[must_use]
    pub fn nth_host(&self, index: u32) -> Option<Ipv4Addr> {
        (index < self.host_capacity())
            .then(|| Ipv4Addr::from(u32::from(self.network) + index + 1))
    }

    /// Allocation index of a host address in this subnet.
    #[must_use]
    pub fn host_index(&self, ip: Ipv4Addr) -> Option<u32> {
        let offset = u32::from(ip).checked_sub(u32::from(self.network))?;
        let index = offset.checked_sub(1)?;
        (index < self.host_capacity()).then_some(index)
    }

    /// Returns whether `ip` is inside the subnet.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.network)
    }

    /// `ip/prefix`, the form `ip addr add` expects.
    #[must_use]
    pub fn address_with_prefix(&self, ip: Ipv4Addr) -> String {
        format!("{ip}/{}", self.prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = CapsuleError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: String| CapsuleError::Network {
            message: format!("invalid CIDR {s:?}: {why}"),
        };
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("missing prefix length".into()))?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| invalid(e.to_string()))?;
        let prefix = prefix.parse::<u8>().map_err(|e| invalid(e.to_string()))?;
        if prefix > 32 {
            return Err(invalid(format!("prefix /{prefix} out of range")));
        }
        Self::new(addr, prefix)
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name, also the bridge interface name.
    pub name: String,
    /// Address range.
    pub subnet: Subnet,
    /// Address of the bridge, used as the containers' default route.
    pub gateway: Ipv4Addr,
    /// Driver that created the network.
    pub driver: String,
}

/// A container's attachment to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint id.
    pub id: String,
    /// Network name.
    pub network: String,
    /// Address allocated to the container.
    pub ip: Ipv4Addr,
    /// MAC address of the container-side interface.
    pub mac: String,
    /// Host-side veth name.
    pub host_veth: String,
    /// Container-side veth name.
    pub container_veth: String,
    /// `hostPort:containerPort` pairs.
    pub port_mappings: Vec<String>,
}

/// Operations every network driver provides.
pub trait NetworkDriver: Send + Sync {
    /// Driver name as stored in network records.
    fn name(&self) -> &'static str;

    /// Creates a network with the given CIDR and name.
    ///
    /// # Errors
    ///
    /// Returns `Network` or `Ipam` errors.
    fn create(&self, subnet: &str, name: &str) -> Result<Network>;

    /// Loads a network by name.
    ///
    /// # Errors
    ///
    /// Returns `Network` if no such network exists.
    fn load(&self, name: &str) -> Result<Network>;

    /// Lists all networks of this driver.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialization` errors.
    fn list(&self) -> Result<Vec<Network>>;

    /// Deletes a network and releases its gateway address.
    ///
    /// # Errors
    ///
    /// Returns `Network` or `Ipam` errors.
    fn delete(&self, name: &str) -> Result<()>;

    /// Attaches the network namespace of `pid` to the configured network.
    ///
    /// # Errors
    ///
    /// Returns `Network`, `Ipam` or `System` errors.
    fn connect(&self, config: &EndpointConfig, pid: i32) -> Result<Endpoint>;

    /// Detaches an endpoint and releases its address.
    ///
    /// # Errors
    ///
    /// Returns `Network` or `Ipam` errors.
    fn disconnect(&self, endpoint: &Endpoint) -> Result<()>;
}

/// Returns the driver registered under `name`.
///
/// # Errors
///
/// Returns `Network` for an unknown driver name.
pub fn driver_by_name(
    name: &str,
    networks_dir: PathBuf,
    ipam: Arc<ipam::Ipam>,
) -> Result<Box<dyn NetworkDriver>> {
    match name {
        BRIDGE_DRIVER => Ok(Box::new(bridge::BridgeNetworkDriver::new(networks_dir, ipam))),
        other => Err(CapsuleError::Network {
            message: format!("unknown network driver: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_masks_host_bits() {
        let subnet: Subnet = "192.168.50.17/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "192.168.50.0/24");
        assert_eq!(subnet.host_capacity(), 254);
    }

    #[test]
    fn host_indices_skip_network_address() {
        let subnet: Subnet = "10.0.0.0/30".parse().unwrap();
        assert_eq!(subnet.nth_host(0), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(subnet.nth_host(1), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(subnet.nth_host(2), None);
        assert_eq!(subnet.host_index(Ipv4Addr::new(10, 0, 0, 2)), Some(1));
        assert_eq!(subnet.host_index(Ipv4Addr::new(10, 0, 0, 0)), None);
        assert_eq!(subnet.host_index(Ipv4Addr::new(10, 0, 0, 3)), None);
    }

    #[test]
    fn rejects_malformed_cidr() {
        assert!("192.168.1.0".parse::<Subnet>().is_err());
        assert!("192.168.1.0/33".parse::<Subnet>().is_err());
        assert!("192.168.1.0/31".parse::<Subnet>().is_err());
        assert!("nope/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn subnet_serializes_as_string() {
        let subnet: Subnet = "172.18.0.0/16".parse().unwrap();
        let json = serde_json::to_string(&subnet).unwrap();
        assert_eq!(json, "\"172.18.0.0/16\"");
        let back: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subnet);
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipam = Arc::new(ipam::Ipam::load(dir.path().join("subnet.json")).unwrap());
        assert!(driver_by_name("loopback", dir.path().to_path_buf(), Arc::clone(&ipam)).is_err());
        assert!(driver_by_name("bridge", dir.path().to_path_buf(), ipam).is_ok());
    }
}
