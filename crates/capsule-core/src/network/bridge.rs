//! Linux bridge network driver.
//!
//! A network is a bridge interface carrying the gateway address plus a
//! `MASQUERADE` rule for outbound traffic. Network records are kept as
//! `<networks_dir>/<name>.json` so they can be listed and deleted by later
//! runtime invocations.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capsule_common::config::{EndpointConfig, parse_port_mapping};
use capsule_common::constants::BRIDGE_DRIVER;
use capsule_common::error::{CapsuleError, Result};

use super::command::{link_exists, run_ip, run_iptables};
use super::ipam::Ipam;
use super::{Endpoint, Network, NetworkDriver, Subnet};
use crate::namespace::network::run_in_netns;

/// Longest interface name the kernel accepts.
const IFNAMSIZ_MAX: usize = 15;

/// Prefix of the container-side veth name.
const PEER_PREFIX: &str = "cif-";

/// Bridge driver backed by the `ip` and `iptables` tools.
#[derive(Debug, Clone)]
pub struct BridgeNetworkDriver {
    networks_dir: PathBuf,
    ipam: Arc<Ipam>,
}

/// `iptables` arguments of the outbound NAT rule of a network.
#[must_use]
pub fn masquerade_rule(action: &str, network: &Network) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        action.into(),
        "POSTROUTING".into(),
        "-s".into(),
        network.subnet.to_string(),
        "-o".into(),
        network.name.clone(),
        "-j".into(),
        "MASQUERADE".into(),
    ]
}

/// `iptables` arguments forwarding `host_port` to `ip:container_port`.
#[must_use]
pub fn dnat_rule(action: &str, ip: Ipv4Addr, host_port: u16, container_port: u16) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        action.into(),
        "PREROUTING".into(),
        "-p".into(),
        "tcp".into(),
        "-m".into(),
        "tcp".into(),
        "--dport".into(),
        host_port.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{ip}:{container_port}"),
    ]
}

/// Host and container veth names for an endpoint id.
#[must_use]
pub fn veth_names(endpoint_id: &str) -> (String, String) {
    let short: String = endpoint_id.chars().take(5).collect();
    (short.clone(), format!("{PEER_PREFIX}{short}"))
}

/// Random locally administered unicast MAC address.
#[must_use]
pub fn generate_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let first = (bytes[0] | 0x02) & 0xfe;
    format!(
        "{first:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

fn validate_network_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= IFNAMSIZ_MAX
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CapsuleError::Network {
            message: format!(
                "invalid network name {name:?}: use 1-{IFNAMSIZ_MAX} characters of [A-Za-z0-9_-]"
            ),
        })
    }
}

fn iptables(args: &[String]) -> Result<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    run_iptables(&args)
}

impl BridgeNetworkDriver {
    /// Creates a driver storing records under `networks_dir`.
    #[must_use]
    pub const fn new(networks_dir: PathBuf, ipam: Arc<Ipam>) -> Self {
        Self { networks_dir, ipam }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.networks_dir.join(format!("{name}.json"))
    }

    fn save_record(&self, network: &Network) -> Result<()> {
        std::fs::create_dir_all(&self.networks_dir)
            .map_err(|e| CapsuleError::io(&self.networks_dir, e))?;
        let path = self.record_path(&network.name);
        let json = serde_json::to_string_pretty(network)?;
        std::fs::write(&path, json).map_err(|e| CapsuleError::io(&path, e))
    }

    fn read_record(path: &Path) -> Result<Network> {
        let data = std::fs::read_to_string(path).map_err(|e| CapsuleError::io(path, e))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn remove_record(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::io(&path, e)),
        }
    }

    fn setup_bridge(network: &Network) -> Result<()> {
        let name = network.name.as_str();
        let address = network.subnet.address_with_prefix(network.gateway);
        let _ = run_ip(&["link", "add", name, "type", "bridge"])?;
        let _ = run_ip(&["addr", "add", &address, "dev", name])?;
        let _ = run_ip(&["link", "set", name, "up"])?;
        iptables(&masquerade_rule("-A", network))
    }

    fn setup_endpoint(network: &Network, endpoint: &Endpoint, pid: i32) -> Result<()> {
        let host = endpoint.host_veth.as_str();
        let peer = endpoint.container_veth.as_str();
        let _ = run_ip(&["link", "add", host, "type", "veth", "peer", "name", peer])?;
        let _ = run_ip(&["link", "set", host, "master", &network.name])?;
        let _ = run_ip(&["link", "set", host, "up"])?;
        let _ = run_ip(&["link", "set", peer, "netns", &pid.to_string()])?;

        let address = network.subnet.address_with_prefix(endpoint.ip);
        let gateway = network.gateway.to_string();
        let mac = endpoint.mac.clone();
        let peer_name = peer.to_owned();
        run_in_netns(pid, move || {
            let _ = run_ip(&["link", "set", "dev", &peer_name, "address", &mac])?;
            let _ = run_ip(&["addr", "add", &address, "dev", &peer_name])?;
            let _ = run_ip(&["link", "set", &peer_name, "up"])?;
            let _ = run_ip(&["link", "set", "lo", "up"])?;
            let _ = run_ip(&["route", "add", "default", "via", &gateway, "dev", &peer_name])?;
            Ok(())
        })?;

        for mapping in &endpoint.port_mappings {
            let (host_port, container_port) = parse_port_mapping(mapping)?;
            iptables(&dnat_rule("-A", endpoint.ip, host_port, container_port))?;
        }
        Ok(())
    }

    fn teardown_bridge(network: &Network) {
        if let Err(e) = iptables(&masquerade_rule("-D", network)) {
            tracing::warn!(network = %network.name, error = %e, "failed to remove masquerade rule");
        }
        if link_exists(&network.name) {
            if let Err(e) = run_ip(&["link", "delete", &network.name]) {
                tracing::warn!(network = %network.name, error = %e, "failed to delete bridge");
            }
        }
    }

    fn remove_port_mappings(endpoint: &Endpoint) {
        for mapping in &endpoint.port_mappings {
            let Ok((host_port, container_port)) = parse_port_mapping(mapping) else {
                continue;
            };
            if let Err(e) = iptables(&dnat_rule("-D", endpoint.ip, host_port, container_port)) {
                tracing::warn!(endpoint = %endpoint.id, mapping, error = %e, "failed to remove port mapping");
            }
        }
    }

    fn remove_host_veth(endpoint: &Endpoint) {
        if link_exists(&endpoint.host_veth) {
            if let Err(e) = run_ip(&["link", "delete", &endpoint.host_veth]) {
                tracing::warn!(veth = %endpoint.host_veth, error = %e, "failed to delete host veth");
            }
        }
    }
}

impl NetworkDriver for BridgeNetworkDriver {
    fn name(&self) -> &'static str {
        BRIDGE_DRIVER
    }

    fn create(&self, subnet: &str, name: &str) -> Result<Network> {
        validate_network_name(name)?;
        if self.record_path(name).exists() || link_exists(name) {
            return Err(CapsuleError::Network {
                message: format!("network {name} already exists"),
            });
        }
        let subnet: Subnet = subnet.parse()?;
        let gateway = self.ipam.allocate(&subnet)?;
        let network = Network {
            name: name.to_owned(),
            subnet,
            gateway,
            driver: BRIDGE_DRIVER.to_owned(),
        };
        tracing::info!(network = name, %subnet, %gateway, "creating bridge network");

        if let Err(e) = Self::setup_bridge(&network).and_then(|()| self.save_record(&network)) {
            Self::teardown_bridge(&network);
            if let Err(release) = self.ipam.release(&subnet, gateway) {
                tracing::warn!(network = name, error = %release, "failed to release gateway");
            }
            return Err(e);
        }
        Ok(network)
    }

    fn load(&self, name: &str) -> Result<Network> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(CapsuleError::Network {
                message: format!("network {name} not found"),
            });
        }
        Self::read_record(&path)
    }

    fn list(&self) -> Result<Vec<Network>> {
        let entries = match std::fs::read_dir(&self.networks_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CapsuleError::io(&self.networks_dir, e)),
        };
        let mut networks = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| CapsuleError::io(&self.networks_dir, e))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                networks.push(Self::read_record(&path)?);
            }
        }
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let network = self.load(name)?;
        iptables(&masquerade_rule("-D", &network))?;
        self.ipam.release(&network.subnet, network.gateway)?;
        if link_exists(name) {
            let _ = run_ip(&["link", "delete", name])?;
        }
        self.remove_record(name)?;
        tracing::info!(network = name, "bridge network deleted");
        Ok(())
    }

    fn connect(&self, config: &EndpointConfig, pid: i32) -> Result<Endpoint> {
        let network = self.load(&config.network)?;
        for mapping in &config.port_mappings {
            let _ = parse_port_mapping(mapping)?;
        }
        let ip = self.ipam.allocate(&network.subnet)?;
        let (host_veth, container_veth) = veth_names(&config.id);
        let endpoint = Endpoint {
            id: config.id.clone(),
            network: network.name.clone(),
            ip,
            mac: generate_mac(),
            host_veth,
            container_veth,
            port_mappings: config.port_mappings.clone(),
        };
        tracing::info!(
            endpoint = %endpoint.id,
            network = %network.name,
            %ip,
            pid,
            "connecting endpoint"
        );

        if let Err(e) = Self::setup_endpoint(&network, &endpoint, pid) {
            Self::remove_port_mappings(&endpoint);
            Self::remove_host_veth(&endpoint);
            if let Err(release) = self.ipam.release(&network.subnet, ip) {
                tracing::warn!(endpoint = %endpoint.id, error = %release, "failed to release address");
            }
            return Err(e);
        }
        Ok(endpoint)
    }

    fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let network = self.load(&endpoint.network)?;
        tracing::debug!(
            endpoint = %endpoint.id,
            allocatable = self.ipam.allocatable(&network.subnet)?,
            "releasing endpoint address"
        );
        self.ipam.release(&network.subnet, endpoint.ip)?;
        Self::remove_port_mappings(endpoint);
        Self::remove_host_veth(endpoint);
        tracing::info!(endpoint = %endpoint.id, network = %network.name, "endpoint disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(dir: &Path) -> BridgeNetworkDriver {
        let ipam = Arc::new(Ipam::load(dir.join("ipam/subnet.json")).unwrap());
        BridgeNetworkDriver::new(dir.join("networks"), ipam)
    }

    fn sample_network() -> Network {
        Network {
            name: "capsule0".into(),
            subnet: "192.168.99.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(192, 168, 99, 1),
            driver: BRIDGE_DRIVER.into(),
        }
    }

    #[test]
    fn masquerade_rule_targets_bridge_subnet() {
        assert_eq!(
            masquerade_rule("-A", &sample_network()).join(" "),
            "-t nat -A POSTROUTING -s 192.168.99.0/24 -o capsule0 -j MASQUERADE"
        );
    }

    #[test]
    fn dnat_rule_forwards_to_container() {
        let rule = dnat_rule("-D", Ipv4Addr::new(192, 168, 99, 2), 8080, 80);
        assert_eq!(
            rule.join(" "),
            "-t nat -D PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 192.168.99.2:80"
        );
    }

    #[test]
    fn veth_names_use_short_id() {
        assert_eq!(
            veth_names("0123456789abcdef"),
            ("01234".to_owned(), "cif-01234".to_owned())
        );
        assert_eq!(veth_names("ab"), ("ab".to_owned(), "cif-ab".to_owned()));
    }

    #[test]
    fn generated_mac_is_local_unicast() {
        let mac = generate_mac();
        assert_eq!(mac.len(), 17);
        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0);
    }

    #[test]
    fn network_names_must_fit_an_interface() {
        assert!(validate_network_name("capsule0").is_ok());
        assert!(validate_network_name("").is_err());
        assert!(validate_network_name("a-very-long-bridge-name").is_err());
        assert!(validate_network_name("br/0").is_err());
    }

    #[test]
    fn records_round_trip_through_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = driver(dir.path());
        assert!(driver.list().unwrap().is_empty());

        let network = sample_network();
        driver.save_record(&network).unwrap();
        assert_eq!(driver.load("capsule0").unwrap(), network);
        assert_eq!(driver.list().unwrap(), vec![network]);

        driver.remove_record("capsule0").unwrap();
        let err = driver.load("capsule0").unwrap_err();
        assert_eq!(err.kind(), capsule_common::error::ErrorKind::Network);
    }

    #[test]
    fn connect_to_unknown_network_fails_before_allocating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = driver(dir.path());
        let config = EndpointConfig {
            id: "abcdef".into(),
            network: "missing".into(),
            port_mappings: Vec::new(),
        };
        assert!(driver.connect(&config, 1).is_err());
        assert!(!dir.path().join("ipam/subnet.json").exists());
    }
}
