//! Container networking: bridges, veth pairs, addresses and port forwards.
//!
//! The [`NetworkConnector`] owns everything it creates on the host and
//! records it under `network_root`:
//!
//! - `networks/<name>.json`: one [`Network`] per bridge.
//! - `endpoints/<container>.json`: the [`Endpoint`] of an attached container.
//! - `ipam.json`: address leases (see [`ipam`]).
//!
//! Kernel work is delegated to a [`HostNetwork`] implementation.

pub mod host;
pub mod ipam;
pub mod portmap;
pub mod subnet;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use burrow_common::config::{NetworkDefaults, RuntimePaths};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::PortMapping;

pub use host::{HostNetwork, IpRoute};
use ipam::Ipam;
use portmap::PortForward;
pub use subnet::Subnet;

/// Longest interface name the kernel accepts.
const MAX_IFACE_LEN: usize = 15;

/// Characters of the container id used in veth names.
const VETH_ID_LEN: usize = 8;

/// A named virtual network backed by a Linux bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name; also the bridge device name.
    pub name: String,
    /// Address range of the network.
    pub subnet: Subnet,
    /// Bridge address, the default route of attached containers.
    pub gateway: Ipv4Addr,
    /// Bridge device name.
    pub bridge: String,
    /// Driver, always `bridge`.
    pub driver: String,
}

impl Network {
    /// Describes a bridge network named `name` over `subnet`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid interface name.
    pub fn bridge(name: &str, subnet: Subnet) -> Result<Self> {
        validate_network_name(name)?;
        Ok(Self {
            name: name.to_owned(),
            gateway: subnet.gateway(),
            subnet,
            bridge: name.to_owned(),
            driver: "bridge".to_owned(),
        })
    }
}

/// A container's attachment to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Container id; owner of the address lease.
    pub container_id: String,
    /// Container name.
    pub container_name: String,
    /// Network the container is attached to.
    pub network: String,
    /// Address assigned inside the container.
    pub ip: Ipv4Addr,
    /// Prefix length of `ip`.
    pub prefix: u8,
    /// Default gateway inside the container.
    pub gateway: Ipv4Addr,
    /// Host side of the veth pair.
    pub host_iface: String,
    /// Container side of the veth pair, as created on the host.
    pub peer_iface: String,
    /// Installed port forwards.
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
}

/// What the connector needs to know about a container to attach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Host-visible PID whose network namespace is joined.
    pub pid: u32,
    /// Requested port mappings, in order.
    pub port_mappings: Vec<PortMapping>,
}

/// Manages networks and container attachments.
pub struct NetworkConnector {
    root: PathBuf,
    defaults: NetworkDefaults,
    ipam: Ipam,
    host: Arc<dyn HostNetwork>,
}

impl std::fmt::Debug for NetworkConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkConnector")
            .field("root", &self.root)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl NetworkConnector {
    /// Creates a connector storing its state under `paths.network_root`.
    #[must_use]
    pub fn new(paths: &RuntimePaths, defaults: NetworkDefaults, host: Arc<dyn HostNetwork>) -> Self {
        Self {
            root: paths.network_root.clone(),
            ipam: Ipam::new(&paths.network_root),
            defaults,
            host,
        }
    }

    /// Makes sure the default network exists and every known bridge is up.
    ///
    /// Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the default network is misconfigured or a
    /// bridge cannot be created.
    pub fn init_network_subsystem(&self) -> Result<()> {
        match self.load_network(&self.defaults.name) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                let subnet: Subnet = self.defaults.subnet.parse()?;
                let network = Network::bridge(&self.defaults.name, subnet)?;
                self.save_network(&network)?;
                tracing::info!(name = %network.name, subnet = %network.subnet, "default network created");
            }
            Err(e) => return Err(e),
        }
        for network in self.list_networks()? {
            self.host
                .ensure_bridge(&network.bridge, network.gateway, &network.subnet)?;
        }
        Ok(())
    }

    /// Creates a network and its bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or taken, the subnet overlaps
    /// an existing network, or the bridge cannot be created.
    pub fn create_network(&self, name: &str, subnet: Subnet) -> Result<Network> {
        let network = Network::bridge(name, subnet)?;
        if self.network_path(name).exists() {
            return Err(BurrowError::config(format!("network {name} already exists")));
        }
        if let Some(other) = self
            .list_networks()?
            .into_iter()
            .find(|n| n.subnet.overlaps(&subnet))
        {
            return Err(BurrowError::config(format!(
                "subnet {subnet} overlaps network {} ({})",
                other.name, other.subnet
            )));
        }

        self.save_network(&network)?;
        if let Err(e) = self
            .host
            .ensure_bridge(&network.bridge, network.gateway, &network.subnet)
        {
            remove_file(&self.network_path(name));
            return Err(e);
        }
        tracing::info!(name, %subnet, "network created");
        Ok(network)
    }

    /// Deletes a network and its bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the network does not exist, still has attached
    /// containers, or the bridge cannot be removed.
    pub fn remove_network(&self, name: &str) -> Result<()> {
        let network = self.load_network(name)?;
        let attached: Vec<String> = self
            .endpoints()?
            .into_iter()
            .filter(|e| e.network == name)
            .map(|e| e.container_name)
            .collect();
        if !attached.is_empty() {
            return Err(BurrowError::config(format!(
                "network {name} still has attached containers: {}",
                attached.join(", ")
            )));
        }
        self.host.delete_bridge(&network.bridge, &network.subnet)?;
        remove_file(&self.network_path(name));
        tracing::info!(name, "network removed");
        Ok(())
    }

    /// Loads one network definition.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NotFound`] if no such network exists.
    pub fn load_network(&self, name: &str) -> Result<Network> {
        validate_network_name(name)?;
        read_json(&self.network_path(name))?.ok_or_else(|| BurrowError::NotFound {
            kind: "network",
            id: name.to_owned(),
        })
    }

    /// All network definitions, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the network directory cannot be read.
    pub fn list_networks(&self) -> Result<Vec<Network>> {
        let mut networks: Vec<Network> = read_json_dir(&self.root.join("networks"))?;
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    /// Attaches a running container to `network`.
    ///
    /// Allocates an address, creates a veth pair, moves the peer into the
    /// namespace of `request.pid`, configures it, and installs one forward
    /// per port mapping. Any failure undoes the steps already taken.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown, the pool is exhausted,
    /// or any host operation fails.
    pub fn connect(&self, network: &str, request: &AttachRequest) -> Result<Endpoint> {
        let network = self.load_network(network)?;
        let ip = self.ipam.allocate(&network.subnet, &request.id)?;
        let short = request.id.get(..VETH_ID_LEN).unwrap_or(&request.id);
        let mut endpoint = Endpoint {
            container_id: request.id.clone(),
            container_name: request.name.clone(),
            network: network.name.clone(),
            ip,
            prefix: network.subnet.prefix(),
            gateway: network.gateway,
            host_iface: format!("veth{short}"),
            peer_iface: format!("ceth{short}"),
            port_forwards: Vec::new(),
        };

        match self.attach(&network, request, &mut endpoint) {
            Ok(()) => {
                tracing::info!(
                    container = %request.name,
                    network = %network.name,
                    %ip,
                    ports = endpoint.port_forwards.len(),
                    "container connected"
                );
                Ok(endpoint)
            }
            Err(e) => {
                tracing::warn!(container = %request.name, error = %e, "connect failed, rolling back");
                self.teardown(&endpoint);
                Err(e)
            }
        }
    }

    /// Detaches a container, undoing everything [`connect`](Self::connect)
    /// did. Does nothing if the container has no endpoint.
    ///
    /// Host-side failures are logged; the address is released exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error only if the endpoint record cannot be read.
    pub fn disconnect(&self, container_name: &str) -> Result<()> {
        let Some(endpoint) = self.endpoint(container_name)? else {
            tracing::debug!(container = container_name, "no endpoint, nothing to disconnect");
            return Ok(());
        };
        self.teardown(&endpoint);
        tracing::info!(container = container_name, network = %endpoint.network, "container disconnected");
        Ok(())
    }

    /// The endpoint of an attached container, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint record exists but cannot be read.
    pub fn endpoint(&self, container_name: &str) -> Result<Option<Endpoint>> {
        read_json(&self.endpoint_path(container_name))
    }

    fn attach(&self, network: &Network, request: &AttachRequest, endpoint: &mut Endpoint) -> Result<()> {
        self.host
            .create_veth(&endpoint.host_iface, &endpoint.peer_iface, &network.bridge)?;
        self.host.move_into_namespace(&endpoint.peer_iface, request.pid)?;
        self.host.configure_container_interface(
            request.pid,
            &endpoint.peer_iface,
            endpoint.ip,
            endpoint.prefix,
            endpoint.gateway,
        )?;
        for mapping in &request.port_mappings {
            let forward = PortForward::new(&request.id, endpoint.ip, *mapping);
            self.host.add_port_forward(&forward)?;
            endpoint.port_forwards.push(forward);
        }
        write_json(&self.endpoint_path(&request.name), endpoint)
    }

    /// Best-effort reversal of an attachment, in reverse order.
    fn teardown(&self, endpoint: &Endpoint) {
        for forward in endpoint.port_forwards.iter().rev() {
            if let Err(e) = self.host.remove_port_forward(forward) {
                tracing::warn!(%forward, error = %e, "could not remove port forward");
            }
        }
        if let Err(e) = self.host.delete_link(&endpoint.host_iface) {
            tracing::warn!(iface = %endpoint.host_iface, error = %e, "could not delete veth");
        }
        match self.load_network(&endpoint.network) {
            Ok(network) => {
                if let Err(e) = self
                    .ipam
                    .release(&network.subnet, endpoint.ip, &endpoint.container_id)
                {
                    tracing::warn!(ip = %endpoint.ip, error = %e, "could not release address");
                }
            }
            Err(e) => tracing::warn!(network = %endpoint.network, error = %e, "network gone, address not released"),
        }
        remove_file(&self.endpoint_path(&endpoint.container_name));
    }

    fn endpoints(&self) -> Result<Vec<Endpoint>> {
        read_json_dir(&self.root.join("endpoints"))
    }

    fn save_network(&self, network: &Network) -> Result<()> {
        write_json(&self.network_path(&network.name), network)
    }

    fn network_path(&self, name: &str) -> PathBuf {
        self.root.join("networks").join(format!("{name}.json"))
    }

    fn endpoint_path(&self, container_name: &str) -> PathBuf {
        self.root.join("endpoints").join(format!("{container_name}.json"))
    }
}

/// Network names double as bridge device names.
fn validate_network_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFACE_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(BurrowError::config(format!(
            "invalid network name {name:?}: use up to {MAX_IFACE_LEN} of [A-Za-z0-9_.-]"
        )))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BurrowError::io(path, e)),
    }
}

fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BurrowError::io(dir, e)),
    };
    let mut items = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| BurrowError::io(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(item) = read_json(&path)? {
                items.push(item);
            }
        }
    }
    Ok(items)
}

/// Writes `value` through a temporary file so readers never see a partial
/// document.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BurrowError::io(parent, e))?;
    }
    let tmp = path.with_extension(format!("json.{}", std::process::id()));
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?).map_err(|e| BurrowError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| BurrowError::io(path, e))
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}
