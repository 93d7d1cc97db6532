//! Host-side network plumbing.
//!
//! [`HostNetwork`] is the seam between the connector's bookkeeping and the
//! kernel. [`IpRoute`] implements it by driving the `ip`, `iptables` and
//! `nsenter` tools, which are located on `PATH` when first needed.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Command;

use burrow_common::error::{BurrowError, Result};

use super::portmap::{PortForward, RuleAction};
use super::subnet::Subnet;

/// Interface name the container side of a veth pair ends up with.
pub const CONTAINER_IFACE: &str = "eth0";

/// Replies meaning the link or address being added is already there.
/// iproute2 before 6.x says `File exists`; newer releases name the address.
const ALREADY_EXISTS: &[&str] = &["File exists", "Address already assigned"];

/// Replies meaning the link being deleted is already gone.
const ALREADY_GONE: &[&str] = &["Cannot find device"];

/// Kernel operations needed to attach containers to bridges.
pub trait HostNetwork: Send + Sync {
    /// Creates `bridge` with `gateway` as its address and brings it up.
    /// An existing bridge is left as is. Outbound traffic from `subnet` is
    /// masqueraded.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be created or configured.
    fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, subnet: &Subnet) -> Result<()>;

    /// Deletes `bridge` and its masquerade rule. A missing bridge is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge exists but cannot be removed.
    fn delete_bridge(&self, bridge: &str, subnet: &Subnet) -> Result<()>;

    /// Creates the veth pair `host`/`peer` and enslaves `host` to `bridge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created or attached.
    fn create_veth(&self, host: &str, peer: &str, bridge: &str) -> Result<()>;

    /// Deletes a link (and with it its veth peer). A missing link is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the link exists but cannot be removed.
    fn delete_link(&self, iface: &str) -> Result<()>;

    /// Moves `iface` into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the move fails.
    fn move_into_namespace(&self, iface: &str, pid: u32) -> Result<()>;

    /// Inside the namespace of `pid`: renames `iface` to [`CONTAINER_IFACE`],
    /// assigns `addr/prefix`, brings it and loopback up, and routes through
    /// `gateway` by default.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    fn configure_container_interface(
        &self,
        pid: u32,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> Result<()>;

    /// Installs the NAT rules for `forward`.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule cannot be installed.
    fn add_port_forward(&self, forward: &PortForward) -> Result<()>;

    /// Removes the NAT rules for `forward`.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule cannot be removed.
    fn remove_port_forward(&self, forward: &PortForward) -> Result<()>;
}

/// [`HostNetwork`] backed by iproute2, iptables and util-linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpRoute;

impl IpRoute {
    fn tool(name: &str) -> Result<PathBuf> {
        which::which(name).map_err(|e| BurrowError::Command {
            command: name.to_owned(),
            message: format!("not found on PATH: {e}"),
        })
    }

    /// Runs `program args`, treating any stderr containing one of
    /// `tolerated` as success.
    fn run(program: &str, args: &[&str], tolerated: &[&str]) -> Result<()> {
        let path = Self::tool(program)?;
        let command = format!("{program} {}", args.join(" "));
        tracing::debug!(%command, "running host network command");

        let output = Command::new(&path)
            .args(args)
            .output()
            .map_err(|e| BurrowError::Command {
                command: command.clone(),
                message: e.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_tolerated(&stderr, tolerated) {
            tracing::debug!(%command, stderr = %stderr.trim(), "tolerated failure");
            return Ok(());
        }
        Err(BurrowError::Command {
            command,
            message: format!("{}: {}", output.status, stderr.trim()),
        })
    }

    fn ip(args: &[&str]) -> Result<()> {
        Self::run("ip", args, &[])
    }

    fn ip_in(pid: u32, args: &[&str]) -> Result<()> {
        let target = pid.to_string();
        let mut full = vec!["--target", target.as_str(), "--net", "--", "ip"];
        full.extend_from_slice(args);
        Self::run("nsenter", &full, &[])
    }

    fn iptables(args: &[String]) -> Result<()> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::run("iptables", &args, &[])
    }

    fn masquerade_args<'a>(action: &'a str, bridge: &'a str, subnet: &'a str) -> [&'a str; 11] {
        [
            "-t", "nat", action, "POSTROUTING", "-s", subnet, "!", "-o", bridge, "-j", "MASQUERADE",
        ]
    }

    fn enable_forwarding() {
        let path = "/proc/sys/net/ipv4/ip_forward";
        if let Err(e) = std::fs::write(path, "1") {
            tracing::warn!(path, error = %e, "could not enable IPv4 forwarding");
        }
    }
}

impl HostNetwork for IpRoute {
    fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, subnet: &Subnet) -> Result<()> {
        Self::run("ip", &["link", "add", "name", bridge, "type", "bridge"], ALREADY_EXISTS)?;
        let cidr = format!("{gateway}/{}", subnet.prefix());
        Self::run("ip", &["addr", "add", &cidr, "dev", bridge], ALREADY_EXISTS)?;
        Self::ip(&["link", "set", bridge, "up"])?;

        let source = subnet.to_string();
        if Self::run("iptables", &Self::masquerade_args("-C", bridge, &source), &[]).is_err() {
            Self::run("iptables", &Self::masquerade_args("-A", bridge, &source), &[])?;
        }
        Self::enable_forwarding();
        tracing::info!(bridge, %subnet, "bridge ready");
        Ok(())
    }

    fn delete_bridge(&self, bridge: &str, subnet: &Subnet) -> Result<()> {
        let source = subnet.to_string();
        if let Err(e) = Self::run("iptables", &Self::masquerade_args("-D", bridge, &source), &[]) {
            tracing::debug!(bridge, error = %e, "no masquerade rule to remove");
        }
        Self::run("ip", &["link", "delete", bridge, "type", "bridge"], ALREADY_GONE)?;
        tracing::info!(bridge, "bridge deleted");
        Ok(())
    }

    fn create_veth(&self, host: &str, peer: &str, bridge: &str) -> Result<()> {
        Self::ip(&["link", "add", host, "type", "veth", "peer", "name", peer])?;
        Self::ip(&["link", "set", host, "master", bridge])?;
        Self::ip(&["link", "set", host, "up"])?;
        tracing::debug!(host, peer, bridge, "veth pair created");
        Ok(())
    }

    fn delete_link(&self, iface: &str) -> Result<()> {
        Self::run("ip", &["link", "delete", iface], ALREADY_GONE)
    }

    fn move_into_namespace(&self, iface: &str, pid: u32) -> Result<()> {
        Self::ip(&["link", "set", iface, "netns", &pid.to_string()])
    }

    fn configure_container_interface(
        &self,
        pid: u32,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let cidr = format!("{addr}/{prefix}");
        let gateway = gateway.to_string();
        Self::ip_in(pid, &["link", "set", iface, "name", CONTAINER_IFACE])?;
        Self::ip_in(pid, &["addr", "add", &cidr, "dev", CONTAINER_IFACE])?;
        Self::ip_in(pid, &["link", "set", CONTAINER_IFACE, "up"])?;
        Self::ip_in(pid, &["link", "set", "lo", "up"])?;
        Self::ip_in(pid, &["route", "add", "default", "via", &gateway])?;
        tracing::debug!(pid, %cidr, %gateway, "container interface configured");
        Ok(())
    }

    fn add_port_forward(&self, forward: &PortForward) -> Result<()> {
        Self::iptables(&forward.prerouting_args(RuleAction::Append))?;
        if let Err(e) = Self::iptables(&forward.output_args(RuleAction::Append)) {
            let _ = Self::iptables(&forward.prerouting_args(RuleAction::Delete));
            return Err(e);
        }
        tracing::debug!(%forward, "port forward installed");
        Ok(())
    }

    fn remove_port_forward(&self, forward: &PortForward) -> Result<()> {
        let pre = Self::iptables(&forward.prerouting_args(RuleAction::Delete));
        let out = Self::iptables(&forward.output_args(RuleAction::Delete));
        pre.and(out)
    }
}

/// Whether a failed command's `stderr` matches one of the `tolerated` replies.
fn is_tolerated(stderr: &str, tolerated: &[&str]) -> bool {
    tolerated.iter().any(|t| stderr.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_address_replies_are_tolerated() {
        assert!(is_tolerated("RTNETLINK answers: File exists\n", ALREADY_EXISTS));
        assert!(is_tolerated("Error: ipv4: Address already assigned.\n", ALREADY_EXISTS));
    }

    #[test]
    fn missing_device_is_tolerated_on_delete() {
        assert!(is_tolerated("Cannot find device \"veth1234\"\n", ALREADY_GONE));
        assert!(!is_tolerated("Cannot find device \"veth1234\"\n", ALREADY_EXISTS));
    }

    #[test]
    fn other_failures_are_errors() {
        assert!(!is_tolerated("Error: either \"dev\" is duplicate, or \"br0\" is a garbage.\n", ALREADY_EXISTS));
        assert!(!is_tolerated("RTNETLINK answers: Operation not permitted\n", ALREADY_EXISTS));
        assert!(!is_tolerated("", ALREADY_EXISTS));
    }
}
