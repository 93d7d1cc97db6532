//! Host port forwarding through iptables NAT rules.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use burrow_common::types::PortMapping;

/// One installed `hostPort -> containerIp:containerPort` DNAT rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    /// Container the rule belongs to; used as the rule comment.
    pub owner: String,
    /// Port on the host.
    pub host_port: u16,
    /// Destination address inside the container's namespace.
    pub container_ip: Ipv4Addr,
    /// Destination port inside the container's namespace.
    pub container_port: u16,
}

/// Whether a rule is being added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// `-A`
    Append,
    /// `-D`
    Delete,
}

impl RuleAction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

impl PortForward {
    /// Builds the forward for `mapping` towards `container_ip`.
    #[must_use]
    pub fn new(owner: &str, container_ip: Ipv4Addr, mapping: PortMapping) -> Self {
        Self {
            owner: owner.to_owned(),
            host_port: mapping.host_port,
            container_ip,
            container_port: mapping.container_port,
        }
    }

    /// The iptables comment tagging this container's rules.
    #[must_use]
    pub fn comment(&self) -> String {
        format!("burrow:{}", self.owner)
    }

    /// Arguments for the `PREROUTING` rule (traffic from other hosts).
    #[must_use]
    pub fn prerouting_args(&self, action: RuleAction) -> Vec<String> {
        self.rule("PREROUTING", action, &[])
    }

    /// Arguments for the `OUTPUT` rule (traffic from the host itself).
    #[must_use]
    pub fn output_args(&self, action: RuleAction) -> Vec<String> {
        self.rule("OUTPUT", action, &["-m", "addrtype", "--dst-type", "LOCAL"])
    }

    fn rule(&self, chain: &str, action: RuleAction, extra: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = ["-t", "nat", action.flag(), chain, "-p", "tcp", "-m", "tcp"]
            .iter()
            .map(ToString::to_string)
            .collect();
        args.extend(extra.iter().map(ToString::to_string));
        args.extend([
            "--dport".to_owned(),
            self.host_port.to_string(),
            "-j".to_owned(),
            "DNAT".to_owned(),
            "--to-destination".to_owned(),
            format!("{}:{}", self.container_ip, self.container_port),
            "-m".to_owned(),
            "comment".to_owned(),
            "--comment".to_owned(),
            self.comment(),
        ]);
        args
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.host_port, self.container_ip, self.container_port
        )
    }
}
