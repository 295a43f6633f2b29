//! Nebula node configuration documents.

use std::fmt;
use std::str::FromStr;

use crate::config::LighthouseConfig;

/// Which side of the lighthouse relationship a config is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRole {
    Lighthouse,
    Node,
}

/// One Nebula firewall rule. Fields are emitted verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub port: String,
    pub proto: String,
    pub host: String,
}

impl FirewallRule {
    pub fn any() -> Self {
        Self {
            port: "any".to_string(),
            proto: "any".to_string(),
            host: "any".to_string(),
        }
    }
}

impl FromStr for FirewallRule {
    type Err = String;

    /// Parses `port/proto/host`, e.g. `443/tcp/any`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let &[port, proto, host] = parts.as_slice() else {
            return Err(format!("firewall rule {s:?} must be port/proto/host"));
        };
        let token_ok = |t: &str| {
            !t.is_empty()
                && t.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !token_ok(port) || !token_ok(proto) || !token_ok(host) {
            return Err(format!("firewall rule {s:?} contains invalid characters"));
        }
        if !matches!(proto, "any" | "tcp" | "udp" | "icmp") {
            return Err(format!("unknown protocol {proto:?}"));
        }
        Ok(Self {
            port: port.to_string(),
            proto: proto.to_string(),
            host: host.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPolicy {
    pub outbound: Vec<FirewallRule>,
    pub inbound: Vec<FirewallRule>,
}

impl Default for FirewallPolicy {
    fn default() -> Self {
        Self {
            outbound: vec![FirewallRule::any()],
            inbound: vec![FirewallRule::any()],
        }
    }
}

/// A complete Nebula `config.yml` for one node.
pub struct ConfigDocument<'a> {
    pub ca_pem: &'a str,
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
    pub lighthouse: &'a LighthouseConfig,
    pub firewall: &'a FirewallPolicy,
    pub role: ConfigRole,
}

fn write_block(f: &mut fmt::Formatter<'_>, pem: &str) -> fmt::Result {
    for line in pem.trim_end_matches('\n').lines() {
        writeln!(f, "    {line}")?;
    }
    Ok(())
}

fn write_rules(f: &mut fmt::Formatter<'_>, rules: &[FirewallRule]) -> fmt::Result {
    if rules.is_empty() {
        return writeln!(f, " []");
    }
    writeln!(f)?;
    for rule in rules {
        writeln!(f, "    - port: {}", rule.port)?;
        writeln!(f, "      proto: {}", rule.proto)?;
        writeln!(f, "      host: {}", rule.host)?;
    }
    Ok(())
}

impl fmt::Display for ConfigDocument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lighthouse = self.lighthouse;
        let (am_lighthouse, port) = match self.role {
            ConfigRole::Lighthouse => (true, lighthouse.port),
            ConfigRole::Node => (false, 0),
        };

        writeln!(f, "pki:")?;
        writeln!(f, "  ca: |")?;
        write_block(f, self.ca_pem)?;
        writeln!(f, "  cert: |")?;
        write_block(f, self.cert_pem)?;
        writeln!(f, "  key: |")?;
        write_block(f, self.key_pem)?;
        writeln!(f)?;

        writeln!(f, "static_host_map:")?;
        for (overlay, endpoints) in lighthouse.static_host_map() {
            writeln!(f, "  \"{overlay}\":")?;
            for endpoint in endpoints {
                writeln!(f, "    - \"{endpoint}\"")?;
            }
        }
        writeln!(f)?;

        writeln!(f, "lighthouse:")?;
        writeln!(f, "  am_lighthouse: {am_lighthouse}")?;
        writeln!(f, "  interval: 60")?;
        if am_lighthouse {
            writeln!(f, "  hosts: []")?;
        } else {
            writeln!(f, "  hosts:")?;
            writeln!(f, "    - \"{}\"", lighthouse.internal_ip)?;
        }
        writeln!(f)?;

        writeln!(f, "listen:")?;
        writeln!(f, "  host: 0.0.0.0")?;
        writeln!(f, "  port: {port}")?;
        writeln!(f)?;

        writeln!(f, "punchy:")?;
        writeln!(f, "  punch: true")?;
        writeln!(f)?;

        writeln!(f, "tun:")?;
        writeln!(f, "  dev: nebula")?;
        writeln!(f, "  drop_local_broadcast: false")?;
        writeln!(f, "  drop_multicast: false")?;
        writeln!(f, "  tx_queue: 500")?;
        writeln!(f, "  mtu: 1300")?;
        writeln!(f)?;

        writeln!(f, "logging:")?;
        writeln!(f, "  level: info")?;
        writeln!(f, "  format: json")?;
        writeln!(f)?;

        writeln!(f, "firewall:")?;
        writeln!(f, "  conntrack:")?;
        writeln!(f, "    tcp_timeout: 12m")?;
        writeln!(f, "    udp_timeout: 3m")?;
        writeln!(f, "    default_timeout: 10m")?;
        write!(f, "  outbound:")?;
        write_rules(f, &self.firewall.outbound)?;
        write!(f, "  inbound:")?;
        write_rules(f, &self.firewall.inbound)
    }
}
