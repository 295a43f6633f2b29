use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use lodestar_core::allocation::{AddressPlan, HostRange};
use lodestar_core::config::{CaConfig, DelegateConfig, LighthouseConfig, LodestarConfig};
use lodestar_core::ratelimit::RateLimitConfig;
use lodestar_core::render::{FirewallPolicy, FirewallRule};
use lodestar_crypto::nebula::Network;

/// Default HTTP API port.
pub const DEFAULT_HTTP_PORT: u16 = 8081;

#[derive(Parser, Debug)]
#[command(
    name = "lodestar",
    version,
    about = "Issues Nebula overlay certificates to authenticated users"
)]
pub struct Cli {
    /// HTTP API port
    #[arg(long, env = "LODESTAR_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Address to bind the HTTP API to
    #[arg(long, env = "LODESTAR_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LODESTAR_LOG", default_value = "info")]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "LODESTAR_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Persist certificates and cached credentials to this JSON file.
    /// Without it, state lives in memory only.
    #[arg(long, env = "LODESTAR_STORE", value_name = "PATH")]
    pub store: Option<PathBuf>,

    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(flatten)]
    pub lighthouse: LighthouseArgs,

    #[command(flatten)]
    pub ca: CaArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub limits: LimitArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the issuance API (the default)
    Serve,
    /// Certificate authority tooling
    Ca {
        #[command(subcommand)]
        command: CaCommand,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Create a new self-signed Nebula CA
    Create {
        /// CA name embedded in the certificate
        #[arg(long)]
        name: String,
        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,
        /// Restrict issued addresses to these networks (repeatable)
        #[arg(long = "network-limit", value_name = "CIDR")]
        networks: Vec<Network>,
        /// Restrict issued groups to these (repeatable)
        #[arg(long = "group-limit", value_name = "GROUP")]
        groups: Vec<String>,
        /// Directory for ca.crt and ca.key
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
    /// Issue the lighthouse certificate and write its config
    Lighthouse {
        /// Certificate name for the lighthouse
        #[arg(long, default_value = "lighthouse")]
        name: String,
        /// Directory for host.crt, host.key and config.yml
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
pub struct AuthArgs {
    /// Base URL of the authentication service
    #[arg(long, env = "LODESTAR_AUTH_BACKEND_URL", default_value = "http://auth-backend:8080")]
    pub auth_backend_url: String,

    /// Token validation path on the authentication service
    #[arg(
        long,
        env = "LODESTAR_AUTH_VALIDATE_PATH",
        default_value = "/api/nebula/validate-token"
    )]
    pub auth_validate_path: String,

    /// Per-request timeout for token validation, in seconds
    #[arg(long, env = "LODESTAR_AUTH_TIMEOUT", default_value_t = 5)]
    pub auth_timeout: u64,
}

#[derive(Args, Debug)]
pub struct LighthouseArgs {
    /// Overlay address of the lighthouse
    #[arg(long, env = "LODESTAR_LIGHTHOUSE_IP", default_value = "192.168.100.1")]
    pub lighthouse_ip: Ipv4Addr,

    /// Public host or IP nodes use to reach the lighthouse
    #[arg(long, env = "LODESTAR_LIGHTHOUSE_EXTERNAL_IP")]
    pub lighthouse_external_ip: Option<String>,

    /// Lighthouse UDP port
    #[arg(long, env = "LODESTAR_LIGHTHOUSE_PORT", default_value_t = 4242)]
    pub lighthouse_port: u16,
}

#[derive(Args, Debug)]
pub struct CaArgs {
    /// CA certificate (PEM)
    #[arg(long, env = "LODESTAR_CA_CERT", default_value = "/etc/nebula/ca.crt")]
    pub ca_cert: PathBuf,

    /// CA signing key (PEM)
    #[arg(long, env = "LODESTAR_CA_KEY", default_value = "/etc/nebula/ca.key")]
    pub ca_key: PathBuf,

    /// Validity of issued certificates, in days
    #[arg(long, env = "LODESTAR_CERT_VALIDITY_DAYS", default_value_t = 365)]
    pub cert_validity_days: u32,
}

#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// Overlay network
    #[arg(long, env = "LODESTAR_NETWORK", default_value = "192.168.100.0/24")]
    pub overlay_network: Network,

    /// Host offsets for EC2 nodes, e.g. 10-99
    #[arg(long, env = "LODESTAR_EC2_RANGE", default_value = "10-99", value_parser = parse_host_range)]
    pub ec2_range: HostRange,

    /// Host offsets for laptops, e.g. 100-199
    #[arg(long, env = "LODESTAR_LAPTOP_RANGE", default_value = "100-199", value_parser = parse_host_range)]
    pub laptop_range: HostRange,

    /// Inbound firewall rule as port/proto/host (repeatable; default allows any)
    #[arg(long = "inbound-rule", env = "LODESTAR_INBOUND_RULES", value_delimiter = ',')]
    pub inbound_rules: Vec<FirewallRule>,

    /// Outbound firewall rule as port/proto/host (repeatable; default allows any)
    #[arg(long = "outbound-rule", env = "LODESTAR_OUTBOUND_RULES", value_delimiter = ',')]
    pub outbound_rules: Vec<FirewallRule>,
}

#[derive(Args, Debug)]
pub struct LimitArgs {
    /// Authenticated requests allowed per user per window
    #[arg(long, env = "LODESTAR_RATE_LIMIT", default_value_t = 10)]
    pub rate_limit: u32,

    /// Rate limit window, in seconds
    #[arg(long, env = "LODESTAR_RATE_WINDOW", default_value_t = 3600)]
    pub rate_window: u64,

    /// Lifetime of cached credential validations, in seconds
    #[arg(long, env = "LODESTAR_CREDENTIAL_CACHE_TTL", default_value_t = 300)]
    pub credential_cache_ttl: u64,

    /// Lifetime of the published revocation list, in seconds
    #[arg(long, env = "LODESTAR_CRL_CACHE_TTL", default_value_t = 3600)]
    pub crl_cache_ttl: u64,

    /// Timeout for a single store operation, in seconds
    #[arg(long, env = "LODESTAR_STORE_TIMEOUT", default_value_t = 5)]
    pub store_timeout: u64,

    /// Interval between credential cache sweeps, in seconds
    #[arg(long, env = "LODESTAR_SWEEP_INTERVAL", default_value_t = 300)]
    pub sweep_interval: u64,
}

fn parse_host_range(s: &str) -> Result<HostRange, String> {
    let (first, last) = s
        .split_once('-')
        .ok_or_else(|| format!("expected FIRST-LAST, got {s:?}"))?;
    let first: u32 = first.trim().parse().map_err(|e| format!("{first:?}: {e}"))?;
    let last: u32 = last.trim().parse().map_err(|e| format!("{last:?}: {e}"))?;
    let range = HostRange::new(first, last);
    if range.is_empty() {
        return Err(format!("range {s:?} is empty"));
    }
    Ok(range)
}

/// Resolved daemon configuration.
#[derive(Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub store: Option<PathBuf>,
    pub core: LodestarConfig,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        let firewall = FirewallPolicy {
            inbound: rules_or_default(&cli.network.inbound_rules),
            outbound: rules_or_default(&cli.network.outbound_rules),
        };
        let core = LodestarConfig {
            delegate: DelegateConfig {
                base_url: cli.auth.auth_backend_url.clone(),
                validate_path: cli.auth.auth_validate_path.clone(),
                timeout: Duration::from_secs(cli.auth.auth_timeout),
            },
            lighthouse: LighthouseConfig {
                internal_ip: cli.lighthouse.lighthouse_ip,
                external_host: cli
                    .lighthouse
                    .lighthouse_external_ip
                    .clone()
                    .unwrap_or_default(),
                port: cli.lighthouse.lighthouse_port,
            },
            ca: CaConfig {
                cert_path: cli.ca.ca_cert.clone(),
                key_path: cli.ca.ca_key.clone(),
                validity_days: cli.ca.cert_validity_days,
            },
            address_plan: AddressPlan::new(
                cli.network.overlay_network,
                cli.network.ec2_range,
                cli.network.laptop_range,
            ),
            firewall,
            rate_limit: RateLimitConfig {
                max_requests: cli.limits.rate_limit,
                window: Duration::from_secs(cli.limits.rate_window),
            },
            credential_cache_ttl: Duration::from_secs(cli.limits.credential_cache_ttl),
            crl_cache_ttl: Duration::from_secs(cli.limits.crl_cache_ttl),
            store_timeout: Duration::from_secs(cli.limits.store_timeout),
            sweep_interval: Duration::from_secs(cli.limits.sweep_interval),
        };
        Self {
            listen: SocketAddr::new(cli.bind, cli.port),
            store: cli.store.clone(),
            core,
        }
    }
}

fn rules_or_default(rules: &[FirewallRule]) -> Vec<FirewallRule> {
    if rules.is_empty() {
        vec![FirewallRule::any()]
    } else {
        rules.to_vec()
    }
}
