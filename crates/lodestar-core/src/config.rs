//! Runtime configuration for the Lodestar core.
//!
//! The binary fills these from CLI flags and environment variables; the
//! defaults below match a single-lighthouse deployment on
//! `192.168.100.0/24`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::allocation::AddressPlan;
use crate::ca::AuthoritySettings;
use crate::error::LodestarError;
use crate::ratelimit::RateLimitConfig;
use crate::render::FirewallPolicy;

/// Location of the delegate authentication service.
#[derive(Debug, Clone)]
pub struct DelegateConfig {
    pub base_url: String,
    pub validate_path: String,
    /// Per-request timeout for token validation.
    pub timeout: Duration,
}

impl DelegateConfig {
    pub fn validate_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.validate_path)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url.trim_end_matches('/'))
    }
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            base_url: "http://auth-backend:8080".to_string(),
            validate_path: "/api/nebula/validate-token".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// The lighthouse every issued node is pointed at.
#[derive(Debug, Clone)]
pub struct LighthouseConfig {
    /// Overlay address of the lighthouse.
    pub internal_ip: Ipv4Addr,
    /// Publicly routable host or IP of the lighthouse.
    pub external_host: String,
    pub port: u16,
}

impl LighthouseConfig {
    /// Overlay address to underlay endpoints, as placed in node configs.
    pub fn static_host_map(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            self.internal_ip.to_string(),
            vec![format!("{}:{}", self.external_host, self.port)],
        )])
    }
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            internal_ip: Ipv4Addr::new(192, 168, 100, 1),
            external_host: String::new(),
            port: 4242,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub validity_days: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("/etc/nebula/ca.crt"),
            key_path: PathBuf::from("/etc/nebula/ca.key"),
            validity_days: 365,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LodestarConfig {
    pub delegate: DelegateConfig,
    pub lighthouse: LighthouseConfig,
    pub ca: CaConfig,
    pub address_plan: AddressPlan,
    pub firewall: FirewallPolicy,
    pub rate_limit: RateLimitConfig,
    /// Lifetime of a cached credential validation.
    pub credential_cache_ttl: Duration,
    /// Lifetime of the in-memory revocation list snapshot.
    pub crl_cache_ttl: Duration,
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// How often expired credential cache entries are purged.
    pub sweep_interval: Duration,
}

impl Default for LodestarConfig {
    fn default() -> Self {
        Self {
            delegate: DelegateConfig::default(),
            lighthouse: LighthouseConfig::default(),
            ca: CaConfig::default(),
            address_plan: AddressPlan::default(),
            firewall: FirewallPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            credential_cache_ttl: Duration::from_secs(300),
            crl_cache_ttl: Duration::from_secs(3600),
            store_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl LodestarConfig {
    /// Issuance settings for the certificate authority.
    pub fn authority_settings(&self) -> AuthoritySettings {
        AuthoritySettings {
            validity_days: self.ca.validity_days,
            prefix_len: self.address_plan.prefix_len(),
            lighthouse: self.lighthouse.clone(),
            firewall: self.firewall.clone(),
        }
    }

    /// Reject configurations the core cannot serve safely.
    pub fn validate(&self) -> Result<(), LodestarError> {
        if self.lighthouse.external_host.trim().is_empty() {
            return Err(LodestarError::Config(
                "lighthouse external address is required".to_string(),
            ));
        }
        if self.ca.validity_days == 0 {
            return Err(LodestarError::Config(
                "certificate validity must be at least one day".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(LodestarError::Config(
                "rate limit must allow at least one request".to_string(),
            ));
        }
        for (name, value) in [
            ("rate limit window", self.rate_limit.window),
            ("sweep interval", self.sweep_interval),
            ("store timeout", self.store_timeout),
        ] {
            if value.is_zero() {
                return Err(LodestarError::Config(format!("{name} must be non-zero")));
            }
        }
        self.address_plan.validate()?;

        let lighthouse = self.lighthouse.internal_ip;
        if !self.address_plan.network().contains(lighthouse) {
            return Err(LodestarError::Config(format!(
                "lighthouse {lighthouse} is outside {}",
                self.address_plan.network()
            )));
        }
        if self.address_plan.class_of(lighthouse).is_some() {
            return Err(LodestarError::Config(format!(
                "lighthouse {lighthouse} overlaps a node address range"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> LodestarConfig {
        let mut config = LodestarConfig::default();
        config.lighthouse.external_host = "5.6.7.8".to_string();
        config
    }

    #[test]
    fn defaults_validate_once_external_host_is_set() {
        assert!(LodestarConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn lighthouse_inside_node_range_is_rejected() {
        let mut config = valid();
        config.lighthouse.internal_ip = Ipv4Addr::new(192, 168, 100, 150);
        assert!(matches!(config.validate(), Err(LodestarError::Config(_))));
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let mut config = valid();
        config.sweep_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(LodestarError::Config(_))));
    }

    #[test]
    fn delegate_urls_join_without_double_slash() {
        let delegate = DelegateConfig {
            base_url: "http://auth:8080/".to_string(),
            ..DelegateConfig::default()
        };
        assert_eq!(
            delegate.validate_url(),
            "http://auth:8080/api/nebula/validate-token"
        );
        assert_eq!(delegate.health_url(), "http://auth:8080/health");
    }

    #[test]
    fn static_host_map_points_at_external_endpoint() {
        let map = valid().lighthouse.static_host_map();
        assert_eq!(map["192.168.100.1"], vec!["5.6.7.8:4242".to_string()]);
    }
}
