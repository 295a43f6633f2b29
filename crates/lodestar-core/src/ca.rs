//! The Nebula certificate authority.
//!
//! CA material is loaded once at startup and then only ever used to sign.
//! The signing key stays inside [`CertificateAuthority`]; callers get
//! certificates, fingerprints and the public CA certificate, never the key.

use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use lodestar_crypto::digest::constant_time_eq;
use lodestar_crypto::keys::{CaSigningKey, NodeKeyPair};
use lodestar_crypto::nebula::{CertificateDetails, NebulaCertificate, Network};
use zeroize::Zeroizing;

use crate::config::LighthouseConfig;
use crate::error::LodestarError;
use crate::render::{ConfigDocument, ConfigRole, FirewallPolicy};

/// Issuance parameters that are fixed for the lifetime of the authority.
#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub validity_days: u32,
    /// Prefix length stamped onto issued node addresses.
    pub prefix_len: u8,
    pub lighthouse: LighthouseConfig,
    pub firewall: FirewallPolicy,
}

/// A freshly signed node certificate with its private key.
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("serial", &self.serial)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub struct CertificateAuthority {
    certificate: NebulaCertificate,
    certificate_pem: String,
    fingerprint: String,
    key: CaSigningKey,
    settings: AuthoritySettings,
}

impl CertificateAuthority {
    /// Load CA material from disk.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        settings: AuthoritySettings,
    ) -> Result<Self, LodestarError> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            LodestarError::Signing(format!("read CA certificate {}: {e}", cert_path.display()))
        })?;
        let key_pem = Zeroizing::new(std::fs::read(key_path).map_err(|e| {
            LodestarError::Signing(format!("read CA key {}: {e}", key_path.display()))
        })?);
        let ca = Self::from_pem(&cert_pem, &key_pem, settings, Utc::now())?;
        tracing::info!(
            name = %ca.certificate.details().name,
            fingerprint = %ca.fingerprint,
            not_after = %ca.not_after(),
            "Certificate authority loaded"
        );
        Ok(ca)
    }

    /// Build an authority from PEM material, checking it is usable at `now`.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &[u8],
        settings: AuthoritySettings,
        now: DateTime<Utc>,
    ) -> Result<Self, LodestarError> {
        let certificate = NebulaCertificate::from_pem(cert_pem.as_bytes())
            .map_err(|e| LodestarError::Signing(format!("parse CA certificate: {e}")))?;
        if !certificate.is_ca() {
            return Err(LodestarError::Signing(
                "certificate is not a CA certificate".to_string(),
            ));
        }
        if certificate.expired(now) {
            return Err(LodestarError::Signing(format!(
                "CA certificate is not valid at {now} (valid {} to {})",
                certificate.details().not_before,
                certificate.details().not_after
            )));
        }

        let key = CaSigningKey::from_pem(key_pem)
            .map_err(|e| LodestarError::Signing(format!("parse CA key: {e}")))?;
        if !constant_time_eq(&certificate.details().public_key, &key.public_key()) {
            return Err(LodestarError::Signing(
                "CA key does not match CA certificate".to_string(),
            ));
        }
        certificate
            .verify(&key.public_key())
            .map_err(|e| LodestarError::Signing(format!("CA self-signature: {e}")))?;

        let fingerprint = certificate.fingerprint()?;
        Ok(Self {
            certificate_pem: certificate.to_pem()?,
            certificate,
            fingerprint,
            key,
            settings,
        })
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.certificate.details().not_after
    }

    pub fn settings(&self) -> &AuthoritySettings {
        &self.settings
    }

    /// Sign a node certificate for `name` at `address`.
    ///
    /// Validity runs from `now` (whole seconds) for the configured number
    /// of days, cut short at the CA's own expiry.
    pub fn issue(
        &self,
        name: &str,
        address: Ipv4Addr,
        groups: &[String],
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate, LodestarError> {
        let not_before = DateTime::from_timestamp(now.timestamp(), 0)
            .ok_or_else(|| LodestarError::Signing(format!("timestamp {now} out of range")))?;
        // A validity too long to represent is simply capped like any other.
        let not_after = Duration::try_days(i64::from(self.settings.validity_days))
            .and_then(|validity| not_before.checked_add_signed(validity))
            .map_or(self.not_after(), |requested| requested.min(self.not_after()));
        if not_after <= not_before {
            return Err(LodestarError::Signing(
                "CA certificate has expired".to_string(),
            ));
        }

        let network = Network::new(address, self.settings.prefix_len);
        self.check_constraints(&network, groups)?;

        let keypair = NodeKeyPair::generate();
        let details = CertificateDetails {
            name: name.to_string(),
            ips: vec![network],
            subnets: Vec::new(),
            groups: groups.to_vec(),
            not_before,
            not_after,
            public_key: keypair.public_key().to_vec(),
            is_ca: false,
            issuer: self.fingerprint.clone(),
        };
        let certificate = NebulaCertificate::sign(details, &self.key)?;

        Ok(IssuedCertificate {
            certificate_pem: certificate.to_pem()?,
            private_key_pem: keypair.private_key_pem(),
            serial: certificate.fingerprint()?,
            not_before,
            expires_at: not_after,
        })
    }

    /// Render a Nebula config embedding this CA and the given node material.
    pub fn render_config(&self, cert_pem: &str, key_pem: &str, role: ConfigRole) -> String {
        ConfigDocument {
            ca_pem: &self.certificate_pem,
            cert_pem,
            key_pem,
            lighthouse: &self.settings.lighthouse,
            firewall: &self.settings.firewall,
            role,
        }
        .to_string()
    }

    /// A CA restricted to networks or groups may only sign inside them.
    fn check_constraints(&self, network: &Network, groups: &[String]) -> Result<(), LodestarError> {
        let ca = self.certificate.details();
        if !ca.ips.is_empty() && !ca.ips.iter().any(|allowed| allowed.covers(network)) {
            return Err(LodestarError::Signing(format!(
                "address {network} is outside the CA's networks"
            )));
        }
        if !ca.groups.is_empty() {
            if let Some(group) = groups.iter().find(|g| !ca.groups.contains(g)) {
                return Err(LodestarError::Signing(format!(
                    "group {group:?} is not permitted by the CA"
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("name", &self.certificate.details().name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

// ── Bootstrap ───────────────────────────────────────────────────────

/// Parameters for minting a new self-signed CA.
#[derive(Debug, Clone)]
pub struct CaBlueprint {
    pub name: String,
    pub duration: Duration,
    pub networks: Vec<Network>,
    pub groups: Vec<String>,
}

/// Mint a self-signed CA. Returns the certificate PEM and key PEM.
pub fn create_authority(
    blueprint: &CaBlueprint,
    now: DateTime<Utc>,
) -> Result<(String, Zeroizing<String>), LodestarError> {
    if blueprint.name.trim().is_empty() {
        return Err(LodestarError::Validation("CA name is required".to_string()));
    }
    if blueprint.duration <= Duration::zero() {
        return Err(LodestarError::Validation(
            "CA duration must be positive".to_string(),
        ));
    }
    let not_before = DateTime::from_timestamp(now.timestamp(), 0)
        .ok_or_else(|| LodestarError::Signing(format!("timestamp {now} out of range")))?;

    let not_after = not_before
        .checked_add_signed(blueprint.duration)
        .ok_or_else(|| LodestarError::Validation("CA duration is out of range".to_string()))?;

    let key = CaSigningKey::generate();
    let details = CertificateDetails {
        name: blueprint.name.clone(),
        ips: blueprint.networks.clone(),
        subnets: Vec::new(),
        groups: blueprint.groups.clone(),
        not_before,
        not_after,
        public_key: key.public_key().to_vec(),
        is_ca: true,
        issuer: String::new(),
    };
    let certificate = NebulaCertificate::sign(details, &key)?;
    Ok((certificate.to_pem()?, key.to_pem()))
}
