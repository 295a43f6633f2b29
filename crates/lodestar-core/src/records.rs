//! Persistent and in-flight records: issued certificates, revocation
//! entries, cached credentials, and authenticated identities.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Class of a node joining the mesh.
///
/// Laptops are user-owned and short-lived; EC2 nodes are fixed
/// infrastructure. Each class draws from its own address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeClass {
    Laptop,
    Ec2,
}

impl NodeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Laptop => "laptop",
            Self::Ec2 => "ec2",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "laptop" => Ok(Self::Laptop),
            "ec2" => Ok(Self::Ec2),
            other => Err(format!("nodeType must be 'laptop' or 'ec2', got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Uat,
    Prod,
    Staging,
    Dev,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uat => "uat",
            Self::Prod => "prod",
            Self::Staging => "staging",
            Self::Dev => "dev",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uat" => Ok(Self::Uat),
            "prod" => Ok(Self::Prod),
            "staging" => Ok(Self::Staging),
            "dev" => Ok(Self::Dev),
            other => Err(format!(
                "environment must be one of uat, prod, staging, dev, got {other:?}"
            )),
        }
    }
}

/// One issued certificate. Never deleted; revocation is one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: Uuid,
    pub owner: String,
    pub node_class: NodeClass,
    pub node_name: String,
    pub address: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    pub groups: Vec<String>,
    pub certificate_pem: String,
    /// Certificate fingerprint, published in the revocation list.
    pub serial: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_metadata: Option<serde_json::Value>,
}

impl CertificateRecord {
    pub fn is_active(&self) -> bool {
        !self.revoked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

/// A validated credential, keyed by the SHA-256 digest of the raw token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub digest: String,
    pub owner: String,
    pub groups: Vec<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The caller behind a validated credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub owner: String,
    pub groups: Vec<String>,
}

impl Identity {
    /// Case-insensitive membership test against any of `roles`.
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        self.groups
            .iter()
            .any(|g| roles.iter().any(|r| g.eq_ignore_ascii_case(r)))
    }
}

impl From<CachedCredential> for Identity {
    fn from(c: CachedCredential) -> Self {
        Self {
            owner: c.owner,
            groups: c.groups,
        }
    }
}
