//! Wire types for the Lodestar HTTP endpoints.
//!
//! Field names are camelCase on the wire. Timestamps are RFC 3339.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{CertificateRecord, RevocationEntry};

/// RFC 3339 with whole seconds and a `Z` suffix.
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCertRequest {
    pub node_type: String,
    pub node_name: String,
    #[serde(default)]
    pub device_info: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInfrastructureCertRequest {
    pub environment: String,
    pub instance_name: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Everything a node needs to join the mesh.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCertResponse {
    pub certificate: String,
    pub private_key: String,
    pub config: String,
    pub lighthouse_ip: String,
    pub lighthouse_port: u16,
    pub static_host_map: BTreeMap<String, Vec<String>>,
    pub ip: String,
    pub expires_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCertsQuery {
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertSummary {
    pub node_name: String,
    pub node_type: String,
    pub ip: String,
    pub created_at: String,
    pub expires_at: String,
    pub is_revoked: bool,
}

impl From<&CertificateRecord> for CertSummary {
    fn from(r: &CertificateRecord) -> Self {
        Self {
            node_name: r.node_name.clone(),
            node_type: r.node_class.to_string(),
            ip: r.address.to_string(),
            created_at: rfc3339(r.created_at),
            expires_at: rfc3339(r.expires_at),
            is_revoked: r.revoked,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertListResponse {
    pub certificates: Vec<CertSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeCertRequest {
    pub node_name: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeCertResponse {
    pub success: bool,
    pub revoked_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrlEntry {
    pub certificate_serial: String,
    pub revoked_at: String,
    pub reason: String,
}

impl From<&RevocationEntry> for CrlEntry {
    fn from(e: &RevocationEntry) -> Self {
        Self {
            certificate_serial: e.serial.clone(),
            revoked_at: rfc3339(e.revoked_at),
            reason: e.reason.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrlResponse {
    pub revoked_certificates: Vec<CrlEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub auth_backend: String,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}
