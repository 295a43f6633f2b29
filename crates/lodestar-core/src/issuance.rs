//! Certificate issuance for laptops and infrastructure nodes.
//!
//! Flow: duplicate pre-check, address selection, signing, insert. The
//! pre-check is a fast path only; the store's uniqueness check on insert
//! is what rejects a concurrent duplicate or a lost address race.

use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::credential::{CredentialValidator, ELEVATED_ROLES};
use crate::error::LodestarError;
use crate::records::{CertificateRecord, Environment, Identity, NodeClass};
use crate::render::ConfigRole;
use crate::store::{bounded, CertificateQuery};
use crate::LodestarState;

pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Owner of infrastructure certificates issued without an explicit user.
pub const SYSTEM_OWNER: &str = "system";

const MAX_NODE_NAME_LEN: usize = 255;

/// Node names: 1 to 255 characters, alphanumeric first, then
/// alphanumerics, dots, underscores or dashes.
pub fn validate_node_name(name: &str) -> Result<(), LodestarError> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if first_ok && rest_ok && name.len() <= MAX_NODE_NAME_LEN {
        return Ok(());
    }
    Err(LodestarError::Validation(
        "nodeName must be alphanumeric with dashes/underscores/dots".to_string(),
    ))
}

/// Groups embedded in a certificate for this kind of node.
pub fn groups_for(class: NodeClass, environment: Option<Environment>) -> Vec<String> {
    match (class, environment) {
        (NodeClass::Laptop, _) => vec!["developer".to_string()],
        (NodeClass::Ec2, None) => vec!["ec2".to_string()],
        (NodeClass::Ec2, Some(env)) => vec!["ec2".to_string(), format!("ec2-{env}")],
    }
}

#[derive(Debug, Clone)]
pub struct LeafRequest {
    pub node_class: NodeClass,
    pub node_name: String,
    pub device_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InfrastructureRequest {
    pub environment: Environment,
    pub instance_name: String,
    /// Owner override; defaults to [`SYSTEM_OWNER`].
    pub owner: Option<String>,
}

/// A persisted certificate plus the secrets handed back exactly once.
pub struct IssuedNode {
    pub record: CertificateRecord,
    pub private_key_pem: Zeroizing<String>,
    pub config: String,
}

impl LodestarState {
    pub(crate) async fn issue_leaf(
        &self,
        identity: &Identity,
        request: LeafRequest,
    ) -> Result<IssuedNode, LodestarError> {
        let device_metadata = request
            .device_description
            .filter(|d| !d.is_empty())
            .map(|d| serde_json::json!({ "description": d }));
        self.issue(
            &identity.owner,
            request.node_class,
            &request.node_name,
            None,
            device_metadata,
        )
        .await
    }

    pub(crate) async fn issue_infrastructure(
        &self,
        identity: &Identity,
        request: InfrastructureRequest,
    ) -> Result<IssuedNode, LodestarError> {
        CredentialValidator::require_role(identity, ELEVATED_ROLES)?;
        let owner = request
            .owner
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| SYSTEM_OWNER.to_string());
        tracing::info!(
            requested_by = %identity.owner,
            owner = %owner,
            environment = %request.environment,
            "Infrastructure certificate requested"
        );
        self.issue(
            &owner,
            NodeClass::Ec2,
            &request.instance_name,
            Some(request.environment),
            None,
        )
        .await
    }

    async fn issue(
        &self,
        owner: &str,
        class: NodeClass,
        name: &str,
        environment: Option<Environment>,
        device_metadata: Option<serde_json::Value>,
    ) -> Result<IssuedNode, LodestarError> {
        validate_node_name(name)?;

        let existing = bounded(
            self.store_timeout,
            self.certificates.find_active(owner, class, name),
        )
        .await?;
        if existing.is_some() {
            return Err(LodestarError::Conflict {
                message: format!("certificate already exists for node {name}"),
                retryable: false,
            });
        }

        let address = self.allocator.allocate(owner, class, environment).await?;
        let groups = groups_for(class, environment);
        let now = Utc::now();
        let issued = self.ca.issue(name, address, &groups, now)?;

        let record = CertificateRecord {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            node_class: class,
            node_name: name.to_string(),
            address,
            environment,
            groups,
            certificate_pem: issued.certificate_pem,
            serial: issued.serial,
            created_at: now,
            expires_at: issued.expires_at,
            revoked: false,
            revoked_at: None,
            revoke_reason: None,
            device_metadata,
        };
        bounded(self.store_timeout, self.certificates.insert(record.clone())).await?;

        tracing::info!(
            owner,
            node = name,
            class = %class,
            ip = %address,
            serial = %record.serial,
            expires_at = %record.expires_at,
            "Certificate issued"
        );

        let config = self.ca.render_config(
            &record.certificate_pem,
            &issued.private_key_pem,
            ConfigRole::Node,
        );
        Ok(IssuedNode {
            record,
            private_key_pem: issued.private_key_pem,
            config,
        })
    }

    pub(crate) async fn list_certificates(
        &self,
        identity: &Identity,
        node_class: Option<NodeClass>,
        limit: Option<usize>,
    ) -> Result<Vec<CertificateRecord>, LodestarError> {
        let query = CertificateQuery {
            owner: identity.owner.clone(),
            node_class,
            limit: limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT),
        };
        bounded(self.store_timeout, self.certificates.list(&query)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names() {
        for ok in ["mbp", "web-1", "a", "host.example_01", "9lives"] {
            assert!(validate_node_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "-lead", ".hidden", "has space", "emoji🙂", "semi;colon"] {
            assert!(validate_node_name(bad).is_err(), "{bad}");
        }
        assert!(validate_node_name(&"a".repeat(255)).is_ok());
        assert!(validate_node_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn groups_by_class() {
        assert_eq!(groups_for(NodeClass::Laptop, None), vec!["developer"]);
        assert_eq!(groups_for(NodeClass::Ec2, None), vec!["ec2"]);
        assert_eq!(
            groups_for(NodeClass::Ec2, Some(Environment::Prod)),
            vec!["ec2", "ec2-prod"]
        );
    }
}
