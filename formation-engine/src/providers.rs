//! Read-only collaborators the engine consumes, and in-memory implementations of them.

use crate::types::{Participant, ParticipantKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("invalid request to provider: {0}")]
    InvalidRequest(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateAttributes {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
}

/// Attributes of a participant as held by the resource registries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAttributes {
    pub id: String,
    pub kind: ParticipantKind,
    #[serde(default)]
    pub name: String,
    /// Application type, runtime type or tenant type. Checked against formation templates.
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub local_tenant_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub application_template: Option<TemplateAttributes>,
    /// Set for runtime contexts only.
    #[serde(default)]
    pub parent_runtime_id: Option<String>,
}

impl ParticipantAttributes {
    /// Attributes carrying nothing but the identity, used when the registry no longer knows the participant.
    pub fn bare(participant: &Participant) -> Self {
        ParticipantAttributes {
            id: participant.id.clone(),
            kind: participant.kind,
            name: String::new(),
            subtype: None,
            labels: BTreeMap::new(),
            base_url: None,
            namespace: None,
            local_tenant_id: None,
            tenant_id: None,
            region: None,
            subdomain: None,
            application_template: None,
            parent_runtime_id: None,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant::new(self.id.clone(), self.kind)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerTenantContext {
    pub account_id: String,
    /// Empty when the tenant has no parent.
    pub customer_id: String,
}

#[async_trait]
pub trait ParticipantProvider: Send + Sync {
    async fn participant(
        &self,
        id: &str,
        kind: ParticipantKind,
    ) -> Result<Option<ParticipantAttributes>, ProviderError>;
}

#[async_trait]
pub trait TenantHierarchy: Send + Sync {
    async fn customer_context(&self, tenant_id: &str)
    -> Result<CustomerTenantContext, ProviderError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DestinationSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub destination_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub authentication: String,
    /// Everything else the target sent for the destination, credentials included.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateSpec {
    pub name: String,
    /// Inbound authentication the certificate is issued for.
    pub authentication: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub name: String,
    pub pem: String,
}

/// Side-effecting destination service used by the destination creator operator.
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    async fn create_destination(&self, spec: &DestinationSpec) -> Result<(), ProviderError>;
    async fn delete_destination(&self, name: &str) -> Result<(), ProviderError>;
    async fn create_certificate(&self, spec: &CertificateSpec)
    -> Result<Certificate, ProviderError>;
    async fn delete_certificate(&self, name: &str) -> Result<(), ProviderError>;
}

#[derive(Default)]
pub struct StaticParticipants {
    participants: RwLock<HashMap<Participant, ParticipantAttributes>>,
}

impl StaticParticipants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, attributes: ParticipantAttributes) {
        self.participants
            .write()
            .insert(attributes.participant(), attributes);
    }

    pub fn remove(&self, participant: &Participant) -> Option<ParticipantAttributes> {
        self.participants.write().remove(participant)
    }
}

#[async_trait]
impl ParticipantProvider for StaticParticipants {
    async fn participant(
        &self,
        id: &str,
        kind: ParticipantKind,
    ) -> Result<Option<ParticipantAttributes>, ProviderError> {
        let key = Participant::new(id, kind);
        Ok(self.participants.read().get(&key).cloned())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    /// Parent customer, if any.
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Default)]
pub struct StaticTenants {
    parents: RwLock<HashMap<String, Option<String>>>,
}

impl StaticTenants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: TenantRecord) {
        self.parents.write().insert(tenant.id, tenant.parent);
    }
}

#[async_trait]
impl TenantHierarchy for StaticTenants {
    async fn customer_context(
        &self,
        tenant_id: &str,
    ) -> Result<CustomerTenantContext, ProviderError> {
        if tenant_id.is_empty() {
            return Err(ProviderError::InvalidRequest("empty tenant id".into()));
        }
        let customer_id = self
            .parents
            .read()
            .get(tenant_id)
            .cloned()
            .flatten()
            .unwrap_or_default();
        Ok(CustomerTenantContext {
            account_id: tenant_id.to_string(),
            customer_id,
        })
    }
}

/// Keeps created destinations and certificates in memory and issues synthetic certificates.
#[derive(Default)]
pub struct RecordingDestinations {
    destinations: RwLock<BTreeMap<String, DestinationSpec>>,
    certificates: RwLock<BTreeMap<String, Certificate>>,
}

impl RecordingDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.read().keys().cloned().collect()
    }

    pub fn destination(&self, name: &str) -> Option<DestinationSpec> {
        self.destinations.read().get(name).cloned()
    }

    pub fn certificate_names(&self) -> Vec<String> {
        self.certificates.read().keys().cloned().collect()
    }
}

#[async_trait]
impl DestinationProvider for RecordingDestinations {
    async fn create_destination(&self, spec: &DestinationSpec) -> Result<(), ProviderError> {
        if spec.name.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "destination name must not be empty".into(),
            ));
        }
        tracing::debug!(destination = %spec.name, "creating destination");
        self.destinations
            .write()
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_destination(&self, name: &str) -> Result<(), ProviderError> {
        tracing::debug!(destination = %name, "deleting destination");
        self.destinations.write().remove(name);
        Ok(())
    }

    async fn create_certificate(
        &self,
        spec: &CertificateSpec,
    ) -> Result<Certificate, ProviderError> {
        let certificate = Certificate {
            name: spec.name.clone(),
            pem: format!(
                "-----BEGIN CERTIFICATE-----\n{}:{}\n-----END CERTIFICATE-----",
                spec.authentication, spec.name
            ),
        };
        self.certificates
            .write()
            .insert(spec.name.clone(), certificate.clone());
        Ok(certificate)
    }

    async fn delete_certificate(&self, name: &str) -> Result<(), ProviderError> {
        self.certificates.write().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_customer_context() {
        let tenants = StaticTenants::new();
        tenants.insert(TenantRecord {
            id: "sub".into(),
            parent: Some("customer".into()),
        });
        tenants.insert(TenantRecord {
            id: "root".into(),
            parent: None,
        });

        let ctx = tenants.customer_context("sub").await.unwrap();
        assert_eq!(ctx.account_id, "sub");
        assert_eq!(ctx.customer_id, "customer");

        // No parent and unknown tenants both resolve to an empty customer id.
        assert_eq!(tenants.customer_context("root").await.unwrap().customer_id, "");
        assert_eq!(tenants.customer_context("other").await.unwrap().customer_id, "");
        assert!(tenants.customer_context("").await.is_err());
    }

    #[tokio::test]
    async fn test_static_participants() {
        let participants = StaticParticipants::new();
        let attrs = ParticipantAttributes {
            subtype: Some("app-type".into()),
            ..ParticipantAttributes::bare(&Participant::new("app1", ParticipantKind::Application))
        };
        participants.insert(attrs.clone());

        let found = participants
            .participant("app1", ParticipantKind::Application)
            .await
            .unwrap();
        assert_eq!(found, Some(attrs));

        // Same id, different kind.
        let missing = participants
            .participant("app1", ParticipantKind::Runtime)
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_recording_destinations() {
        let destinations = RecordingDestinations::new();
        let spec: DestinationSpec = serde_json::from_value(serde_json::json!({
            "name": "dest1",
            "type": "HTTP",
            "url": "http://example.com",
            "authentication": "BasicAuthentication",
            "user": "admin",
        }))
        .unwrap();
        assert_eq!(spec.properties.get("user"), Some(&Value::from("admin")));

        destinations.create_destination(&spec).await.unwrap();
        assert_eq!(destinations.destination_names(), vec!["dest1"]);
        destinations.delete_destination("dest1").await.unwrap();
        assert!(destinations.destination_names().is_empty());

        let cert = destinations
            .create_certificate(&CertificateSpec {
                name: "a1-samlAssertion".into(),
                authentication: "samlAssertion".into(),
            })
            .await
            .unwrap();
        assert!(cert.pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(destinations.certificate_names(), vec!["a1-samlAssertion"]);
    }
}
