//! Named constraint operators.

use super::{ConstraintError, JoinPointDetails, Verdict};
use crate::providers::{CertificateSpec, DestinationProvider, DestinationSpec};
use crate::store::Store;
use crate::types::{AssignmentState, Operation};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const IS_NOT_ASSIGNED_TO_ANY_FORMATION_OF_TYPE: &str = "IsNotAssignedToAnyFormationOfType";
pub const DOES_NOT_CONTAIN_RESOURCE_OF_SUBTYPE: &str = "DoesNotContainResourceOfSubtype";
pub const DO_NOT_GENERATE_FORMATION_ASSIGNMENT_NOTIFICATION: &str =
    "DoNotGenerateFormationAssignmentNotification";
pub const DESTINATION_CREATOR: &str = "DestinationCreator";

/// Inbound authentications that are issued a certificate by the destination creator.
pub const CERTIFICATE_AUTHENTICATIONS: &[&str] =
    &["samlAssertion", "clientCertificateAuthentication", "oauth2mtls"];

#[async_trait]
pub trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    /// `input` is the constraint's rendered input template, `{}` when it has none.
    async fn apply(
        &self,
        input: Value,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Verdict, ConstraintError>;
}

fn parse_input<T: for<'de> Deserialize<'de>>(
    operator: &'static str,
    input: Value,
) -> Result<T, ConstraintError> {
    serde_json::from_value(input).map_err(|e| ConstraintError::OperatorFailed {
        operator,
        reason: format!("invalid input: {e}"),
    })
}

pub struct OperatorRegistry {
    operators: HashMap<&'static str, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    /// Registry with every built-in operator.
    pub fn new(store: Arc<Store>, destinations: Arc<dyn DestinationProvider>) -> Self {
        let mut registry = OperatorRegistry {
            operators: HashMap::new(),
        };
        registry.register(Arc::new(IsNotAssignedToAnyFormationOfType {
            store: store.clone(),
        }));
        registry.register(Arc::new(DoesNotContainResourceOfSubtype { store }));
        registry.register(Arc::new(DoNotGenerateFormationAssignmentNotification));
        registry.register(Arc::new(DestinationCreator { destinations }));
        registry
    }

    pub fn register(&mut self, operator: Arc<dyn Operator>) {
        self.operators.insert(operator.name(), operator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(name).cloned()
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FormationTypeExceptions {
    /// Formation template names the operator does not apply to.
    except_formation_types: Vec<String>,
}

/// Denies assigning a participant already assigned to another formation of the same template.
pub struct IsNotAssignedToAnyFormationOfType {
    store: Arc<Store>,
}

#[async_trait]
impl Operator for IsNotAssignedToAnyFormationOfType {
    fn name(&self) -> &'static str {
        IS_NOT_ASSIGNED_TO_ANY_FORMATION_OF_TYPE
    }

    async fn apply(
        &self,
        input: Value,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Verdict, ConstraintError> {
        let JoinPointDetails::Membership {
            formation,
            participant,
            operation: Operation::Assign,
        } = details
        else {
            return Ok(Verdict::Allow);
        };
        let input: FormationTypeExceptions = parse_input(self.name(), input)?;
        if input.except_formation_types.contains(&formation.template_name) {
            return Ok(Verdict::Allow);
        }

        let others: Vec<_> = self
            .store
            .formations_containing(
                &formation.tenant_id,
                &formation.template_id,
                &participant.participant(),
            )
            .into_iter()
            .filter(|id| *id != formation.id)
            .collect();

        match others.first() {
            None => Ok(Verdict::Allow),
            Some(other) => Ok(Verdict::Deny(format!(
                "{} {} is already assigned to formation {other} of type {}",
                participant.kind, participant.id, formation.template_name
            ))),
        }
    }
}

/// Denies assigning a participant when the formation already holds another one of the same subtype.
pub struct DoesNotContainResourceOfSubtype {
    store: Arc<Store>,
}

#[async_trait]
impl Operator for DoesNotContainResourceOfSubtype {
    fn name(&self) -> &'static str {
        DOES_NOT_CONTAIN_RESOURCE_OF_SUBTYPE
    }

    async fn apply(
        &self,
        _input: Value,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Verdict, ConstraintError> {
        let JoinPointDetails::Membership {
            formation,
            participant,
            operation: Operation::Assign,
        } = details
        else {
            return Ok(Verdict::Allow);
        };
        let Some(entry) = self.store.get(&formation.id) else {
            return Ok(Verdict::Allow);
        };

        let own = participant.participant();
        let existing = entry
            .members_of(participant.kind, participant.subtype.as_deref())
            .into_iter()
            .any(|p| p != own);
        if existing {
            Ok(Verdict::Deny(format!(
                "formation {} already contains a {} of subtype {}",
                formation.name,
                participant.kind,
                participant.subtype.as_deref().unwrap_or("none")
            )))
        } else {
            Ok(Verdict::Allow)
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SubtypeExceptions {
    /// Source subtypes that still produce a notification.
    except_subtypes: Vec<String>,
}

/// Suppresses notifications to the matched target unless the source subtype is exempt.
pub struct DoNotGenerateFormationAssignmentNotification;

#[async_trait]
impl Operator for DoNotGenerateFormationAssignmentNotification {
    fn name(&self) -> &'static str {
        DO_NOT_GENERATE_FORMATION_ASSIGNMENT_NOTIFICATION
    }

    async fn apply(
        &self,
        input: Value,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Verdict, ConstraintError> {
        let JoinPointDetails::GenerateNotification { source, .. } = details else {
            return Ok(Verdict::Allow);
        };
        let input: SubtypeExceptions = parse_input(self.name(), input)?;
        let exempt = source
            .subtype
            .as_ref()
            .is_some_and(|subtype| input.except_subtypes.contains(subtype));
        Ok(if exempt { Verdict::Allow } else { Verdict::Skip })
    }
}

/// Provisions destinations and certificates requested through assignment configurations.
pub struct DestinationCreator {
    destinations: Arc<dyn DestinationProvider>,
}

impl DestinationCreator {
    fn failed(&self, reason: impl std::fmt::Display) -> ConstraintError {
        ConstraintError::OperatorFailed {
            operator: DESTINATION_CREATOR,
            reason: reason.to_string(),
        }
    }

    /// Issues certificates for the inbound authentications the other side asked for and
    /// writes them into the context the notification is rendered from.
    async fn issue_certificates(
        &self,
        assignment_id: &str,
        configuration: &mut Value,
    ) -> Result<bool, ConstraintError> {
        let Some(Value::Object(inbound)) =
            configuration.pointer_mut("/credentials/inboundCommunication")
        else {
            return Ok(false);
        };

        let mut issued = false;
        for (authentication, entry) in inbound.iter_mut() {
            if !CERTIFICATE_AUTHENTICATIONS.contains(&authentication.as_str()) {
                continue;
            }
            let Value::Object(entry) = entry else { continue };
            let certificate = self
                .destinations
                .create_certificate(&CertificateSpec {
                    name: format!("{assignment_id}-{authentication}"),
                    authentication: authentication.clone(),
                })
                .await
                .map_err(|e| self.failed(e))?;
            entry.insert("certificate".into(), Value::String(certificate.pem));
            issued = true;
        }
        Ok(issued)
    }

    async fn remove_provisioned(
        &self,
        assignment_id: &str,
        configuration: Option<&str>,
    ) -> Result<(), ConstraintError> {
        let destinations = configuration
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|config| config.get("destinations").and_then(Value::as_array).cloned())
            .unwrap_or_default();
        for destination in destinations {
            if let Some(name) = destination.get("name").and_then(Value::as_str) {
                self.destinations
                    .delete_destination(name)
                    .await
                    .map_err(|e| self.failed(e))?;
            }
        }
        for authentication in CERTIFICATE_AUTHENTICATIONS {
            self.destinations
                .delete_certificate(&format!("{assignment_id}-{authentication}"))
                .await
                .map_err(|e| self.failed(e))?;
        }
        Ok(())
    }

    /// Creates the destinations of a returned configuration. Returns the configuration
    /// with credentials stripped from the destination entries.
    async fn create_destinations(&self, raw: &str) -> Result<Option<String>, ConstraintError> {
        let Ok(mut config) = serde_json::from_str::<Value>(raw) else {
            return Ok(None);
        };
        let Some(Value::Array(entries)) = config.get_mut("destinations") else {
            return Ok(None);
        };

        for entry in entries.iter_mut() {
            let spec: DestinationSpec =
                serde_json::from_value(entry.clone()).map_err(|e| self.failed(e))?;
            self.destinations
                .create_destination(&spec)
                .await
                .map_err(|e| self.failed(e))?;

            let mut stripped = Map::new();
            stripped.insert("name".into(), Value::String(spec.name));
            stripped.insert("type".into(), Value::String(spec.destination_type));
            stripped.insert("url".into(), Value::String(spec.url));
            stripped.insert("authentication".into(), Value::String(spec.authentication));
            *entry = Value::Object(stripped);
        }
        Ok(Some(config.to_string()))
    }
}

#[async_trait]
impl Operator for DestinationCreator {
    fn name(&self) -> &'static str {
        DESTINATION_CREATOR
    }

    async fn apply(
        &self,
        _input: Value,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Verdict, ConstraintError> {
        match details {
            JoinPointDetails::SendNotification {
                assignment,
                operation: Operation::Assign,
                context,
                ..
            } => {
                let Some(configuration) = context.reverse_configuration_mut() else {
                    return Ok(Verdict::Allow);
                };
                if self.issue_certificates(&assignment.id, configuration).await? {
                    Ok(Verdict::Mutated)
                } else {
                    Ok(Verdict::Allow)
                }
            }
            JoinPointDetails::SendNotification {
                assignment,
                operation: Operation::Unassign,
                ..
            } => {
                self.remove_provisioned(&assignment.id, assignment.configuration.as_deref())
                    .await?;
                Ok(Verdict::Allow)
            }
            JoinPointDetails::StatusReturned {
                operation: Operation::Assign,
                state,
                configuration,
                ..
            } => {
                if !matches!(**state, AssignmentState::Ready | AssignmentState::ConfigPending) {
                    return Ok(Verdict::Allow);
                }
                let Some(raw) = configuration.as_deref() else {
                    return Ok(Verdict::Allow);
                };
                match self.create_destinations(raw).await? {
                    Some(rewritten) => {
                        **configuration = Some(rewritten);
                        Ok(Verdict::Mutated)
                    }
                    None => Ok(Verdict::Allow),
                }
            }
            _ => Ok(Verdict::Allow),
        }
    }
}
