//! Pre and post hooks evaluated at named join points.
//!
//! A constraint applies when it is global or attached to the formation's template,
//! targets the join point and type being enforced, and matches the acted-on
//! resource type and subtype. Matching constraints run by descending priority,
//! ties broken by id. The first denial aborts evaluation.

pub mod operators;

use crate::context::NotificationContext;
use crate::metrics_defs::CONSTRAINT_DENIALS;
use crate::providers::ParticipantAttributes;
use crate::template::Template;
use crate::types::{
    AssignmentState, Formation, FormationAssignment, NotificationError, Operation, ParticipantKind,
};
use indexmap::IndexMap;
use operators::OperatorRegistry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Matches every subtype of the constraint's resource type.
pub const ANY_SUBTYPE: &str = "ANY";

#[derive(thiserror::Error, Debug)]
pub enum ConstraintError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("constraint already exists: {0}")]
    Duplicate(String),
    #[error("constraint not found: {0}")]
    NotFound(String),
    #[error("constraint {constraint} rendered invalid operator input: {reason}")]
    InvalidInput { constraint: String, reason: String },
    #[error("operator {operator} failed: {reason}")]
    OperatorFailed { operator: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintType {
    Pre,
    Post,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinPoint {
    AssignFormation,
    UnassignFormation,
    CreateFormation,
    DeleteFormation,
    GenerateFormationAssignmentNotification,
    SendNotification,
    NotificationStatusReturned,
}

impl JoinPoint {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinPoint::AssignFormation => "AssignFormation",
            JoinPoint::UnassignFormation => "UnassignFormation",
            JoinPoint::CreateFormation => "CreateFormation",
            JoinPoint::DeleteFormation => "DeleteFormation",
            JoinPoint::GenerateFormationAssignmentNotification => {
                "GenerateFormationAssignmentNotification"
            }
            JoinPoint::SendNotification => "SendNotification",
            JoinPoint::NotificationStatusReturned => "NotificationStatusReturned",
        }
    }
}

impl fmt::Display for JoinPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintScope {
    Global,
    FormationType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Application,
    Runtime,
    RuntimeContext,
    Tenant,
    Formation,
}

impl From<ParticipantKind> for ResourceType {
    fn from(kind: ParticipantKind) -> Self {
        match kind {
            ParticipantKind::Application => ResourceType::Application,
            ParticipantKind::Runtime => ResourceType::Runtime,
            ParticipantKind::RuntimeContext => ResourceType::RuntimeContext,
            ParticipantKind::Tenant => ResourceType::Tenant,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormationConstraint {
    pub id: String,
    pub name: String,
    pub constraint_type: ConstraintType,
    pub target_operation: JoinPoint,
    pub operator: String,
    pub resource_type: ResourceType,
    #[serde(default = "any_subtype")]
    pub resource_subtype: String,
    /// Renders the operator's JSON arguments from the join point context.
    #[serde(default)]
    pub input_template: Option<Template>,
    pub scope: ConstraintScope,
    #[serde(default)]
    pub priority: i32,
}

fn any_subtype() -> String {
    ANY_SUBTYPE.to_string()
}

impl FormationConstraint {
    fn applies_to(&self, resource_type: ResourceType, subtype: Option<&str>) -> bool {
        self.resource_type == resource_type
            && (self.resource_subtype == ANY_SUBTYPE || subtype == Some(self.resource_subtype.as_str()))
    }
}

/// What the triggering operation is acting on, handed to operators.
pub enum JoinPointDetails<'a> {
    /// Assign, unassign of `participant`.
    Membership {
        formation: &'a Formation,
        participant: &'a ParticipantAttributes,
        operation: Operation,
    },
    GenerateNotification {
        formation: &'a Formation,
        source: &'a ParticipantAttributes,
        target: &'a ParticipantAttributes,
        operation: Operation,
    },
    SendNotification {
        formation: &'a Formation,
        assignment: &'a FormationAssignment,
        target: &'a ParticipantAttributes,
        operation: Operation,
        context: &'a mut NotificationContext,
    },
    StatusReturned {
        formation: &'a Formation,
        assignment: &'a FormationAssignment,
        target: &'a ParticipantAttributes,
        operation: Operation,
        state: &'a mut AssignmentState,
        configuration: &'a mut Option<String>,
        error: Option<&'a NotificationError>,
    },
    Lifecycle {
        formation: &'a Formation,
        operation: Operation,
    },
}

impl JoinPointDetails<'_> {
    pub fn formation(&self) -> &Formation {
        match self {
            JoinPointDetails::Membership { formation, .. }
            | JoinPointDetails::GenerateNotification { formation, .. }
            | JoinPointDetails::SendNotification { formation, .. }
            | JoinPointDetails::StatusReturned { formation, .. }
            | JoinPointDetails::Lifecycle { formation, .. } => formation,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            JoinPointDetails::Membership { operation, .. }
            | JoinPointDetails::GenerateNotification { operation, .. }
            | JoinPointDetails::SendNotification { operation, .. }
            | JoinPointDetails::StatusReturned { operation, .. }
            | JoinPointDetails::Lifecycle { operation, .. } => *operation,
        }
    }

    /// The resource constraints are matched against.
    fn resource(&self) -> (ResourceType, Option<&str>) {
        match self {
            JoinPointDetails::Membership { participant, .. } => {
                (participant.kind.into(), participant.subtype.as_deref())
            }
            JoinPointDetails::GenerateNotification { target, .. }
            | JoinPointDetails::SendNotification { target, .. }
            | JoinPointDetails::StatusReturned { target, .. } => {
                (target.kind.into(), target.subtype.as_deref())
            }
            JoinPointDetails::Lifecycle { formation, .. } => {
                (ResourceType::Formation, Some(formation.template_name.as_str()))
            }
        }
    }

    /// Fields available to constraint input templates.
    pub fn template_context(&self) -> Value {
        let formation = self.formation();
        let (resource_type, resource_subtype) = self.resource();
        let mut ctx = json!({
            "Operation": self.operation(),
            "FormationID": formation.id,
            "FormationName": formation.name,
            "FormationTemplateID": formation.template_id,
            "TenantID": formation.tenant_id,
            "ResourceType": resource_type,
            "ResourceSubtype": resource_subtype,
        });
        let extra = match self {
            JoinPointDetails::Membership { participant, .. } => json!({
                "ResourceID": participant.id,
            }),
            JoinPointDetails::GenerateNotification { source, target, .. } => json!({
                "ResourceID": target.id,
                "SourceResourceID": source.id,
                "SourceResourceType": ResourceType::from(source.kind),
                "SourceResourceSubtype": source.subtype,
            }),
            JoinPointDetails::SendNotification {
                assignment,
                target,
                context,
                ..
            } => json!({
                "ResourceID": target.id,
                "AssignmentID": assignment.id,
                "Notification": context.to_value(),
            }),
            JoinPointDetails::StatusReturned {
                assignment,
                target,
                state,
                configuration,
                ..
            } => json!({
                "ResourceID": target.id,
                "AssignmentID": assignment.id,
                "State": state.as_str(),
                "Configuration": configuration,
            }),
            JoinPointDetails::Lifecycle { formation, .. } => json!({
                "ResourceID": formation.id,
            }),
        };
        if let (Value::Object(ctx), Value::Object(extra)) = (&mut ctx, extra) {
            ctx.extend(extra);
        }
        ctx
    }
}

/// Result of a single operator.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(String),
    /// Suppress the notification the join point would produce.
    Skip,
    /// The operator rewrote the join point details.
    Mutated,
}

/// Combined result of every constraint enforced at a join point.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Allow,
    Mutated,
    Skip,
    Deny { constraint: String, reason: String },
}

pub struct ConstraintEngine {
    constraints: RwLock<IndexMap<String, Arc<FormationConstraint>>>,
    /// Formation template id to attached constraint ids.
    attachments: RwLock<HashMap<String, BTreeSet<String>>>,
    operators: OperatorRegistry,
}

impl ConstraintEngine {
    pub fn new(operators: OperatorRegistry) -> Self {
        ConstraintEngine {
            constraints: RwLock::new(IndexMap::new()),
            attachments: RwLock::new(HashMap::new()),
            operators,
        }
    }

    pub fn create(&self, constraint: FormationConstraint) -> Result<Arc<FormationConstraint>, ConstraintError> {
        if self.operators.get(&constraint.operator).is_none() {
            return Err(ConstraintError::UnknownOperator(constraint.operator));
        }
        let mut constraints = self.constraints.write();
        if constraints.contains_key(&constraint.id) {
            return Err(ConstraintError::Duplicate(constraint.id));
        }
        tracing::info!(
            constraint_id = %constraint.id,
            operator = %constraint.operator,
            join_point = %constraint.target_operation,
            "created constraint"
        );
        let constraint = Arc::new(constraint);
        constraints.insert(constraint.id.clone(), constraint.clone());
        Ok(constraint)
    }

    pub fn delete(&self, id: &str) -> Result<Arc<FormationConstraint>, ConstraintError> {
        let removed = self
            .constraints
            .write()
            .shift_remove(id)
            .ok_or_else(|| ConstraintError::NotFound(id.to_string()))?;
        for attached in self.attachments.write().values_mut() {
            attached.remove(id);
        }
        Ok(removed)
    }

    pub fn attach(&self, constraint_id: &str, template_id: &str) -> Result<(), ConstraintError> {
        if !self.constraints.read().contains_key(constraint_id) {
            return Err(ConstraintError::NotFound(constraint_id.to_string()));
        }
        self.attachments
            .write()
            .entry(template_id.to_string())
            .or_default()
            .insert(constraint_id.to_string());
        Ok(())
    }

    pub fn detach(&self, constraint_id: &str, template_id: &str) -> Result<(), ConstraintError> {
        let removed = self
            .attachments
            .write()
            .get_mut(template_id)
            .is_some_and(|attached| attached.remove(constraint_id));
        if removed {
            tracing::info!(constraint_id, template_id, "detached constraint");
            Ok(())
        } else {
            Err(ConstraintError::NotFound(constraint_id.to_string()))
        }
    }

    pub fn list(&self) -> Vec<Arc<FormationConstraint>> {
        self.constraints.read().values().cloned().collect()
    }

    /// Constraints for a join point, in evaluation order. Taken as a snapshot so
    /// detaching during an evaluation does not affect it.
    fn select(
        &self,
        join_point: JoinPoint,
        constraint_type: ConstraintType,
        details: &JoinPointDetails<'_>,
    ) -> Vec<Arc<FormationConstraint>> {
        let template_id = &details.formation().template_id;
        let (resource_type, subtype) = details.resource();
        let attachments = self.attachments.read();
        let attached = attachments.get(template_id.as_str());

        let mut selected: Vec<_> = self
            .constraints
            .read()
            .values()
            .filter(|c| c.target_operation == join_point && c.constraint_type == constraint_type)
            .filter(|c| match c.scope {
                ConstraintScope::Global => true,
                ConstraintScope::FormationType => attached.is_some_and(|ids| ids.contains(&c.id)),
            })
            .filter(|c| c.applies_to(resource_type, subtype))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        selected
    }

    pub async fn enforce(
        &self,
        join_point: JoinPoint,
        constraint_type: ConstraintType,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Decision, ConstraintError> {
        let selected = self.select(join_point, constraint_type, details);
        let mut decision = Decision::Allow;

        for constraint in selected {
            let operator = self
                .operators
                .get(&constraint.operator)
                .ok_or_else(|| ConstraintError::UnknownOperator(constraint.operator.clone()))?;

            let input = match &constraint.input_template {
                Some(template) => {
                    let rendered = template.render(&details.template_context());
                    if rendered.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&rendered).map_err(|e| ConstraintError::InvalidInput {
                            constraint: constraint.id.clone(),
                            reason: e.to_string(),
                        })?
                    }
                }
                None => Value::Object(Default::default()),
            };

            let verdict = operator.apply(input, details).await?;
            tracing::debug!(
                constraint_id = %constraint.id,
                join_point = %join_point,
                verdict = ?verdict,
                "constraint evaluated"
            );

            match verdict {
                Verdict::Allow => {}
                Verdict::Mutated => {
                    if decision == Decision::Allow {
                        decision = Decision::Mutated;
                    }
                }
                Verdict::Skip => decision = Decision::Skip,
                Verdict::Deny(reason) => {
                    shared::counter!(CONSTRAINT_DENIALS, "join_point" => join_point.as_str())
                        .increment(1);
                    tracing::info!(
                        constraint_id = %constraint.id,
                        join_point = %join_point,
                        reason = %reason,
                        "constraint denied operation"
                    );
                    return Ok(Decision::Deny {
                        constraint: constraint.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{TestHarness, formation};
    use crate::types::Participant;

    fn constraint(id: &str, priority: i32, scope: ConstraintScope) -> FormationConstraint {
        FormationConstraint {
            id: id.into(),
            name: format!("constraint {id}"),
            constraint_type: ConstraintType::Pre,
            target_operation: JoinPoint::AssignFormation,
            operator: operators::DOES_NOT_CONTAIN_RESOURCE_OF_SUBTYPE.into(),
            resource_type: ResourceType::Application,
            resource_subtype: ANY_SUBTYPE.into(),
            input_template: None,
            scope,
            priority,
        }
    }

    #[test]
    fn test_selection_order_and_scope() {
        let harness = TestHarness::new();
        let engine = harness.constraint_engine();
        engine.create(constraint("b", 0, ConstraintScope::Global)).unwrap();
        engine.create(constraint("a", 0, ConstraintScope::Global)).unwrap();
        engine.create(constraint("z", 10, ConstraintScope::Global)).unwrap();
        engine.create(constraint("scoped", 5, ConstraintScope::FormationType)).unwrap();
        let mut typed = constraint("runtime-only", 0, ConstraintScope::Global);
        typed.resource_type = ResourceType::Runtime;
        engine.create(typed).unwrap();

        let formation = formation("t1", "F");
        let participant = ParticipantAttributes::bare(&Participant::new("app1", ParticipantKind::Application));
        let details = JoinPointDetails::Membership {
            formation: &formation,
            participant: &participant,
            operation: Operation::Assign,
        };

        let ids = |engine: &ConstraintEngine| -> Vec<String> {
            engine
                .select(JoinPoint::AssignFormation, ConstraintType::Pre, &details)
                .iter()
                .map(|c| c.id.clone())
                .collect()
        };
        assert_eq!(ids(&engine), vec!["z", "a", "b"]);

        engine.attach("scoped", &formation.template_id).unwrap();
        assert_eq!(ids(&engine), vec!["z", "scoped", "a", "b"]);

        engine.detach("scoped", &formation.template_id).unwrap();
        assert_eq!(ids(&engine), vec!["z", "a", "b"]);
        assert!(engine.detach("scoped", &formation.template_id).is_err());

        assert!(engine.select(JoinPoint::UnassignFormation, ConstraintType::Pre, &details).is_empty());
        assert!(engine.select(JoinPoint::AssignFormation, ConstraintType::Post, &details).is_empty());
    }

    #[test]
    fn test_subtype_matching() {
        let mut c = constraint("c", 0, ConstraintScope::Global);
        assert!(c.applies_to(ResourceType::Application, None));
        c.resource_subtype = "app-type".into();
        assert!(c.applies_to(ResourceType::Application, Some("app-type")));
        assert!(!c.applies_to(ResourceType::Application, Some("other")));
        assert!(!c.applies_to(ResourceType::Application, None));
        assert!(!c.applies_to(ResourceType::Runtime, Some("app-type")));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let harness = TestHarness::new();
        let engine = harness.constraint_engine();
        let mut c = constraint("c", 0, ConstraintScope::Global);
        c.operator = "NoSuchOperator".into();
        assert!(matches!(engine.create(c), Err(ConstraintError::UnknownOperator(_))));
        assert!(matches!(engine.attach("missing", "tpl"), Err(ConstraintError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_rendered_input() {
        let harness = TestHarness::new();
        let engine = harness.constraint_engine();
        let mut c = constraint("c", 0, ConstraintScope::Global);
        c.input_template = Some(Template::parse("{ not json").unwrap());
        engine.create(c).unwrap();

        let formation = formation("t1", "F");
        let participant = ParticipantAttributes::bare(&Participant::new("app1", ParticipantKind::Application));
        let mut details = JoinPointDetails::Membership {
            formation: &formation,
            participant: &participant,
            operation: Operation::Assign,
        };
        let result = engine
            .enforce(JoinPoint::AssignFormation, ConstraintType::Pre, &mut details)
            .await;
        assert!(matches!(result, Err(ConstraintError::InvalidInput { .. })));
    }

    #[test]
    fn test_template_context() {
        let formation = formation("t1", "F");
        let source = ParticipantAttributes {
            subtype: Some("src-type".into()),
            ..ParticipantAttributes::bare(&Participant::new("app1", ParticipantKind::Application))
        };
        let target = ParticipantAttributes::bare(&Participant::new("rt1", ParticipantKind::Runtime));
        let details = JoinPointDetails::GenerateNotification {
            formation: &formation,
            source: &source,
            target: &target,
            operation: Operation::Assign,
        };
        let ctx = details.template_context();
        assert_eq!(ctx["ResourceType"], "RUNTIME");
        assert_eq!(ctx["ResourceID"], "rt1");
        assert_eq!(ctx["SourceResourceSubtype"], "src-type");
        assert_eq!(ctx["FormationTemplateID"], "tpl");
        assert_eq!(ctx["Operation"], "assign");
    }
}
