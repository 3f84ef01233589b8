//! Boundary operations of the formation engine.
//!
//! `FormationEngine` is a cheap clone handle. Membership, lifecycle, callback and
//! resynchronization logic lives in `assignments`, `lifecycle` and `resync` as
//! further `impl EngineInner` blocks.

use crate::config::Config;
use crate::constraints::operators::OperatorRegistry;
use crate::constraints::{
    ConstraintEngine, ConstraintType, Decision, FormationConstraint, JoinPoint, JoinPointDetails,
};
use crate::cursor::{Cursor, assignment_key, paginate};
use crate::dispatcher::Dispatcher;
use crate::errors::{FormationError, Result};
use crate::providers::{
    DestinationProvider, ParticipantAttributes, ParticipantProvider, TenantHierarchy,
};
use crate::store::{FormationEntry, Store};
use crate::transport::NotificationTransport;
use crate::types::{
    Formation, FormationAssignment, FormationStatus, FormationTemplate, Page, Participant,
    ParticipantKind,
};
use crate::webhooks::{Webhook, WebhookRegistry};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// External collaborators the engine consumes.
pub struct Collaborators {
    pub participants: Arc<dyn ParticipantProvider>,
    pub tenants: Arc<dyn TenantHierarchy>,
    pub destinations: Arc<dyn DestinationProvider>,
    pub transport: Arc<dyn NotificationTransport>,
}

pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) store: Arc<Store>,
    templates: RwLock<IndexMap<String, FormationTemplate>>,
    pub(crate) webhooks: WebhookRegistry,
    pub(crate) constraints: ConstraintEngine,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) participants: Arc<dyn ParticipantProvider>,
    pub(crate) tenants: Arc<dyn TenantHierarchy>,
}

#[derive(Clone)]
pub struct FormationEngine {
    inner: Arc<EngineInner>,
}

impl FormationEngine {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let store = Arc::new(Store::new());
        let operators = OperatorRegistry::new(store.clone(), collaborators.destinations);

        let mut templates = IndexMap::new();
        let default = FormationTemplate::permissive(&config.default_formation_template);
        templates.insert(default.id.clone(), default);

        let inner = EngineInner {
            webhooks: WebhookRegistry::new(config.strict_templates),
            constraints: ConstraintEngine::new(operators),
            dispatcher: Dispatcher::new(collaborators.transport),
            participants: collaborators.participants,
            tenants: collaborators.tenants,
            templates: RwLock::new(templates),
            store,
            config,
        };
        FormationEngine {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn register_formation_template(&self, template: FormationTemplate) -> Result<()> {
        let mut templates = self.inner.templates.write();
        if templates.contains_key(&template.id) {
            return Err(FormationError::AlreadyExists {
                kind: "formation template",
                id: template.id,
            });
        }
        tracing::info!(template_id = %template.id, name = %template.name, "registered formation template");
        templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn formation_templates(&self) -> Vec<FormationTemplate> {
        self.inner.templates.read().values().cloned().collect()
    }

    pub fn register_webhook(&self, webhook: Webhook) -> Result<Arc<Webhook>> {
        Ok(self.inner.webhooks.register(webhook)?)
    }

    pub fn delete_webhook(&self, id: &str) -> Result<Arc<Webhook>> {
        Ok(self.inner.webhooks.delete(id)?)
    }

    pub fn create_constraint(
        &self,
        constraint: FormationConstraint,
    ) -> Result<Arc<FormationConstraint>> {
        Ok(self.inner.constraints.create(constraint)?)
    }

    pub fn delete_constraint(&self, id: &str) -> Result<Arc<FormationConstraint>> {
        Ok(self.inner.constraints.delete(id)?)
    }

    pub fn attach_constraint(&self, constraint_id: &str, template_id: &str) -> Result<()> {
        if !self.inner.templates.read().contains_key(template_id) {
            return Err(FormationError::not_found("formation template", template_id));
        }
        Ok(self.inner.constraints.attach(constraint_id, template_id)?)
    }

    pub fn detach_constraint(&self, constraint_id: &str, template_id: &str) -> Result<()> {
        Ok(self.inner.constraints.detach(constraint_id, template_id)?)
    }

    pub fn list_constraints(&self) -> Vec<Arc<FormationConstraint>> {
        self.inner.constraints.list()
    }

    pub async fn create_formation(
        &self,
        tenant: &str,
        name: &str,
        template: Option<&str>,
    ) -> Result<Formation> {
        self.inner.create_formation(tenant, name, template).await
    }

    pub async fn delete_formation(&self, tenant: &str, name: &str) -> Result<Formation> {
        self.inner.delete_formation(tenant, name).await
    }

    pub fn get_formation(&self, tenant: &str, id_or_name: &str) -> Result<Formation> {
        self.inner
            .find(tenant, id_or_name)
            .map(|entry| entry.snapshot())
    }

    pub fn list_formations(
        &self,
        tenant: &str,
        first: Option<usize>,
        after: Option<&str>,
    ) -> Result<Page<Formation>> {
        let after = parse_cursor(after)?;
        let formations: Vec<Formation> = self
            .inner
            .store
            .list(tenant)
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        let (data, page_info, total_count) =
            paginate(formations, first, after.as_ref(), |f| vec![f.name.clone()]);
        Ok(Page {
            data,
            page_info,
            total_count,
        })
    }

    pub async fn assign(
        &self,
        tenant: &str,
        formation: &str,
        object_id: &str,
        kind: ParticipantKind,
    ) -> Result<Formation> {
        self.inner.assign(tenant, formation, object_id, kind).await
    }

    pub async fn unassign(
        &self,
        tenant: &str,
        formation: &str,
        object_id: &str,
        kind: ParticipantKind,
    ) -> Result<Formation> {
        self.inner.unassign(tenant, formation, object_id, kind).await
    }

    pub async fn resynchronize(
        &self,
        tenant: &str,
        formation_id: &str,
        reset: bool,
    ) -> Result<Formation> {
        self.inner.resynchronize(tenant, formation_id, reset).await
    }

    pub fn list_formation_assignments(
        &self,
        tenant: &str,
        formation_id: &str,
        first: Option<usize>,
        after: Option<&str>,
    ) -> Result<Page<FormationAssignment>> {
        let after = parse_cursor(after)?;
        let entry = self.inner.find(tenant, formation_id)?;
        let (data, page_info, total_count) =
            paginate(entry.assignments(), first, after.as_ref(), assignment_key);
        Ok(Page {
            data,
            page_info,
            total_count,
        })
    }

    pub fn get_formation_status(&self, tenant: &str, formation_id: &str) -> Result<FormationStatus> {
        Ok(self.inner.find(tenant, formation_id)?.snapshot().status)
    }

    pub async fn report_assignment_status(
        &self,
        formation_id: &str,
        assignment_id: &str,
        report: serde_json::Value,
    ) -> Result<Option<FormationAssignment>> {
        self.inner
            .report_assignment_status(formation_id, assignment_id, report)
            .await
    }

    pub async fn report_formation_status(
        &self,
        formation_id: &str,
        report: crate::lifecycle::FormationStatusReport,
    ) -> Result<Option<Formation>> {
        self.inner
            .report_formation_status(formation_id, report)
            .await
    }
}

fn parse_cursor(after: Option<&str>) -> Result<Option<Cursor>> {
    after
        .map(|raw| {
            raw.parse::<Cursor>()
                .map_err(|e| FormationError::Validation(format!("invalid cursor: {e}")))
        })
        .transpose()
}

impl EngineInner {
    pub(crate) fn find(&self, tenant: &str, id_or_name: &str) -> Result<Arc<FormationEntry>> {
        self.store
            .find(tenant, id_or_name)
            .ok_or_else(|| FormationError::not_found("formation", id_or_name))
    }

    /// Template by id, falling back to a lookup by name.
    pub(crate) fn template(&self, id_or_name: &str) -> Option<FormationTemplate> {
        let templates = self.templates.read();
        templates
            .get(id_or_name)
            .or_else(|| templates.values().find(|t| t.name == id_or_name))
            .cloned()
    }

    pub(crate) async fn attributes(
        &self,
        participant: &Participant,
    ) -> Result<Option<ParticipantAttributes>> {
        let Some(mut attributes) = self
            .participants
            .participant(&participant.id, participant.kind)
            .await?
        else {
            return Ok(None);
        };
        // Runtime contexts are typed by their parent runtime.
        if attributes.kind == ParticipantKind::RuntimeContext
            && attributes.subtype.is_none()
            && let Some(runtime_id) = &attributes.parent_runtime_id
        {
            attributes.subtype = self
                .participants
                .participant(runtime_id, ParticipantKind::Runtime)
                .await?
                .and_then(|runtime| runtime.subtype);
        }
        Ok(Some(attributes))
    }

    /// Attributes of a participant, reduced to its identity when the registry no longer knows it.
    pub(crate) async fn attributes_or_bare(&self, participant: &Participant) -> ParticipantAttributes {
        match self.attributes(participant).await {
            Ok(Some(attributes)) => attributes,
            Ok(None) => ParticipantAttributes::bare(participant),
            Err(e) => {
                tracing::warn!(participant = %participant, error = %e, "participant lookup failed");
                ParticipantAttributes::bare(participant)
            }
        }
    }

    /// PRE enforcement whose denial aborts the calling operation.
    pub(crate) async fn enforce_pre(
        &self,
        join_point: JoinPoint,
        details: &mut JoinPointDetails<'_>,
    ) -> Result<Decision> {
        match self
            .constraints
            .enforce(join_point, ConstraintType::Pre, details)
            .await?
        {
            Decision::Deny { constraint, reason } => {
                Err(FormationError::ConstraintDenied { constraint, reason })
            }
            decision => Ok(decision),
        }
    }

    /// POST enforcement. The operation already happened, so denials and failures are only logged.
    pub(crate) async fn enforce_post(&self, join_point: JoinPoint, details: &mut JoinPointDetails<'_>) -> Decision {
        match self
            .constraints
            .enforce(join_point, ConstraintType::Post, details)
            .await
        {
            Ok(Decision::Deny { constraint, reason }) => {
                tracing::warn!(
                    join_point = %join_point,
                    constraint = %constraint,
                    reason = %reason,
                    "post constraint denied a completed operation"
                );
                Decision::Allow
            }
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(join_point = %join_point, error = %e, "post constraint failed");
                Decision::Allow
            }
        }
    }
}
