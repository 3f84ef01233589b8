//! Formation lifecycle: create and delete notifications, independent of the members.

use crate::constraints::{JoinPoint, JoinPointDetails};
use crate::context::{FormationLifecycleContext, TemplateBag};
use crate::dispatcher::{NotificationKind, ResponseOutcome, interpret_report, interpret_response};
use crate::engine::EngineInner;
use crate::errors::{FormationError, Result};
use crate::metrics_defs::{CALLBACKS_RECEIVED, NOTIFICATION_FAILURES};
use crate::store::FormationEntry;
use crate::types::{
    AssignmentState, Formation, FormationState, FormationStatus, NotificationError, Operation,
};
use crate::webhooks::{Webhook, WebhookMode};
use http::HeaderValue;
use http::header::LOCATION;
use serde::Deserialize;
use std::sync::Arc;

/// Out-of-band status report for an asynchronous lifecycle notification.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FormationStatusReport {
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum LifecycleOutcome {
    /// The notification succeeded or none was needed.
    Done,
    /// Acknowledged; the status report is outstanding.
    Pending,
    Failed(NotificationError),
}

impl EngineInner {
    pub(crate) async fn create_formation(
        self: &Arc<Self>,
        tenant: &str,
        name: &str,
        template: Option<&str>,
    ) -> Result<Formation> {
        if name.trim().is_empty() {
            return Err(FormationError::Validation(
                "formation name must not be empty".into(),
            ));
        }
        let template_ref = template.unwrap_or(&self.config.default_formation_template);
        let template = self
            .template(template_ref)
            .ok_or_else(|| FormationError::not_found("formation template", template_ref))?;

        let formation = Formation {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            tenant_id: tenant.to_string(),
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            state: FormationState::Initial,
            error: None,
            status: FormationStatus::aggregate(FormationState::Initial, None, &[]),
        };
        let entry = self
            .store
            .insert(formation.clone())
            .map_err(|existing| FormationError::AlreadyExists {
                kind: "formation",
                id: existing.name,
            })?;

        let mut details = JoinPointDetails::Lifecycle {
            formation: &formation,
            operation: Operation::CreateFormation,
        };
        if let Err(e) = self.enforce_pre(JoinPoint::CreateFormation, &mut details).await {
            self.store.remove(&formation.id);
            return Err(e);
        }

        tracing::info!(
            formation_id = %formation.id,
            name = %formation.name,
            template = %formation.template_name,
            "created formation"
        );
        let outcome = self.drive_lifecycle(&entry, Operation::CreateFormation).await;
        self.finish_create(&entry, outcome).await;

        let snapshot = entry.snapshot();
        let mut details = JoinPointDetails::Lifecycle {
            formation: &snapshot,
            operation: Operation::CreateFormation,
        };
        self.enforce_post(JoinPoint::CreateFormation, &mut details).await;
        Ok(snapshot)
    }

    pub(crate) async fn delete_formation(
        self: &Arc<Self>,
        tenant: &str,
        name: &str,
    ) -> Result<Formation> {
        let entry = self
            .store
            .find_by_name(tenant, name)
            .ok_or_else(|| FormationError::not_found("formation", name))?;
        if let Some(stuck) = entry
            .assignments()
            .iter()
            .find(|a| a.state == AssignmentState::DeleteError)
        {
            return Err(FormationError::Validation(format!(
                "assignment {} is in DELETE_ERROR, resynchronize the formation first",
                stuck.id
            )));
        }

        let formation = entry.snapshot();
        let mut details = JoinPointDetails::Lifecycle {
            formation: &formation,
            operation: Operation::DeleteFormation,
        };
        self.enforce_pre(JoinPoint::DeleteFormation, &mut details).await?;

        entry.set_state(FormationState::Deleting, None);
        let outcome = self.drive_lifecycle(&entry, Operation::DeleteFormation).await;
        let snapshot = entry.snapshot();
        if let LifecycleOutcome::Failed(error) = self.finish_delete(&entry, outcome) {
            return Err(FormationError::NotificationFailed(error));
        }

        let mut details = JoinPointDetails::Lifecycle {
            formation: &snapshot,
            operation: Operation::DeleteFormation,
        };
        self.enforce_post(JoinPoint::DeleteFormation, &mut details).await;
        Ok(snapshot)
    }

    /// Sends the lifecycle notification for `operation`, if the formation's template has a webhook.
    pub(crate) async fn drive_lifecycle(
        &self,
        entry: &FormationEntry,
        operation: Operation,
    ) -> LifecycleOutcome {
        let _lifecycle = entry.lifecycle_lock.lock().await;
        let formation = entry.snapshot();
        let Some(webhook) = self.webhooks.resolve_lifecycle(&formation.template_id) else {
            return LifecycleOutcome::Done;
        };

        match self.send_lifecycle(&formation, &webhook, operation).await {
            Ok(ResponseOutcome::Success { .. }) => LifecycleOutcome::Done,
            Ok(ResponseOutcome::Incomplete { .. } | ResponseOutcome::Accepted { .. }) => {
                tracing::debug!(
                    formation_id = %formation.id,
                    operation = operation.as_str(),
                    "lifecycle notification pending"
                );
                LifecycleOutcome::Pending
            }
            Ok(ResponseOutcome::Failure(error)) | Err(error) => LifecycleOutcome::Failed(error),
        }
    }

    async fn send_lifecycle(
        &self,
        formation: &Formation,
        webhook: &Webhook,
        operation: Operation,
    ) -> std::result::Result<ResponseOutcome, NotificationError> {
        let technical = |e: &dyn std::fmt::Display| NotificationError::technical(e.to_string());

        let customer = self
            .tenants
            .customer_context(&formation.tenant_id)
            .await
            .map_err(|e| technical(&e))?;
        let formation_template = match self.template(&formation.template_id) {
            Some(template) => TemplateBag {
                id: template.id,
                name: template.name,
                labels: template.labels,
            },
            None => TemplateBag {
                id: formation.template_id.clone(),
                name: formation.template_name.clone(),
                labels: Default::default(),
            },
        };
        let context = FormationLifecycleContext {
            operation,
            formation_id: formation.id.clone(),
            formation: formation.into(),
            formation_template,
            customer_tenant_context: (&customer).into(),
            tenant_id: formation.tenant_id.clone(),
        };

        let mut request = webhook
            .render_request(&context.to_value())
            .map_err(|e| technical(&e))?;
        if webhook.mode == WebhookMode::AsyncCallback {
            let callback = self.config.formation_callback_url(&formation.id);
            let value = HeaderValue::from_str(&callback).map_err(|e| technical(&e))?;
            request.headers.insert(LOCATION, value);
        }

        let response = self
            .dispatcher
            .send(&request, NotificationKind::Lifecycle, webhook.mode)
            .await
            .map_err(|e| technical(&e))?;
        let output = webhook.output_template().map_err(|e| technical(&e))?;
        Ok(interpret_response(&output, webhook.mode, &response))
    }

    /// Applies the outcome of a create notification. Held assignments are released once READY.
    pub(crate) async fn finish_create(self: &Arc<Self>, entry: &Arc<FormationEntry>, outcome: LifecycleOutcome) {
        match outcome {
            LifecycleOutcome::Done => {
                entry.set_state(FormationState::Ready, None);
                self.drain(entry).await;
            }
            LifecycleOutcome::Pending => {}
            LifecycleOutcome::Failed(error) => {
                self.lifecycle_failed(entry, FormationState::CreateError, error)
            }
        }
    }

    /// Applies the outcome of a delete notification, removing the formation on success.
    pub(crate) fn finish_delete(
        &self,
        entry: &FormationEntry,
        outcome: LifecycleOutcome,
    ) -> LifecycleOutcome {
        match &outcome {
            LifecycleOutcome::Done => {
                self.store.remove(&entry.id());
                tracing::info!(formation_id = %entry.id(), "deleted formation");
            }
            LifecycleOutcome::Pending => {}
            LifecycleOutcome::Failed(error) => {
                self.lifecycle_failed(entry, FormationState::DeleteError, error.clone())
            }
        }
        outcome
    }

    fn lifecycle_failed(&self, entry: &FormationEntry, state: FormationState, error: NotificationError) {
        shared::counter!(NOTIFICATION_FAILURES, "kind" => NotificationKind::Lifecycle.as_str())
            .increment(1);
        tracing::warn!(
            formation_id = %entry.id(),
            state = ?state,
            error = %error,
            "formation lifecycle notification failed"
        );
        entry.set_state(state, Some(error));
    }

    /// Dispatches the notifications held back while the formation was not READY.
    async fn drain(self: &Arc<Self>, entry: &Arc<FormationEntry>) {
        let held: Vec<_> = entry
            .assignments()
            .into_iter()
            .filter(|a| {
                !a.is_reflexive()
                    && matches!(a.state, AssignmentState::Initial | AssignmentState::Deleting)
            })
            .map(|a| a.id)
            .collect();
        if !held.is_empty() {
            tracing::info!(formation_id = %entry.id(), count = held.len(), "draining held notifications");
            self.drive_many(entry, held).await;
        }
    }

    pub(crate) async fn report_formation_status(
        self: &Arc<Self>,
        formation_id: &str,
        report: FormationStatusReport,
    ) -> Result<Option<Formation>> {
        let entry = self
            .store
            .get(formation_id)
            .ok_or_else(|| FormationError::not_found("formation", formation_id))?;
        shared::counter!(CALLBACKS_RECEIVED, "kind" => NotificationKind::Lifecycle.as_str())
            .increment(1);

        let current = entry.state();
        let creating = matches!(current, FormationState::Initial | FormationState::CreateError);
        let deleting = matches!(current, FormationState::Deleting | FormationState::DeleteError);

        // The report goes through the lifecycle webhook's output template like an assignment report.
        let outcome = match self.webhooks.resolve_lifecycle(&entry.snapshot().template_id) {
            Some(webhook) => {
                let output = webhook
                    .output_template()
                    .map_err(|e| FormationError::Validation(e.to_string()))?;
                let body = serde_json::json!({"state": report.state, "error": report.error});
                interpret_report(&output, webhook.mode, &body)
            }
            None => match report.error.as_deref().filter(|e| !e.is_empty()) {
                Some(error) => ResponseOutcome::Failure(NotificationError::client(error)),
                None => ResponseOutcome::Success {
                    config: None,
                    state: Some(report.state.clone()),
                    location: None,
                },
            },
        };

        // The output template decides the state; a report it leaves without one keeps its own.
        let (state, failure) = match outcome {
            ResponseOutcome::Failure(error) => (report.state.clone(), Some(error)),
            ResponseOutcome::Success { state, .. } => (
                state
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| report.state.clone()),
                None,
            ),
            _ => (report.state.clone(), None),
        };
        tracing::info!(
            formation_id = %formation_id,
            state = %state,
            "received formation status report"
        );
        let reported_error = |expected: &str| {
            (state == expected)
                .then(|| NotificationError::client(format!("target reported {expected}")))
        };
        match state.as_str() {
            "READY" | "CREATE_ERROR" if creating => {
                match failure.or_else(|| reported_error("CREATE_ERROR")) {
                    None => self.finish_create(&entry, LifecycleOutcome::Done).await,
                    Some(error) => {
                        self.finish_create(&entry, LifecycleOutcome::Failed(error))
                            .await
                    }
                }
                Ok(Some(entry.snapshot()))
            }
            "READY" | "DELETE_ERROR" if deleting => {
                match failure.or_else(|| reported_error("DELETE_ERROR")) {
                    None => {
                        self.finish_delete(&entry, LifecycleOutcome::Done);
                        Ok(None)
                    }
                    Some(error) => {
                        self.finish_delete(&entry, LifecycleOutcome::Failed(error));
                        Ok(Some(entry.snapshot()))
                    }
                }
            }
            _ => Err(FormationError::Validation(format!(
                "state {state} is not valid for a formation in state {current:?}"
            ))),
        }
    }
}
