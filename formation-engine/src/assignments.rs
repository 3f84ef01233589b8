//! Membership changes and the per-assignment notification drive.
//!
//! Every non-reflexive assignment is converged by notifying its target about its
//! source. One drive holds the assignment's lock from re-reading the row until the
//! outcome is persisted. Fan-out drives run concurrently, bounded per call.

use crate::constraints::{ConstraintType, Decision, JoinPoint, JoinPointDetails};
use crate::context::{NotificationContext, PairContext};
use crate::dispatcher::{NotificationKind, ResponseOutcome, interpret_report, interpret_response};
use crate::engine::EngineInner;
use crate::errors::{FormationError, Result};
use crate::metrics_defs::{CALLBACKS_RECEIVED, NOTIFICATION_FAILURES};
use crate::providers::ParticipantAttributes;
use crate::store::FormationEntry;
use crate::types::{
    AssignmentId, AssignmentState, Formation, FormationAssignment, FormationState,
    NotificationError, Operation, Participant, ParticipantKind,
};
use crate::webhooks::{WebhookMode, default_output_template};
use http::HeaderValue;
use http::header::LOCATION;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Result of driving one assignment.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum DriveOutcome {
    Converged(AssignmentState),
    /// A delete notification succeeded and the row is gone.
    Removed,
    /// An asynchronous notification was acknowledged, the status report is outstanding.
    Pending,
    /// The formation itself is not READY yet.
    Held,
    Failed(NotificationError),
    /// The row no longer exists, or was revived before its delete was persisted.
    Gone,
}

fn operation_for(state: AssignmentState) -> Operation {
    if state.is_unassigning() {
        Operation::Unassign
    } else {
        Operation::Assign
    }
}

/// State an assignment ends up in after a successful response or status report.
pub(crate) fn resolve_state(
    operation: Operation,
    explicit: Option<&str>,
    incomplete: bool,
) -> std::result::Result<AssignmentState, String> {
    let Some(raw) = explicit.filter(|s| !s.is_empty()) else {
        return Ok(match (operation, incomplete) {
            (Operation::Unassign, true) => AssignmentState::Deleting,
            (_, true) => AssignmentState::ConfigPending,
            (_, false) => AssignmentState::Ready,
        });
    };
    let state = AssignmentState::parse(raw).ok_or_else(|| format!("unknown state {raw}"))?;
    let valid = match operation {
        Operation::Unassign => matches!(
            state,
            AssignmentState::Deleting | AssignmentState::Ready | AssignmentState::DeleteError
        ),
        _ => matches!(
            state,
            AssignmentState::Initial
                | AssignmentState::ConfigPending
                | AssignmentState::Ready
                | AssignmentState::CreateError
        ),
    };
    if valid {
        Ok(state)
    } else {
        Err(format!(
            "state {raw} is not valid for an {} notification",
            operation.as_str()
        ))
    }
}

impl EngineInner {
    pub(crate) async fn assign(
        self: &Arc<Self>,
        tenant: &str,
        formation_name: &str,
        object_id: &str,
        kind: ParticipantKind,
    ) -> Result<Formation> {
        let entry = self
            .store
            .find_by_name(tenant, formation_name)
            .ok_or_else(|| FormationError::not_found("formation", formation_name))?;
        let participant = Participant::new(object_id, kind);
        let attributes = self
            .attributes(&participant)
            .await?
            .ok_or_else(|| FormationError::not_found("participant", participant.to_string()))?;

        let formation = entry.snapshot();
        if matches!(
            formation.state,
            FormationState::Deleting | FormationState::DeleteError
        ) {
            return Err(FormationError::Validation(format!(
                "formation {} is being deleted",
                formation.name
            )));
        }
        if let Some(template) = self.template(&formation.template_id) {
            template
                .accepts(kind, attributes.subtype.as_deref())
                .map_err(FormationError::Validation)?;
        }

        let pending = {
            let template_lock = self.store.template_lock(&formation.template_id);
            let _template = template_lock.lock().await;
            let _membership = entry.membership_lock.lock().await;
            let mut details = JoinPointDetails::Membership {
                formation: &formation,
                participant: &attributes,
                operation: Operation::Assign,
            };
            self.enforce_pre(JoinPoint::AssignFormation, &mut details).await?;

            // Rows being deleted are revived only once their delete drive is done.
            let rows = entry.assignment_ids_involving(&participant);
            let _rows = entry.lock_assignments(&rows).await;
            let pending = entry.add_member(&participant, attributes.subtype.clone());
            self.enforce_post(JoinPoint::AssignFormation, &mut details).await;
            pending
        };

        tracing::info!(
            formation_id = %formation.id,
            participant = %participant,
            notifications = pending.len(),
            "assigned participant"
        );
        self.drive_many(&entry, pending).await;
        Ok(entry.snapshot())
    }

    pub(crate) async fn unassign(
        self: &Arc<Self>,
        tenant: &str,
        formation_name: &str,
        object_id: &str,
        kind: ParticipantKind,
    ) -> Result<Formation> {
        let entry = self
            .store
            .find_by_name(tenant, formation_name)
            .ok_or_else(|| FormationError::not_found("formation", formation_name))?;
        let participant = Participant::new(object_id, kind);
        if entry.member(&participant).is_none() {
            return Err(FormationError::not_found("participant", participant.to_string()));
        }
        let attributes = self.attributes_or_bare(&participant).await;
        let formation = entry.snapshot();

        let pending = {
            let _membership = entry.membership_lock.lock().await;
            let mut details = JoinPointDetails::Membership {
                formation: &formation,
                participant: &attributes,
                operation: Operation::Unassign,
            };
            self.enforce_pre(JoinPoint::UnassignFormation, &mut details).await?;

            let rows = entry.assignment_ids_involving(&participant);
            let _rows = entry.lock_assignments(&rows).await;
            let pending = entry
                .begin_member_removal(&participant)
                .unwrap_or_default();
            self.enforce_post(JoinPoint::UnassignFormation, &mut details).await;
            pending
        };

        tracing::info!(
            formation_id = %formation.id,
            participant = %participant,
            notifications = pending.len(),
            "unassigning participant"
        );
        let outcomes = self.drive_many(&entry, pending).await;

        // Rows stay in DELETE_ERROR; a synchronous failure is still reported to the caller.
        if let Some(error) = outcomes.into_iter().find_map(|(_, outcome)| match outcome {
            DriveOutcome::Failed(error) => Some(error),
            _ => None,
        }) {
            return Err(FormationError::NotificationFailed(error));
        }
        Ok(entry.snapshot())
    }

    /// Drives each assignment once. Results are in completion order.
    pub(crate) async fn drive_many(
        self: &Arc<Self>,
        entry: &Arc<FormationEntry>,
        ids: Vec<AssignmentId>,
    ) -> Vec<(AssignmentId, DriveOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.config.notifications.concurrency));
        let mut tasks = JoinSet::new();

        for id in ids {
            // Acquired before spawning so drives start in the given order.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let inner = self.clone();
            let entry = entry.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = inner.drive_assignment(&entry, &id).await;
                (id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => tracing::error!(error = ?e, "Task panicked"),
            }
        }
        outcomes
    }

    async fn drive_assignment(&self, entry: &FormationEntry, id: &str) -> DriveOutcome {
        let lock = entry.assignment_lock(id);
        let _guard = lock.lock().await;

        let Some(assignment) = entry.assignment(id) else {
            return DriveOutcome::Gone;
        };
        if assignment.is_reflexive() || assignment.state == AssignmentState::Ready {
            return DriveOutcome::Converged(AssignmentState::Ready);
        }
        if entry.state() != FormationState::Ready {
            tracing::debug!(assignment_id = %id, "formation not ready, holding notification");
            return DriveOutcome::Held;
        }
        let operation = operation_for(assignment.state);
        let formation = entry.snapshot();

        let (source, target) = match self.pair_attributes(&assignment, operation).await {
            Ok(pair) => pair,
            Err(error) => return self.fail(entry, id, operation, error),
        };

        let mut details = JoinPointDetails::GenerateNotification {
            formation: &formation,
            source: &source,
            target: &target,
            operation,
        };
        match self
            .constraints
            .enforce(
                JoinPoint::GenerateFormationAssignmentNotification,
                ConstraintType::Pre,
                &mut details,
            )
            .await
        {
            Ok(Decision::Skip) => return self.complete_silently(entry, &assignment, operation),
            Ok(Decision::Deny { constraint, reason }) => {
                return self.fail(entry, id, operation, denial(&constraint, &reason));
            }
            Ok(_) => {}
            Err(e) => {
                return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
            }
        }

        let Some(webhook) = self.webhooks.resolve_for_pair(&source, &target) else {
            return self.complete_silently(entry, &assignment, operation);
        };

        let customer = match self.tenants.customer_context(&formation.tenant_id).await {
            Ok(customer) => customer,
            Err(e) => {
                return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
            }
        };
        let parent_runtime = self.parent_runtime(&source, &target).await;
        let reverse = entry.pair(&assignment.target, &assignment.source);

        let mut context = NotificationContext::build(PairContext {
            operation,
            formation: &formation,
            customer: &customer,
            source: &source,
            target: &target,
            parent_runtime: parent_runtime.as_ref(),
            assignment: &assignment,
            reverse_assignment: reverse.as_ref(),
        });

        let pre = {
            let mut details = JoinPointDetails::SendNotification {
                formation: &formation,
                assignment: &assignment,
                target: &target,
                operation,
                context: &mut context,
            };
            self.constraints
                .enforce(
                    JoinPoint::SendNotification,
                    ConstraintType::Pre,
                    &mut details,
                )
                .await
        };
        match pre {
            Ok(Decision::Skip) => return self.complete_silently(entry, &assignment, operation),
            Ok(Decision::Deny { constraint, reason }) => {
                return self.fail(entry, id, operation, denial(&constraint, &reason));
            }
            Ok(_) => {}
            Err(e) => {
                return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
            }
        }

        let mut request = match webhook.render_request(&context.to_value()) {
            Ok(request) => request,
            Err(e) => {
                return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
            }
        };
        if webhook.mode == WebhookMode::AsyncCallback {
            let callback = self.config.assignment_callback_url(&formation.id, id);
            match HeaderValue::from_str(&callback) {
                Ok(value) => {
                    request.headers.insert(LOCATION, value);
                }
                Err(e) => {
                    return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
                }
            }
        }

        let in_flight = if operation == Operation::Unassign {
            AssignmentState::Deleting
        } else {
            AssignmentState::Initial
        };
        entry.update_assignment(id, |row| {
            row.state = in_flight;
            row.error = None;
        });

        let response = match self
            .dispatcher
            .send(&request, NotificationKind::Assignment, webhook.mode)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
            }
        };

        {
            let mut details = JoinPointDetails::SendNotification {
                formation: &formation,
                assignment: &assignment,
                target: &target,
                operation,
                context: &mut context,
            };
            self.enforce_post(JoinPoint::SendNotification, &mut details).await;
        }

        let outcome = match webhook.output_template() {
            Ok(output) => interpret_response(&output, webhook.mode, &response),
            Err(e) => ResponseOutcome::Failure(NotificationError::technical(e.to_string())),
        };
        self.apply_outcome(entry, &formation, &assignment, &target, operation, outcome)
            .await
    }

    async fn pair_attributes(
        &self,
        assignment: &FormationAssignment,
        operation: Operation,
    ) -> std::result::Result<(ParticipantAttributes, ParticipantAttributes), NotificationError> {
        if operation == Operation::Unassign {
            // Participants may already be gone from their registries.
            return Ok((
                self.attributes_or_bare(&assignment.source).await,
                self.attributes_or_bare(&assignment.target).await,
            ));
        }
        let mut pair = Vec::with_capacity(2);
        for participant in [&assignment.source, &assignment.target] {
            match self.attributes(participant).await {
                Ok(Some(attributes)) => pair.push(attributes),
                Ok(None) => {
                    return Err(NotificationError::technical(format!(
                        "participant {participant} not found"
                    )));
                }
                Err(e) => return Err(NotificationError::technical(e.to_string())),
            }
        }
        let target = pair.pop();
        let source = pair.pop();
        match (source, target) {
            (Some(source), Some(target)) => Ok((source, target)),
            _ => Err(NotificationError::technical("participant lookup failed")),
        }
    }

    async fn parent_runtime(
        &self,
        source: &ParticipantAttributes,
        target: &ParticipantAttributes,
    ) -> Option<ParticipantAttributes> {
        let context = [source, target]
            .into_iter()
            .find(|p| p.kind == ParticipantKind::RuntimeContext)?;
        let runtime_id = context.parent_runtime_id.as_ref()?;
        let runtime = Participant::new(runtime_id.clone(), ParticipantKind::Runtime);
        self.attributes(&runtime).await.ok().flatten()
    }

    /// No notification is needed for the pair: an assign converges, an unassign removes the row.
    fn complete_silently(
        &self,
        entry: &FormationEntry,
        assignment: &FormationAssignment,
        operation: Operation,
    ) -> DriveOutcome {
        tracing::debug!(
            assignment_id = %assignment.id,
            operation = operation.as_str(),
            "no notification for assignment"
        );
        if operation == Operation::Unassign {
            return match entry.remove_unassigned(&assignment.id) {
                Some(_) => DriveOutcome::Removed,
                None => DriveOutcome::Gone,
            };
        }
        entry.update_assignment(&assignment.id, |row| {
            row.state = AssignmentState::Ready;
            row.error = None;
        });
        DriveOutcome::Converged(AssignmentState::Ready)
    }

    fn fail(
        &self,
        entry: &FormationEntry,
        id: &str,
        operation: Operation,
        error: NotificationError,
    ) -> DriveOutcome {
        let state = if operation == Operation::Unassign {
            AssignmentState::DeleteError
        } else {
            AssignmentState::CreateError
        };
        entry.update_assignment(id, |row| row.record_error(state, &error));
        shared::counter!(NOTIFICATION_FAILURES, "kind" => NotificationKind::Assignment.as_str())
            .increment(1);
        tracing::warn!(
            formation_id = %entry.id(),
            assignment_id = %id,
            state = state.as_str(),
            error = %error,
            "assignment notification failed"
        );
        DriveOutcome::Failed(error)
    }

    /// Persists the outcome of a response or status report. The caller holds the assignment lock.
    async fn apply_outcome(
        &self,
        entry: &FormationEntry,
        formation: &Formation,
        assignment: &FormationAssignment,
        target: &ParticipantAttributes,
        operation: Operation,
        outcome: ResponseOutcome,
    ) -> DriveOutcome {
        let id = assignment.id.as_str();
        let (config, explicit, location, incomplete) = match outcome {
            ResponseOutcome::Success {
                config,
                state,
                location,
            } => (config, state, location, false),
            ResponseOutcome::Incomplete { config, location } => (config, None, location, true),
            ResponseOutcome::Accepted { location } => {
                if location.is_some() {
                    entry.update_assignment(id, |row| row.location = location);
                }
                tracing::debug!(assignment_id = %id, "notification accepted, awaiting status report");
                return DriveOutcome::Pending;
            }
            ResponseOutcome::Failure(error) => {
                let mut state = assignment.state;
                let mut configuration = None;
                let mut details = JoinPointDetails::StatusReturned {
                    formation,
                    assignment,
                    target,
                    operation,
                    state: &mut state,
                    configuration: &mut configuration,
                    error: Some(&error),
                };
                self.enforce_post(JoinPoint::NotificationStatusReturned, &mut details)
                    .await;
                return self.fail(entry, id, operation, error);
            }
        };

        let mut state = match resolve_state(operation, explicit.as_deref(), incomplete) {
            Ok(state) => state,
            Err(message) => return self.fail(entry, id, operation, NotificationError::technical(message)),
        };
        if state.is_error() {
            let error = NotificationError::client(format!("target reported {}", state.as_str()));
            return self.fail(entry, id, operation, error);
        }

        let mut configuration = config;
        let pre = {
            let mut details = JoinPointDetails::StatusReturned {
                formation,
                assignment,
                target,
                operation,
                state: &mut state,
                configuration: &mut configuration,
                error: None,
            };
            self.constraints
                .enforce(
                    JoinPoint::NotificationStatusReturned,
                    ConstraintType::Pre,
                    &mut details,
                )
                .await
        };
        match pre {
            Ok(Decision::Deny { constraint, reason }) => {
                return self.fail(entry, id, operation, denial(&constraint, &reason));
            }
            Err(e) => {
                return self.fail(entry, id, operation, NotificationError::technical(e.to_string()));
            }
            Ok(_) => {}
        }

        let outcome = if operation == Operation::Unassign && state == AssignmentState::Ready {
            match entry.remove_unassigned(id) {
                Some(_) => DriveOutcome::Removed,
                None => DriveOutcome::Gone,
            }
        } else {
            let stored = configuration.clone();
            entry.update_assignment(id, |row| {
                row.state = state;
                row.error = None;
                if stored.is_some() {
                    row.value = stored.clone();
                    row.configuration = stored;
                }
                if location.is_some() {
                    row.location = location;
                }
            });
            DriveOutcome::Converged(state)
        };

        let post = {
            let mut details = JoinPointDetails::StatusReturned {
                formation,
                assignment,
                target,
                operation,
                state: &mut state,
                configuration: &mut configuration,
                error: None,
            };
            self.enforce_post(JoinPoint::NotificationStatusReturned, &mut details)
                .await
        };
        if post == Decision::Mutated && configuration.is_some() {
            entry.update_assignment(id, |row| {
                row.value = configuration.clone();
                row.configuration = configuration;
            });
        }

        tracing::info!(
            formation_id = %formation.id,
            assignment_id = %id,
            outcome = ?outcome,
            "assignment notification processed"
        );
        outcome
    }

    pub(crate) async fn report_assignment_status(
        &self,
        formation_id: &str,
        assignment_id: &str,
        report: Value,
    ) -> Result<Option<FormationAssignment>> {
        let entry = self
            .store
            .get(formation_id)
            .ok_or_else(|| FormationError::not_found("formation", formation_id))?;
        let lock = entry.assignment_lock(assignment_id);
        let _guard = lock.lock().await;
        let assignment = entry
            .assignment(assignment_id)
            .ok_or_else(|| FormationError::not_found("assignment", assignment_id))?;
        shared::counter!(CALLBACKS_RECEIVED, "kind" => NotificationKind::Assignment.as_str())
            .increment(1);

        let operation = operation_for(assignment.state);
        let source = self.attributes_or_bare(&assignment.source).await;
        let target = self.attributes_or_bare(&assignment.target).await;

        let webhook = self.webhooks.resolve_for_pair(&source, &target);
        let mode = webhook
            .as_ref()
            .map_or(WebhookMode::AsyncCallback, |w| w.mode);
        let output = match &webhook {
            Some(webhook) => webhook.output_template(),
            None => default_output_template(mode),
        }
        .map_err(|e| FormationError::Validation(e.to_string()))?;

        let outcome = interpret_report(&output, mode, &report);
        if let ResponseOutcome::Success { state, .. } = &outcome {
            resolve_state(operation, state.as_deref(), false).map_err(FormationError::Validation)?;
        }

        tracing::info!(
            formation_id = %formation_id,
            assignment_id = %assignment_id,
            operation = operation.as_str(),
            "received assignment status report"
        );
        let formation = entry.snapshot();
        self.apply_outcome(&entry, &formation, &assignment, &target, operation, outcome)
            .await;
        Ok(entry.assignment(assignment_id))
    }
}

fn denial(constraint: &str, reason: &str) -> NotificationError {
    NotificationError::client(format!("denied by constraint {constraint}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_state() {
        assert_eq!(resolve_state(Operation::Assign, None, false), Ok(AssignmentState::Ready));
        assert_eq!(
            resolve_state(Operation::Assign, None, true),
            Ok(AssignmentState::ConfigPending)
        );
        assert_eq!(
            resolve_state(Operation::Assign, Some("CONFIG_PENDING"), false),
            Ok(AssignmentState::ConfigPending)
        );
        assert_eq!(resolve_state(Operation::Unassign, None, false), Ok(AssignmentState::Ready));
        assert_eq!(
            resolve_state(Operation::Unassign, None, true),
            Ok(AssignmentState::Deleting)
        );
        assert!(resolve_state(Operation::Assign, Some("DELETE_ERROR"), false).is_err());
        assert!(resolve_state(Operation::Unassign, Some("CONFIG_PENDING"), false).is_err());
        assert!(resolve_state(Operation::Assign, Some("BOGUS"), false).is_err());
    }
}
