//! Re-drives notifications that have not converged.

use crate::engine::EngineInner;
use crate::errors::{FormationError, Result};
use crate::lifecycle::LifecycleOutcome;
use crate::metrics_defs::RESYNCHRONIZATIONS;
use crate::types::{AssignmentState, Formation, FormationState, Operation};
use std::sync::Arc;

impl EngineInner {
    /// Re-sends the lifecycle notification if it has not succeeded, then every assignment
    /// notification that has not converged. With `reset`, READY assignments whose webhook
    /// supports it are sent again too. Failures are recorded on the assignments only.
    pub(crate) async fn resynchronize(
        self: &Arc<Self>,
        tenant: &str,
        formation_id: &str,
        reset: bool,
    ) -> Result<Formation> {
        let entry = self
            .store
            .get(formation_id)
            .filter(|entry| entry.snapshot().tenant_id == tenant)
            .ok_or_else(|| FormationError::not_found("formation", formation_id))?;
        shared::counter!(RESYNCHRONIZATIONS, "reset" => if reset { "true" } else { "false" })
            .increment(1);
        tracing::info!(formation_id = %formation_id, reset, "resynchronizing formation");

        match entry.state() {
            FormationState::Ready => {}
            FormationState::Initial | FormationState::CreateError => {
                entry.set_state(FormationState::Initial, None);
                let outcome = self.drive_lifecycle(&entry, Operation::CreateFormation).await;
                // Held assignments are driven once the formation becomes READY.
                self.finish_create(&entry, outcome).await;
                return Ok(entry.snapshot());
            }
            FormationState::Deleting | FormationState::DeleteError => {
                let last = entry.snapshot();
                entry.set_state(FormationState::Deleting, None);
                let outcome = self.drive_lifecycle(&entry, Operation::DeleteFormation).await;
                if self.finish_delete(&entry, outcome) == LifecycleOutcome::Done {
                    return Ok(last);
                }
                return Ok(entry.snapshot());
            }
        }
        if reset {
            for assignment in entry.assignments() {
                if assignment.is_reflexive() || assignment.state != AssignmentState::Ready {
                    continue;
                }
                let source = self.attributes_or_bare(&assignment.source).await;
                let target = self.attributes_or_bare(&assignment.target).await;
                let resettable = self
                    .webhooks
                    .resolve_for_pair(&source, &target)
                    .is_some_and(|webhook| webhook.supports_reset);
                if !resettable {
                    continue;
                }
                let lock = entry.assignment_lock(&assignment.id);
                let _guard = lock.lock().await;
                entry.update_assignment(&assignment.id, |row| {
                    if row.state == AssignmentState::Ready {
                        row.state = AssignmentState::Initial;
                    }
                });
                tracing::debug!(assignment_id = %assignment.id, "reset assignment");
            }
        }

        let pending: Vec<_> = entry
            .assignments()
            .into_iter()
            .filter(|a| !a.is_reflexive() && a.state != AssignmentState::Ready)
            .map(|a| a.id)
            .collect();
        self.drive_many(&entry, pending).await;
        Ok(entry.snapshot())
    }
}
