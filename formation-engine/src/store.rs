//! In-memory formation store.
//!
//! Each formation owns its assignment matrix behind its own lock, so different
//! formations never contend. Writes to a single assignment are serialized by a
//! per-assignment async mutex held for a whole dispatch-and-update cycle. Membership
//! changes take the mutexes of every row they touch before changing states.

use crate::types::{
    AssignmentId, AssignmentState, Formation, FormationAssignment, FormationId, FormationState,
    FormationStatus, NotificationError, Participant, ParticipantKind,
};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub subtype: Option<String>,
    /// Set once the member was unassigned; the member is dropped with its last row.
    pub removing: bool,
}

/// Assignments keyed by (source, target) with an id index.
#[derive(Default, Debug)]
pub struct AssignmentMatrix {
    rows: BTreeMap<(Participant, Participant), FormationAssignment>,
    by_id: HashMap<AssignmentId, (Participant, Participant)>,
}

impl AssignmentMatrix {
    fn insert(&mut self, assignment: FormationAssignment) {
        let key = (assignment.source.clone(), assignment.target.clone());
        self.by_id.insert(assignment.id.clone(), key.clone());
        self.rows.insert(key, assignment);
    }

    fn get(&self, id: &str) -> Option<&FormationAssignment> {
        self.by_id.get(id).and_then(|key| self.rows.get(key))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut FormationAssignment> {
        let key = self.by_id.get(id)?;
        self.rows.get_mut(key)
    }

    fn remove(&mut self, id: &str) -> Option<FormationAssignment> {
        let key = self.by_id.remove(id)?;
        self.rows.remove(&key)
    }

    fn pair(&self, source: &Participant, target: &Participant) -> Option<&FormationAssignment> {
        self.rows.get(&(source.clone(), target.clone()))
    }

    fn pair_mut(
        &mut self,
        source: &Participant,
        target: &Participant,
    ) -> Option<&mut FormationAssignment> {
        self.rows.get_mut(&(source.clone(), target.clone()))
    }

    fn involving<'a>(
        &'a self,
        participant: &'a Participant,
    ) -> impl Iterator<Item = &'a FormationAssignment> + 'a {
        self.rows.values().filter(move |a| a.involves(participant))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug)]
pub struct FormationRecord {
    pub formation: Formation,
    pub members: IndexMap<Participant, Member>,
    pub matrix: AssignmentMatrix,
}

pub struct FormationEntry {
    record: RwLock<FormationRecord>,
    assignment_locks: Mutex<HashMap<AssignmentId, Arc<tokio::sync::Mutex<()>>>>,
    /// Serializes lifecycle notifications of the formation.
    pub lifecycle_lock: tokio::sync::Mutex<()>,
    /// Serializes membership mutations, including their constraint checks.
    pub membership_lock: tokio::sync::Mutex<()>,
}

impl FormationEntry {
    fn new(formation: Formation) -> Self {
        FormationEntry {
            record: RwLock::new(FormationRecord {
                formation,
                members: IndexMap::new(),
                matrix: AssignmentMatrix::default(),
            }),
            assignment_locks: Mutex::new(HashMap::new()),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            membership_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> FormationId {
        self.record.read().formation.id.clone()
    }

    /// The formation with its status aggregated from the current assignment states.
    pub fn snapshot(&self) -> Formation {
        let record = self.record.read();
        let assignments: Vec<_> = record.matrix.rows.values().cloned().collect();
        let mut formation = record.formation.clone();
        formation.status =
            FormationStatus::aggregate(formation.state, formation.error.as_ref(), &assignments);
        formation
    }

    pub fn state(&self) -> FormationState {
        self.record.read().formation.state
    }

    pub fn set_state(&self, state: FormationState, error: Option<NotificationError>) {
        let mut record = self.record.write();
        tracing::debug!(
            formation_id = %record.formation.id,
            from = ?record.formation.state,
            to = ?state,
            "formation state transition"
        );
        record.formation.state = state;
        record.formation.error = error;
    }

    /// All assignments ordered by (source, target).
    pub fn assignments(&self) -> Vec<FormationAssignment> {
        self.record.read().matrix.rows.values().cloned().collect()
    }

    pub fn assignment(&self, id: &str) -> Option<FormationAssignment> {
        self.record.read().matrix.get(id).cloned()
    }

    pub fn pair(&self, source: &Participant, target: &Participant) -> Option<FormationAssignment> {
        self.record.read().matrix.pair(source, target).cloned()
    }

    pub fn members(&self) -> Vec<(Participant, Member)> {
        self.record
            .read()
            .members
            .iter()
            .map(|(p, m)| (p.clone(), m.clone()))
            .collect()
    }

    pub fn member(&self, participant: &Participant) -> Option<Member> {
        self.record.read().members.get(participant).cloned()
    }

    /// Active members of the given kind and subtype.
    pub fn members_of(&self, kind: ParticipantKind, subtype: Option<&str>) -> Vec<Participant> {
        self.record
            .read()
            .members
            .iter()
            .filter(|(p, m)| p.kind == kind && !m.removing && m.subtype.as_deref() == subtype)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Lock guarding dispatch and update of one assignment.
    pub fn assignment_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.assignment_locks
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Ids of every row touching `participant`, the reflexive one included, in id order.
    pub fn assignment_ids_involving(&self, participant: &Participant) -> Vec<AssignmentId> {
        let mut ids: Vec<AssignmentId> = self
            .record
            .read()
            .matrix
            .involving(participant)
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Takes the locks of the given assignments, waiting for in-flight drives on them.
    /// Callers take them in id order and hold at most one such set at a time.
    pub async fn lock_assignments(&self, ids: &[AssignmentId]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.assignment_lock(id).lock_owned().await);
        }
        guards
    }

    /// Adds `participant` to the matrix. Creates the missing rows towards every
    /// member and revives rows still being deleted. Returns the ids of the
    /// non-reflexive rows that need a notification, ordered by (source, target).
    pub fn add_member(&self, participant: &Participant, subtype: Option<String>) -> Vec<AssignmentId> {
        let mut record = self.record.write();
        let formation_id = record.formation.id.clone();

        let previous = record.members.insert(
            participant.clone(),
            Member {
                subtype,
                removing: false,
            },
        );
        if let Some(previous) = &previous
            && !previous.removing
        {
            return Vec::new();
        }

        let others: Vec<Participant> = record
            .members
            .iter()
            .filter(|(p, m)| *p != participant && !m.removing)
            .map(|(p, _)| p.clone())
            .collect();

        if record.matrix.pair(participant, participant).is_none() {
            record.matrix.insert(FormationAssignment::new(
                &formation_id,
                participant.clone(),
                participant.clone(),
            ));
        }

        let mut pending = Vec::new();
        for other in &others {
            for (source, target) in [(participant, other), (other, participant)] {
                match record.matrix.pair_mut(source, target) {
                    Some(existing) => {
                        if existing.state.is_unassigning() {
                            existing.state = AssignmentState::Initial;
                            existing.error = None;
                        }
                        if existing.state != AssignmentState::Ready {
                            pending.push((source.clone(), target.clone(), existing.id.clone()));
                        }
                    }
                    None => {
                        let assignment =
                            FormationAssignment::new(&formation_id, source.clone(), target.clone());
                        pending.push((source.clone(), target.clone(), assignment.id.clone()));
                        record.matrix.insert(assignment);
                    }
                }
            }
        }

        pending.sort();
        tracing::debug!(
            formation_id = %formation_id,
            participant = %participant,
            new_rows = pending.len(),
            "member added"
        );
        pending.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Marks `participant` for removal. Its reflexive row goes immediately, every other
    /// row touching it moves to DELETING. Returns None when it is not a member.
    pub fn begin_member_removal(&self, participant: &Participant) -> Option<Vec<AssignmentId>> {
        let mut record = self.record.write();
        let member = record.members.get_mut(participant)?;
        member.removing = true;

        if let Some(own) = record.matrix.pair(participant, participant).map(|a| a.id.clone()) {
            record.matrix.remove(&own);
        }

        let mut pending: Vec<(Participant, Participant, AssignmentId)> = record
            .matrix
            .involving(participant)
            .map(|a| (a.source.clone(), a.target.clone(), a.id.clone()))
            .collect();
        pending.sort();

        for (_, _, id) in &pending {
            if let Some(row) = record.matrix.get_mut(id)
                && !row.state.is_unassigning()
            {
                row.state = AssignmentState::Deleting;
            }
        }

        if pending.is_empty() {
            record.members.shift_remove(participant);
        }
        Some(pending.into_iter().map(|(_, _, id)| id).collect())
    }

    /// Applies `f` to the stored assignment and returns the updated copy.
    pub fn update_assignment<F>(&self, id: &str, f: F) -> Option<FormationAssignment>
    where
        F: FnOnce(&mut FormationAssignment),
    {
        let mut record = self.record.write();
        let row = record.matrix.get_mut(id)?;
        f(row);
        Some(row.clone())
    }

    /// Deletes a row. Members being removed are dropped together with their last row.
    pub fn remove_assignment(&self, id: &str) -> Option<FormationAssignment> {
        let mut record = self.record.write();
        let removed = record.matrix.remove(id)?;

        for participant in [&removed.source, &removed.target] {
            let removing = record
                .members
                .get(participant)
                .is_some_and(|m| m.removing);
            if removing && record.matrix.involving(participant).next().is_none() {
                record.members.shift_remove(participant);
            }
        }
        self.assignment_locks.lock().remove(id);
        Some(removed)
    }

    /// Deletes a row after a successful delete notification, unless it was revived meanwhile.
    pub fn remove_unassigned(&self, id: &str) -> Option<FormationAssignment> {
        let unassigning = self
            .record
            .read()
            .matrix
            .get(id)
            .is_some_and(|row| row.state.is_unassigning());
        if !unassigning {
            return None;
        }
        self.remove_assignment(id)
    }
}

#[derive(Default)]
pub struct Store {
    formations: RwLock<HashMap<FormationId, Arc<FormationEntry>>>,
    template_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a formation unless its tenant already has one with the same name.
    pub fn insert(&self, formation: Formation) -> Result<Arc<FormationEntry>, Formation> {
        let mut formations = self.formations.write();
        let taken = formations.values().any(|entry| {
            let record = entry.record.read();
            record.formation.tenant_id == formation.tenant_id && record.formation.name == formation.name
        });
        if taken {
            return Err(formation);
        }
        let entry = Arc::new(FormationEntry::new(formation));
        formations.insert(entry.id(), entry.clone());
        Ok(entry)
    }

    /// Serializes assignments into the formations built from one template, so checks
    /// spanning those formations see each other's members.
    pub fn template_lock(&self, template_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.template_locks
            .lock()
            .entry(template_id.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<FormationEntry>> {
        self.formations.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<FormationEntry>> {
        self.formations.write().remove(id)
    }

    /// Formation of `tenant` with the given id or, failing that, name.
    pub fn find(&self, tenant: &str, id_or_name: &str) -> Option<Arc<FormationEntry>> {
        let formations = self.formations.read();
        if let Some(entry) = formations.get(id_or_name)
            && entry.record.read().formation.tenant_id == tenant
        {
            return Some(entry.clone());
        }
        formations
            .values()
            .find(|entry| {
                let record = entry.record.read();
                record.formation.tenant_id == tenant && record.formation.name == id_or_name
            })
            .cloned()
    }

    pub fn find_by_name(&self, tenant: &str, name: &str) -> Option<Arc<FormationEntry>> {
        self.formations
            .read()
            .values()
            .find(|entry| {
                let record = entry.record.read();
                record.formation.tenant_id == tenant && record.formation.name == name
            })
            .cloned()
    }

    /// Formations of `tenant`, ordered by name.
    pub fn list(&self, tenant: &str) -> Vec<Arc<FormationEntry>> {
        let mut entries: Vec<(String, Arc<FormationEntry>)> = self
            .formations
            .read()
            .values()
            .filter_map(|entry| {
                let record = entry.record.read();
                (record.formation.tenant_id == tenant)
                    .then(|| (record.formation.name.clone(), entry.clone()))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Ids of the formations of `tenant` built from `template_id` in which `participant`
    /// is an active member.
    pub fn formations_containing(
        &self,
        tenant: &str,
        template_id: &str,
        participant: &Participant,
    ) -> Vec<FormationId> {
        let mut ids: Vec<FormationId> = self
            .formations
            .read()
            .values()
            .filter_map(|entry| {
                let record = entry.record.read();
                let member = record.members.get(participant)?;
                (record.formation.tenant_id == tenant
                    && record.formation.template_id == template_id
                    && !member.removing)
                    .then(|| record.formation.id.clone())
            })
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::formation;

    fn app(id: &str) -> Participant {
        Participant::new(id, ParticipantKind::Application)
    }

    #[test]
    fn test_matrix_grows_quadratically() {
        let store = Store::new();
        let entry = store.insert(formation("t1", "F")).unwrap();

        assert!(entry.add_member(&app("a"), None).is_empty());
        assert_eq!(entry.assignments().len(), 1);
        assert_eq!(entry.assignments()[0].state, AssignmentState::Ready);

        let pending = entry.add_member(&app("b"), None);
        assert_eq!(pending.len(), 2);
        assert_eq!(entry.assignments().len(), 4);

        let pending = entry.add_member(&app("c"), None);
        assert_eq!(pending.len(), 4);
        assert_eq!(entry.assignments().len(), 9);

        // Ordered by (source, target).
        let first = entry.assignment(&pending[0]).unwrap();
        assert_eq!((first.source.id.as_str(), first.target.id.as_str()), ("a", "c"));

        // Adding an active member again is a no-op.
        assert!(entry.add_member(&app("c"), None).is_empty());
        assert_eq!(entry.assignments().len(), 9);
    }

    #[test]
    fn test_member_removal() {
        let store = Store::new();
        let entry = store.insert(formation("t1", "F")).unwrap();
        for id in ["a", "b", "c"] {
            entry.add_member(&app(id), None);
        }

        let deleting = entry.begin_member_removal(&app("c")).unwrap();
        // 2n - 1 rows for n = 3, minus the reflexive one removed up front.
        assert_eq!(deleting.len(), 4);
        assert_eq!(entry.assignments().len(), 8);
        for id in &deleting {
            assert_eq!(entry.assignment(id).unwrap().state, AssignmentState::Deleting);
        }
        assert!(entry.member(&app("c")).unwrap().removing);

        for id in &deleting {
            entry.remove_assignment(id);
        }
        assert_eq!(entry.assignments().len(), 4);
        assert!(entry.member(&app("c")).is_none());

        assert!(entry.begin_member_removal(&app("zzz")).is_none());
    }

    #[test]
    fn test_reassign_revives_deleting_rows() {
        let store = Store::new();
        let entry = store.insert(formation("t1", "F")).unwrap();
        entry.add_member(&app("a"), None);
        entry.add_member(&app("b"), None);
        let deleting = entry.begin_member_removal(&app("b")).unwrap();
        entry.update_assignment(&deleting[0], |a| a.state = AssignmentState::DeleteError);

        let pending = entry.add_member(&app("b"), None);
        assert_eq!(pending.len(), 2);
        assert_eq!(entry.assignments().len(), 4);
        // A late delete result must not drop a revived row.
        assert!(entry.remove_unassigned(&pending[0]).is_none());
        assert_eq!(entry.assignments().len(), 4);
        for id in pending {
            assert_eq!(entry.assignment(&id).unwrap().state, AssignmentState::Initial);
        }
        assert!(!entry.member(&app("b")).unwrap().removing);
    }

    #[test]
    fn test_find_and_list() {
        let store = Store::new();
        let f2 = store.insert(formation("t1", "beta")).unwrap();
        store.insert(formation("t1", "alpha")).unwrap();
        store.insert(formation("t2", "gamma")).unwrap();
        assert!(store.insert(formation("t1", "alpha")).is_err());

        let names: Vec<String> = store.list("t1").iter().map(|e| e.snapshot().name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert!(store.find("t1", &f2.id()).is_some());
        assert!(store.find("t1", "beta").is_some());
        assert!(store.find("t2", "beta").is_none());
        assert!(store.find("t2", &f2.id()).is_none());
    }

    #[test]
    fn test_formations_containing() {
        let store = Store::new();
        let f1 = store.insert(formation("t1", "F1")).unwrap();
        let f2 = store.insert(formation("t1", "F2")).unwrap();
        f1.add_member(&app("a"), None);
        f2.add_member(&app("a"), None);
        f2.begin_member_removal(&app("a"));

        let ids = store.formations_containing("t1", "tpl", &app("a"));
        assert_eq!(ids, vec![f1.id()]);
    }
}
