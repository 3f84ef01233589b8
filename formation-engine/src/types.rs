use serde::{Deserialize, Serialize};
use std::fmt;

pub type FormationId = String;
pub type AssignmentId = String;

/// Kinds of objects that can participate in a formation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantKind {
    Application,
    Runtime,
    RuntimeContext,
    Tenant,
}

impl ParticipantKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ParticipantKind::Application => "APPLICATION",
            ParticipantKind::Runtime => "RUNTIME",
            ParticipantKind::RuntimeContext => "RUNTIME_CONTEXT",
            ParticipantKind::Tenant => "TENANT",
        }
    }
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A formation member. Ordered by id first so matrix iteration follows ascending participant id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub kind: ParticipantKind,
}

impl Participant {
    pub fn new(id: impl Into<String>, kind: ParticipantKind) -> Self {
        Participant {
            id: id.into(),
            kind,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// The semantic verb carried into notification templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Assign,
    Unassign,
    CreateFormation,
    DeleteFormation,
}

impl Operation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Assign => "assign",
            Operation::Unassign => "unassign",
            Operation::CreateFormation => "createFormation",
            Operation::DeleteFormation => "deleteFormation",
        }
    }
}

/// Lifecycle of the formation object itself, independent of its members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormationState {
    Initial,
    Ready,
    CreateError,
    Deleting,
    DeleteError,
}

impl FormationState {
    pub fn is_error(&self) -> bool {
        matches!(self, FormationState::CreateError | FormationState::DeleteError)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentState {
    Initial,
    ConfigPending,
    Ready,
    CreateError,
    Deleting,
    DeleteError,
}

impl AssignmentState {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AssignmentState::CreateError | AssignmentState::DeleteError
        )
    }

    /// States that are driven by delete notifications.
    pub fn is_unassigning(&self) -> bool {
        matches!(self, AssignmentState::Deleting | AssignmentState::DeleteError)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INITIAL" => Some(AssignmentState::Initial),
            "CONFIG_PENDING" => Some(AssignmentState::ConfigPending),
            "READY" => Some(AssignmentState::Ready),
            "CREATE_ERROR" => Some(AssignmentState::CreateError),
            "DELETING" => Some(AssignmentState::Deleting),
            "DELETE_ERROR" => Some(AssignmentState::DeleteError),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AssignmentState::Initial => "INITIAL",
            AssignmentState::ConfigPending => "CONFIG_PENDING",
            AssignmentState::Ready => "READY",
            AssignmentState::CreateError => "CREATE_ERROR",
            AssignmentState::Deleting => "DELETING",
            AssignmentState::DeleteError => "DELETE_ERROR",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Transport failures, timeouts, malformed templates.
    TechnicalError,
    /// The receiving side reported an error.
    ClientError,
}

/// Structured error recorded on a formation or assignment after a failed notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationError {
    pub message: String,
    pub error_code: ErrorCode,
}

impl NotificationError {
    pub fn technical(message: impl Into<String>) -> Self {
        NotificationError {
            message: message.into(),
            error_code: ErrorCode::TechnicalError,
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        NotificationError {
            message: message.into(),
            error_code: ErrorCode::ClientError,
        }
    }

    /// JSON payload stored in assignment `value` and `error`.
    pub fn to_payload(&self) -> String {
        serde_json::json!({
            "message": self.message,
            "errorCode": self.error_code,
        })
        .to_string()
    }

    pub fn from_payload(payload: &str) -> Option<Self> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Payload {
            message: String,
            error_code: ErrorCode,
        }
        let parsed: Payload = serde_json::from_str(payload).ok()?;
        Some(NotificationError {
            message: parsed.message,
            error_code: parsed.error_code,
        })
    }
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Formation {
    pub id: FormationId,
    pub name: String,
    pub tenant_id: String,
    pub template_id: String,
    pub template_name: String,
    pub state: FormationState,
    /// Last lifecycle notification error, separate from assignment errors.
    pub error: Option<NotificationError>,
    pub status: FormationStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Ready,
    InProgress,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    /// None for errors of the formation lifecycle notification.
    pub assignment_id: Option<AssignmentId>,
    pub message: String,
    pub error_code: ErrorCode,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormationStatus {
    pub condition: Condition,
    pub errors: Vec<StatusError>,
}

impl FormationStatus {
    /// Reduces the formation's own state and every assignment state into one condition.
    pub fn aggregate(
        state: FormationState,
        error: Option<&NotificationError>,
        assignments: &[FormationAssignment],
    ) -> Self {
        let mut errors = Vec::new();

        if state.is_error() {
            let error = error
                .cloned()
                .unwrap_or_else(|| NotificationError::technical("formation notification failed"));
            errors.push(StatusError {
                assignment_id: None,
                message: error.message,
                error_code: error.error_code,
            });
        }

        for assignment in assignments.iter().filter(|a| a.state.is_error()) {
            let error = assignment
                .error
                .as_deref()
                .and_then(NotificationError::from_payload)
                .unwrap_or_else(|| {
                    NotificationError::technical(
                        assignment.error.clone().unwrap_or_default(),
                    )
                });
            errors.push(StatusError {
                assignment_id: Some(assignment.id.clone()),
                message: error.message,
                error_code: error.error_code,
            });
        }

        let condition = if !errors.is_empty() {
            Condition::Error
        } else if state == FormationState::Ready
            && assignments.iter().all(|a| a.state == AssignmentState::Ready)
        {
            Condition::Ready
        } else {
            Condition::InProgress
        };

        FormationStatus { condition, errors }
    }
}

/// Per ordered pair record tracking notification convergence. The notification for
/// an assignment is sent to the target and describes the source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormationAssignment {
    pub id: AssignmentId,
    pub formation_id: FormationId,
    pub source: Participant,
    pub target: Participant,
    pub state: AssignmentState,
    /// Last successfully applied configuration, opaque JSON text.
    pub configuration: Option<String>,
    /// Raw last response payload, success or error.
    pub value: Option<String>,
    pub error: Option<String>,
    /// Polling location returned by the target, if any.
    pub location: Option<String>,
}

impl FormationAssignment {
    pub fn new(formation_id: &str, source: Participant, target: Participant) -> Self {
        let state = if source == target {
            AssignmentState::Ready
        } else {
            AssignmentState::Initial
        };
        FormationAssignment {
            id: uuid::Uuid::new_v4().to_string(),
            formation_id: formation_id.to_string(),
            source,
            target,
            state,
            configuration: None,
            value: None,
            error: None,
            location: None,
        }
    }

    pub fn is_reflexive(&self) -> bool {
        self.source == self.target
    }

    pub fn involves(&self, participant: &Participant) -> bool {
        &self.source == participant || &self.target == participant
    }

    pub fn record_error(&mut self, state: AssignmentState, error: &NotificationError) {
        let payload = error.to_payload();
        self.state = state;
        self.value = Some(payload.clone());
        self.error = Some(payload);
    }
}

/// Describes which participants a formation built from it accepts. Empty type lists accept any subtype.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormationTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub application_types: Vec<String>,
    #[serde(default)]
    pub runtime_types: Vec<String>,
    #[serde(default)]
    pub supports_tenants: bool,
    #[serde(default)]
    pub labels: std::collections::BTreeMap<String, serde_json::Value>,
}

impl FormationTemplate {
    /// Accepts every participant.
    pub fn permissive(name: &str) -> Self {
        FormationTemplate {
            id: name.to_string(),
            name: name.to_string(),
            application_types: Vec::new(),
            runtime_types: Vec::new(),
            supports_tenants: true,
            labels: Default::default(),
        }
    }

    pub fn accepts(&self, kind: ParticipantKind, subtype: Option<&str>) -> Result<(), String> {
        let allowed = match kind {
            ParticipantKind::Application => &self.application_types,
            ParticipantKind::Runtime | ParticipantKind::RuntimeContext => &self.runtime_types,
            ParticipantKind::Tenant => {
                return if self.supports_tenants {
                    Ok(())
                } else {
                    Err(format!("formation template {} does not support tenants", self.name))
                };
            }
        };
        if allowed.is_empty() || subtype.is_some_and(|s| allowed.iter().any(|a| a == s)) {
            return Ok(());
        }
        Err(format!(
            "{kind} of type {} is not supported by formation template {}",
            subtype.unwrap_or("<none>"),
            self.name
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page_info: PageInfo,
    pub total_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(state: AssignmentState) -> FormationAssignment {
        let mut a = FormationAssignment::new(
            "f1",
            Participant::new("a", ParticipantKind::Application),
            Participant::new("b", ParticipantKind::Application),
        );
        a.state = state;
        a
    }

    #[test]
    fn test_reflexive_assignment_is_ready() {
        let p = Participant::new("a", ParticipantKind::Application);
        let a = FormationAssignment::new("f1", p.clone(), p);
        assert!(a.is_reflexive());
        assert_eq!(a.state, AssignmentState::Ready);
        assert_eq!(a.configuration, None);
    }

    #[test]
    fn test_participant_order_by_id() {
        let mut members = vec![
            Participant::new("b", ParticipantKind::Application),
            Participant::new("a", ParticipantKind::Runtime),
        ];
        members.sort();
        assert_eq!(members[0].id, "a");
    }

    #[test]
    fn test_aggregate_status() {
        let ready = FormationStatus::aggregate(
            FormationState::Ready,
            None,
            &[assignment(AssignmentState::Ready)],
        );
        assert_eq!(ready.condition, Condition::Ready);

        // Formation READY but an assignment still converging.
        let pending = FormationStatus::aggregate(
            FormationState::Ready,
            None,
            &[assignment(AssignmentState::ConfigPending)],
        );
        assert_eq!(pending.condition, Condition::InProgress);

        // Assignments READY but formation lifecycle still pending.
        let initial = FormationStatus::aggregate(
            FormationState::Initial,
            None,
            &[assignment(AssignmentState::Ready)],
        );
        assert_eq!(initial.condition, Condition::InProgress);

        let mut failed = assignment(AssignmentState::Initial);
        failed.record_error(
            AssignmentState::CreateError,
            &NotificationError::client("boom"),
        );
        let error = FormationStatus::aggregate(FormationState::Ready, None, &[failed.clone()]);
        assert_eq!(error.condition, Condition::Error);
        assert_eq!(error.errors.len(), 1);
        assert_eq!(error.errors[0].message, "boom");
        assert_eq!(error.errors[0].assignment_id, Some(failed.id));
        assert_eq!(error.errors[0].error_code, ErrorCode::ClientError);

        let lifecycle = FormationStatus::aggregate(
            FormationState::CreateError,
            Some(&NotificationError::technical("timeout")),
            &[],
        );
        assert_eq!(lifecycle.condition, Condition::Error);
        assert_eq!(lifecycle.errors[0].assignment_id, None);
    }

    #[test]
    fn test_template_accepts() {
        let template = FormationTemplate {
            application_types: vec!["app-type".into()],
            supports_tenants: false,
            ..FormationTemplate::permissive("T")
        };
        assert!(template.accepts(ParticipantKind::Application, Some("app-type")).is_ok());
        assert!(template.accepts(ParticipantKind::Application, Some("other")).is_err());
        assert!(template.accepts(ParticipantKind::Application, None).is_err());
        // No runtime restriction configured.
        assert!(template.accepts(ParticipantKind::Runtime, None).is_ok());
        assert!(template.accepts(ParticipantKind::Tenant, None).is_err());
        assert!(FormationTemplate::permissive("d").accepts(ParticipantKind::Tenant, None).is_ok());
    }

    #[test]
    fn test_error_payload() {
        let mut a = assignment(AssignmentState::Initial);
        let err = NotificationError::client("bad config");
        a.record_error(AssignmentState::CreateError, &err);
        assert_eq!(a.value, a.error);
        let parsed = NotificationError::from_payload(a.error.as_deref().unwrap()).unwrap();
        assert_eq!(parsed, err);
    }
}
