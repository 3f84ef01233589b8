use crate::constraints::ConstraintError;
use crate::providers::ProviderError;
use crate::types::NotificationError;
use crate::webhooks::WebhookError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T, E = FormationError> = std::result::Result<T, E>;

/// Categories callers can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Never retried automatically.
    Validation,
    ConstraintDenied,
    /// Retryable through resynchronization.
    Notification,
    NotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum FormationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("denied by constraint {constraint}: {reason}")]
    ConstraintDenied { constraint: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("notification failed: {0}")]
    NotificationFailed(NotificationError),

    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl FormationError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        FormationError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FormationError::Validation(_) | FormationError::AlreadyExists { .. } => {
                ErrorKind::Validation
            }
            FormationError::ConstraintDenied { .. } => ErrorKind::ConstraintDenied,
            FormationError::NotFound { .. } => ErrorKind::NotFound,
            FormationError::NotificationFailed(_) => ErrorKind::Notification,
            FormationError::Webhook(WebhookError::NotFound(_)) => ErrorKind::NotFound,
            FormationError::Webhook(_) => ErrorKind::Validation,
            FormationError::Constraint(ConstraintError::NotFound(_)) => ErrorKind::NotFound,
            FormationError::Constraint(
                ConstraintError::UnknownOperator(_) | ConstraintError::Duplicate(_),
            ) => ErrorKind::Validation,
            FormationError::Constraint(_) | FormationError::Provider(_) => ErrorKind::Internal,
        }
    }
}
