use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Default formation template name cannot be empty")]
    EmptyDefaultTemplate,

    #[error("Notification timeout cannot be 0")]
    InvalidTimeout,

    #[error("Notification concurrency cannot be 0")]
    InvalidConcurrency,

    #[error("Callback base URL must be http or https: {0}")]
    InvalidCallbackUrl(String),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Bound on every outbound notification, response body included.
    pub timeout_secs: u64,
    /// Sends in flight at once within one fan-out.
    pub concurrency: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            timeout_secs: 10,
            concurrency: 8,
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_template_name() -> String {
    "default".to_string()
}

/// Engine configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for the formation API and status callbacks
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Base of the callback URLs handed to asynchronous webhooks in the `Location` header.
    pub callback_base_url: Url,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Template used by formations created without one. Registered on startup, accepting
    /// every participant type.
    #[serde(default = "default_template_name")]
    pub default_formation_template: String,
    /// Reject webhook templates that use optional context fields outside of a guard.
    #[serde(default)]
    pub strict_templates: bool,
    /// YAML file seeding participants, tenants and registrations.
    #[serde(default)]
    pub fixtures: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.default_formation_template.is_empty() {
            return Err(ValidationError::EmptyDefaultTemplate);
        }
        if self.notifications.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        if self.notifications.concurrency == 0 {
            return Err(ValidationError::InvalidConcurrency);
        }
        if !matches!(self.callback_base_url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidCallbackUrl(
                self.callback_base_url.to_string(),
            ));
        }
        Ok(())
    }

    /// Where the target reports the outcome of an asynchronous assignment notification.
    pub fn assignment_callback_url(&self, formation_id: &str, assignment_id: &str) -> String {
        format!(
            "{}/v1/businessIntegrations/{formation_id}/assignments/{assignment_id}/status",
            self.callback_base_url.as_str().trim_end_matches('/')
        )
    }

    /// Where the target reports the outcome of an asynchronous lifecycle notification.
    pub fn formation_callback_url(&self, formation_id: &str) -> String {
        format!(
            "{}/v1/businessIntegrations/{formation_id}/status",
            self.callback_base_url.as_str().trim_end_matches('/')
        )
    }
}
