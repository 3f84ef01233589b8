//! Sends rendered notifications and classifies what comes back.
//!
//! Responses are interpreted through the webhook's output template, which maps the
//! response (`.Body`, `.Headers`, `.StatusCode`) to a JSON document of the form
//! `{"config", "state", "location", "error", "success_status_code", "incomplete_status_code"}`.
//! Asynchronous status reports go through the same template with the report as `.Body`.

use crate::context::ResponseContext;
use crate::metrics_defs::{NOTIFICATION_DURATION, NOTIFICATIONS_SENT};
use crate::template::Template;
use crate::transport::{NotificationTransport, TransportError, TransportResponse};
use crate::types::NotificationError;
use crate::webhooks::{RenderedRequest, WebhookMode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Metric tag distinguishing assignment notifications from formation lifecycle ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Assignment,
    Lifecycle,
}

impl NotificationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Assignment => "assignment",
            NotificationKind::Lifecycle => "lifecycle",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseOutcome {
    /// The target applied the notification. `state` is an explicit override.
    Success {
        config: Option<String>,
        state: Option<String>,
        location: Option<String>,
    },
    /// The target answered with the incomplete status code.
    Incomplete {
        config: Option<String>,
        location: Option<String>,
    },
    /// An asynchronous notification was acknowledged; the outcome arrives as a status report.
    Accepted { location: Option<String> },
    Failure(NotificationError),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ParsedOutput {
    config: Value,
    state: Option<String>,
    location: Option<String>,
    error: Value,
    success_status_code: Option<u16>,
    incomplete_status_code: Option<u16>,
}

fn default_success_code(mode: WebhookMode) -> u16 {
    match mode {
        WebhookMode::Sync => 200,
        WebhookMode::AsyncCallback => 202,
    }
}

fn parse_output(rendered: &str) -> Result<ParsedOutput, NotificationError> {
    serde_json::from_str(rendered).map_err(|e| {
        NotificationError::technical(format!("output template rendered invalid JSON: {e}"))
    })
}

/// Configuration is stored as text: strings verbatim, anything else as JSON.
fn config_text(config: Value) -> Option<String> {
    match config {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn error_message(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) if map.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Classifies the response to a notification.
pub fn interpret_response(
    output: &Template,
    mode: WebhookMode,
    response: &TransportResponse,
) -> ResponseOutcome {
    let ctx = ResponseContext::new(response.status, &response.headers, &response.body);
    let parsed = match parse_output(&output.render(&ctx.to_value())) {
        Ok(parsed) => parsed,
        Err(e) => return ResponseOutcome::Failure(e),
    };

    let success = parsed
        .success_status_code
        .unwrap_or_else(|| default_success_code(mode));
    let error = error_message(&parsed.error);
    let status = response.status;

    if status != success && Some(status) != parsed.incomplete_status_code {
        let message = error.unwrap_or_else(|| format!("unexpected status code {status}"));
        return ResponseOutcome::Failure(NotificationError::client(message));
    }
    if let Some(message) = error {
        return ResponseOutcome::Failure(NotificationError::client(message));
    }

    match mode {
        WebhookMode::AsyncCallback => ResponseOutcome::Accepted {
            location: parsed.location,
        },
        WebhookMode::Sync if status == success => ResponseOutcome::Success {
            config: config_text(parsed.config),
            state: parsed.state,
            location: parsed.location,
        },
        WebhookMode::Sync => ResponseOutcome::Incomplete {
            config: config_text(parsed.config),
            location: parsed.location,
        },
    }
}

/// Classifies an asynchronous status report. Reports follow the success path of
/// [`interpret_response`]; a non-empty error marks a failure.
pub fn interpret_report(output: &Template, mode: WebhookMode, body: &Value) -> ResponseOutcome {
    let mut ctx = ResponseContext {
        body: body.clone(),
        headers: BTreeMap::new(),
        status_code: default_success_code(mode),
    };
    // Templates may declare their own success code and compare against it.
    if let Ok(first) = parse_output(&output.render(&ctx.to_value()))
        && let Some(code) = first.success_status_code
    {
        ctx.status_code = code;
    }

    let parsed = match parse_output(&output.render(&ctx.to_value())) {
        Ok(parsed) => parsed,
        Err(e) => return ResponseOutcome::Failure(e),
    };
    if let Some(message) = error_message(&parsed.error) {
        return ResponseOutcome::Failure(NotificationError::client(message));
    }
    ResponseOutcome::Success {
        config: config_text(parsed.config),
        state: parsed.state,
        location: parsed.location,
    }
}

pub struct Dispatcher {
    transport: Arc<dyn NotificationTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Dispatcher { transport }
    }

    pub async fn send(
        &self,
        request: &RenderedRequest,
        kind: NotificationKind,
        mode: WebhookMode,
    ) -> Result<TransportResponse, TransportError> {
        shared::counter!(NOTIFICATIONS_SENT, "kind" => kind.as_str(), "mode" => mode.as_str())
            .increment(1);
        tracing::debug!(
            kind = kind.as_str(),
            mode = mode.as_str(),
            method = %request.method,
            url = %request.url,
            "sending notification"
        );

        let started = Instant::now();
        let result = self.transport.send(request).await;
        shared::histogram!(NOTIFICATION_DURATION, "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(response) => tracing::debug!(
                url = %request.url,
                status = response.status,
                "notification answered"
            ),
            Err(e) => tracing::warn!(url = %request.url, error = %e, "notification failed"),
        }
        result
    }
}
