//! Typed rendering contexts for webhook templates.
//!
//! Every context serializes into the field layout templates address, e.g.
//! `{{ .SourceApplication.Labels.region }}` or `{{ .CustomerTenantContext.CustomerID }}`.
//! Bags that do not apply to a participant pair are left out entirely so that a
//! reference to them renders empty.

use crate::providers::{CustomerTenantContext, ParticipantAttributes, TemplateAttributes};
use crate::types::{Formation, FormationAssignment, Operation, ParticipantKind};
use crate::webhooks::WebhookType;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParticipantBag {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub labels: BTreeMap<String, Value>,
    #[serde(rename = "BaseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "LocalTenantID", skip_serializing_if = "Option::is_none")]
    pub local_tenant_id: Option<String>,
    #[serde(rename = "TenantID", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

impl From<&ParticipantAttributes> for ParticipantBag {
    fn from(attrs: &ParticipantAttributes) -> Self {
        ParticipantBag {
            id: attrs.id.clone(),
            name: attrs.name.clone(),
            r#type: attrs.subtype.clone(),
            labels: attrs.labels.clone(),
            base_url: attrs.base_url.clone(),
            namespace: attrs.namespace.clone(),
            local_tenant_id: attrs.local_tenant_id.clone(),
            tenant_id: attrs.tenant_id.clone(),
            region: attrs.region.clone(),
            subdomain: attrs.subdomain.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateBag {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, Value>,
}

impl From<&TemplateAttributes> for TemplateBag {
    fn from(attrs: &TemplateAttributes) -> Self {
        TemplateBag {
            id: attrs.id.clone(),
            name: attrs.name.clone(),
            labels: attrs.labels.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssignmentBag {
    #[serde(rename = "ID")]
    pub id: String,
    pub source: String,
    pub source_type: ParticipantKind,
    pub target: String,
    pub target_type: ParticipantKind,
    pub state: String,
    /// Parsed configuration when it holds JSON, so templates can address into it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&FormationAssignment> for AssignmentBag {
    fn from(assignment: &FormationAssignment) -> Self {
        let configuration = assignment.configuration.as_deref().map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        });
        AssignmentBag {
            id: assignment.id.clone(),
            source: assignment.source.id.clone(),
            source_type: assignment.source.kind,
            target: assignment.target.id.clone(),
            target_type: assignment.target.kind,
            state: assignment.state.as_str().to_string(),
            configuration,
            value: assignment.value.clone(),
            error: assignment.error.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FormationBag {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "TemplateID")]
    pub template_id: String,
    pub template_name: String,
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    pub state: crate::types::FormationState,
}

impl From<&Formation> for FormationBag {
    fn from(formation: &Formation) -> Self {
        FormationBag {
            id: formation.id.clone(),
            name: formation.name.clone(),
            template_id: formation.template_id.clone(),
            template_name: formation.template_name.clone(),
            tenant_id: formation.tenant_id.clone(),
            state: formation.state,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CustomerTenantBag {
    #[serde(rename = "AccountID")]
    pub account_id: String,
    #[serde(rename = "CustomerID")]
    pub customer_id: String,
}

impl From<&CustomerTenantContext> for CustomerTenantBag {
    fn from(ctx: &CustomerTenantContext) -> Self {
        CustomerTenantBag {
            account_id: ctx.account_id.clone(),
            customer_id: ctx.customer_id.clone(),
        }
    }
}

/// Context for assignment notifications, sent to the target and describing the source.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationContext {
    pub operation: Operation,
    #[serde(rename = "FormationID")]
    pub formation_id: String,
    pub formation: FormationBag,
    pub customer_tenant_context: CustomerTenantBag,
    pub source: ParticipantBag,
    pub target: ParticipantBag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_application: Option<ParticipantBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_application_template: Option<TemplateBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_application: Option<ParticipantBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_application_template: Option<TemplateBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ParticipantBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_template: Option<TemplateBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ParticipantBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_context: Option<ParticipantBag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<ParticipantBag>,
    pub assignment: AssignmentBag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_assignment: Option<AssignmentBag>,
}

/// Inputs for [`NotificationContext::build`].
pub struct PairContext<'a> {
    pub operation: Operation,
    pub formation: &'a Formation,
    pub customer: &'a CustomerTenantContext,
    pub source: &'a ParticipantAttributes,
    pub target: &'a ParticipantAttributes,
    /// Parent runtime of whichever side is a runtime context.
    pub parent_runtime: Option<&'a ParticipantAttributes>,
    pub assignment: &'a FormationAssignment,
    pub reverse_assignment: Option<&'a FormationAssignment>,
}

impl NotificationContext {
    pub fn build(pair: PairContext<'_>) -> Self {
        let mut ctx = NotificationContext {
            operation: pair.operation,
            formation_id: pair.formation.id.clone(),
            formation: pair.formation.into(),
            customer_tenant_context: pair.customer.into(),
            source: pair.source.into(),
            target: pair.target.into(),
            source_application: None,
            source_application_template: None,
            target_application: None,
            target_application_template: None,
            application: None,
            application_template: None,
            runtime: None,
            runtime_context: None,
            tenant: None,
            assignment: pair.assignment.into(),
            reverse_assignment: pair.reverse_assignment.map(AssignmentBag::from),
        };

        let app_to_app = pair.source.kind == ParticipantKind::Application
            && pair.target.kind == ParticipantKind::Application;
        if app_to_app {
            ctx.source_application = Some(pair.source.into());
            ctx.source_application_template =
                pair.source.application_template.as_ref().map(TemplateBag::from);
            ctx.target_application = Some(pair.target.into());
            ctx.target_application_template =
                pair.target.application_template.as_ref().map(TemplateBag::from);
            return ctx;
        }

        // The described side fills its slot first.
        for attrs in [pair.source, pair.target] {
            match attrs.kind {
                ParticipantKind::Application if ctx.application.is_none() => {
                    ctx.application = Some(attrs.into());
                    ctx.application_template =
                        attrs.application_template.as_ref().map(TemplateBag::from);
                }
                ParticipantKind::Runtime if ctx.runtime.is_none() => {
                    ctx.runtime = Some(attrs.into());
                }
                ParticipantKind::RuntimeContext if ctx.runtime_context.is_none() => {
                    ctx.runtime_context = Some(attrs.into());
                }
                ParticipantKind::Tenant if ctx.tenant.is_none() => {
                    ctx.tenant = Some(attrs.into());
                }
                _ => {}
            }
        }
        if ctx.runtime.is_none() {
            ctx.runtime = pair.parent_runtime.map(ParticipantBag::from);
        }
        ctx
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn reverse_configuration_mut(&mut self) -> Option<&mut Value> {
        self.reverse_assignment.as_mut()?.configuration.as_mut()
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FormationLifecycleContext {
    pub operation: Operation,
    #[serde(rename = "FormationID")]
    pub formation_id: String,
    pub formation: FormationBag,
    pub formation_template: TemplateBag,
    pub customer_tenant_context: CustomerTenantBag,
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
}

impl FormationLifecycleContext {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Response fields available to output templates.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseContext {
    pub body: Value,
    /// Canonical header names, e.g. `Location`.
    pub headers: BTreeMap<String, String>,
    pub status_code: u16,
}

impl ResponseContext {
    pub fn new(status_code: u16, headers: &http::HeaderMap, body: &[u8]) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((canonical_header_name(name.as_str()), value.to_string()))
            })
            .collect();
        ResponseContext {
            body: parse_body(body),
            headers,
            status_code,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// JSON bodies are exposed structurally, anything else as a string.
pub fn parse_body(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// `content-type` -> `Content-Type`
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Root fields a template of the given webhook type may reference: (always present, present only for some pairs).
pub fn known_roots(webhook_type: WebhookType) -> (&'static [&'static str], &'static [&'static str]) {
    match webhook_type {
        WebhookType::ApplicationTenantMapping => (
            &[
                "Operation",
                "FormationID",
                "Formation",
                "CustomerTenantContext",
                "Source",
                "Target",
                "SourceApplication",
                "TargetApplication",
                "Assignment",
            ],
            &[
                "SourceApplicationTemplate",
                "TargetApplicationTemplate",
                "ReverseAssignment",
            ],
        ),
        WebhookType::ConfigurationChanged => (
            &[
                "Operation",
                "FormationID",
                "Formation",
                "CustomerTenantContext",
                "Source",
                "Target",
                "Assignment",
            ],
            &[
                "Application",
                "ApplicationTemplate",
                "Runtime",
                "RuntimeContext",
                "Tenant",
                "ReverseAssignment",
            ],
        ),
        WebhookType::FormationLifecycle => (
            &[
                "Operation",
                "FormationID",
                "Formation",
                "FormationTemplate",
                "CustomerTenantContext",
                "TenantID",
            ],
            &[],
        ),
    }
}

pub const RESPONSE_ROOTS: &[&str] = &["Body", "Headers", "StatusCode"];
