use crate::context::{RESPONSE_ROOTS, known_roots};
use crate::providers::ParticipantAttributes;
use crate::template::{Template, TemplateError};
use crate::types::ParticipantKind;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Output template used when a synchronous webhook does not define one.
pub const DEFAULT_SYNC_OUTPUT_TEMPLATE: &str = r#"{"config":{{ json .Body.config }},"state":{{ json .Body.state }},"location":{{ json .Headers.Location }},"error":{{ json .Body.error }},"success_status_code":200,"incomplete_status_code":204}"#;

/// Output template used when an asynchronous webhook does not define one.
pub const DEFAULT_ASYNC_OUTPUT_TEMPLATE: &str = r#"{"config":{{ json .Body.config }},"state":{{ json .Body.state }},"location":{{ json .Headers.Location }},"error":{{ json .Body.error }},"success_status_code":202}"#;

#[derive(thiserror::Error, Debug)]
pub enum WebhookError {
    #[error("invalid {field} template: {source}")]
    Template {
        field: &'static str,
        source: TemplateError,
    },
    #[error("{field} template references unknown field .{root}")]
    UnknownField { field: &'static str, root: String },
    #[error("{field} template references optional field .{root} outside of a guard")]
    UnguardedOptional { field: &'static str, root: String },
    #[error("webhook {0} already exists")]
    Duplicate(String),
    #[error("{owner} already has a {webhook_type} webhook")]
    DuplicateOwner {
        owner: WebhookOwner,
        webhook_type: WebhookType,
    },
    #[error("webhook not found: {0}")]
    NotFound(String),
    #[error("rendered url is invalid: {0}")]
    InvalidUrl(String),
    #[error("unsupported http method: {0}")]
    InvalidMethod(String),
    #[error("rendered headers are invalid: {0}")]
    InvalidHeaders(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookType {
    /// Application to application notifications.
    ApplicationTenantMapping,
    /// Notifications involving runtimes, runtime contexts or tenants.
    ConfigurationChanged,
    FormationLifecycle,
}

impl WebhookType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WebhookType::ApplicationTenantMapping => "APPLICATION_TENANT_MAPPING",
            WebhookType::ConfigurationChanged => "CONFIGURATION_CHANGED",
            WebhookType::FormationLifecycle => "FORMATION_LIFECYCLE",
        }
    }
}

impl fmt::Display for WebhookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookMode {
    #[default]
    Sync,
    AsyncCallback,
}

impl WebhookMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WebhookMode::Sync => "sync",
            WebhookMode::AsyncCallback => "async_callback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookOwner {
    Application(String),
    ApplicationTemplate(String),
    Runtime(String),
    FormationTemplate(String),
}

impl fmt::Display for WebhookOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookOwner::Application(id) => write!(f, "application {id}"),
            WebhookOwner::ApplicationTemplate(id) => write!(f, "application template {id}"),
            WebhookOwner::Runtime(id) => write!(f, "runtime {id}"),
            WebhookOwner::FormationTemplate(id) => write!(f, "formation template {id}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub owner: WebhookOwner,
    #[serde(rename = "type")]
    pub webhook_type: WebhookType,
    #[serde(default)]
    pub mode: WebhookMode,
    /// Renders `{"method": .., "path": ..}`.
    pub url_template: Template,
    #[serde(default)]
    pub input_template: Option<Template>,
    #[serde(default)]
    pub output_template: Option<Template>,
    /// Renders a JSON object of header names to a value or a list of values.
    #[serde(default)]
    pub header_template: Option<Template>,
    /// Ready assignments notified through this webhook are resent on a resynchronization with reset.
    #[serde(default)]
    pub supports_reset: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

#[derive(Deserialize)]
struct UrlSpec {
    method: String,
    path: String,
}

impl Webhook {
    pub fn render_request(&self, context: &Value) -> Result<RenderedRequest, WebhookError> {
        let spec: UrlSpec = serde_json::from_str(&self.url_template.render(context))
            .map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;
        let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| WebhookError::InvalidMethod(spec.method.clone()))?;
        let url =
            Url::parse(&spec.path).map_err(|e| WebhookError::InvalidUrl(format!("{}: {e}", spec.path)))?;

        let mut headers = HeaderMap::new();
        if let Some(template) = &self.header_template {
            let rendered: IndexMap<String, Value> = serde_json::from_str(&template.render(context))
                .map_err(|e| WebhookError::InvalidHeaders(e.to_string()))?;
            for (name, value) in rendered {
                let values = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| WebhookError::InvalidHeaders(e.to_string()))?;
                for value in values {
                    let text = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let value = HeaderValue::from_str(&text)
                        .map_err(|e| WebhookError::InvalidHeaders(e.to_string()))?;
                    headers.append(name.clone(), value);
                }
            }
        }

        let body = self.input_template.as_ref().map(|t| t.render(context));

        Ok(RenderedRequest {
            method,
            url,
            headers,
            body,
        })
    }

    pub fn output_template(&self) -> Result<Template, TemplateError> {
        match &self.output_template {
            Some(template) => Ok(template.clone()),
            None => default_output_template(self.mode),
        }
    }

    fn validate(&self, strict: bool) -> Result<(), WebhookError> {
        let (required, optional) = known_roots(self.webhook_type);
        let request_templates = [
            ("url", Some(&self.url_template)),
            ("input", self.input_template.as_ref()),
            ("header", self.header_template.as_ref()),
        ];

        for (field, template) in request_templates {
            let Some(template) = template else { continue };
            for reference in template.references() {
                if required.contains(&reference.root.as_str()) {
                    continue;
                }
                if !optional.contains(&reference.root.as_str()) {
                    return Err(WebhookError::UnknownField {
                        field,
                        root: reference.root,
                    });
                }
                if !reference.guarded {
                    if strict {
                        return Err(WebhookError::UnguardedOptional {
                            field,
                            root: reference.root,
                        });
                    }
                    tracing::warn!(
                        webhook_id = %self.id,
                        field,
                        root = %reference.root,
                        "template references an optional field without a guard, it renders empty when absent"
                    );
                }
            }
        }

        if let Some(output) = &self.output_template {
            for reference in output.references() {
                if !RESPONSE_ROOTS.contains(&reference.root.as_str()) {
                    return Err(WebhookError::UnknownField {
                        field: "output",
                        root: reference.root,
                    });
                }
            }
        }
        Ok(())
    }
}

pub fn default_output_template(mode: WebhookMode) -> Result<Template, TemplateError> {
    match mode {
        WebhookMode::Sync => Template::parse(DEFAULT_SYNC_OUTPUT_TEMPLATE),
        WebhookMode::AsyncCallback => Template::parse(DEFAULT_ASYNC_OUTPUT_TEMPLATE),
    }
}

/// Webhooks by id, with lookups by owning resource and notification type.
pub struct WebhookRegistry {
    webhooks: RwLock<IndexMap<String, Arc<Webhook>>>,
    strict: bool,
}

impl WebhookRegistry {
    /// With `strict`, templates referencing optional fields outside of a guard are rejected.
    pub fn new(strict: bool) -> Self {
        WebhookRegistry {
            webhooks: RwLock::new(IndexMap::new()),
            strict,
        }
    }

    pub fn register(&self, webhook: Webhook) -> Result<Arc<Webhook>, WebhookError> {
        webhook.validate(self.strict)?;

        let mut webhooks = self.webhooks.write();
        if webhooks.contains_key(&webhook.id) {
            return Err(WebhookError::Duplicate(webhook.id));
        }
        if webhooks
            .values()
            .any(|w| w.owner == webhook.owner && w.webhook_type == webhook.webhook_type)
        {
            return Err(WebhookError::DuplicateOwner {
                owner: webhook.owner,
                webhook_type: webhook.webhook_type,
            });
        }

        tracing::info!(
            webhook_id = %webhook.id,
            owner = %webhook.owner,
            webhook_type = %webhook.webhook_type,
            mode = webhook.mode.as_str(),
            "registered webhook"
        );
        let webhook = Arc::new(webhook);
        webhooks.insert(webhook.id.clone(), webhook.clone());
        Ok(webhook)
    }

    pub fn delete(&self, id: &str) -> Result<Arc<Webhook>, WebhookError> {
        self.webhooks
            .write()
            .shift_remove(id)
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Webhook>> {
        self.webhooks.read().get(id).cloned()
    }

    pub fn find(&self, owner: &WebhookOwner, webhook_type: WebhookType) -> Option<Arc<Webhook>> {
        self.webhooks
            .read()
            .values()
            .find(|w| &w.owner == owner && w.webhook_type == webhook_type)
            .cloned()
    }

    /// Webhook notified when `source` is paired with `target`. The notification goes to
    /// the target; a webhook on the target resource wins over one on its template.
    pub fn resolve_for_pair(
        &self,
        source: &ParticipantAttributes,
        target: &ParticipantAttributes,
    ) -> Option<Arc<Webhook>> {
        match target.kind {
            ParticipantKind::Application => {
                let webhook_type = if source.kind == ParticipantKind::Application {
                    WebhookType::ApplicationTenantMapping
                } else {
                    WebhookType::ConfigurationChanged
                };
                self.find(&WebhookOwner::Application(target.id.clone()), webhook_type)
                    .or_else(|| {
                        let template = target.application_template.as_ref()?;
                        self.find(
                            &WebhookOwner::ApplicationTemplate(template.id.clone()),
                            webhook_type,
                        )
                    })
            }
            ParticipantKind::Runtime => self.find(
                &WebhookOwner::Runtime(target.id.clone()),
                WebhookType::ConfigurationChanged,
            ),
            ParticipantKind::RuntimeContext => {
                let runtime = target.parent_runtime_id.as_ref()?;
                self.find(
                    &WebhookOwner::Runtime(runtime.clone()),
                    WebhookType::ConfigurationChanged,
                )
            }
            ParticipantKind::Tenant => None,
        }
    }

    pub fn resolve_lifecycle(&self, formation_template_id: &str) -> Option<Arc<Webhook>> {
        self.find(
            &WebhookOwner::FormationTemplate(formation_template_id.to_string()),
            WebhookType::FormationLifecycle,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TemplateAttributes;
    use crate::types::Participant;

    fn webhook(id: &str, owner: WebhookOwner, webhook_type: WebhookType) -> Webhook {
        Webhook {
            id: id.into(),
            owner,
            webhook_type,
            mode: WebhookMode::Sync,
            url_template: Template::parse(r#"{"method":"PATCH","path":"http://target.local/{{ .Assignment.ID }}"}"#)
                .unwrap(),
            input_template: None,
            output_template: None,
            header_template: None,
            supports_reset: false,
        }
    }

    fn app(id: &str, template: Option<&str>) -> ParticipantAttributes {
        ParticipantAttributes {
            application_template: template.map(|t| TemplateAttributes {
                id: t.into(),
                name: t.into(),
                labels: Default::default(),
            }),
            ..ParticipantAttributes::bare(&Participant::new(id, ParticipantKind::Application))
        }
    }

    #[test]
    fn test_resource_webhook_wins_over_template() {
        let registry = WebhookRegistry::new(false);
        registry
            .register(webhook(
                "from-template",
                WebhookOwner::ApplicationTemplate("tpl".into()),
                WebhookType::ApplicationTenantMapping,
            ))
            .unwrap();

        let source = app("app1", None);
        let target = app("app2", Some("tpl"));
        assert_eq!(
            registry.resolve_for_pair(&source, &target).unwrap().id,
            "from-template"
        );

        registry
            .register(webhook(
                "from-app",
                WebhookOwner::Application("app2".into()),
                WebhookType::ApplicationTenantMapping,
            ))
            .unwrap();
        assert_eq!(registry.resolve_for_pair(&source, &target).unwrap().id, "from-app");

        // A runtime source needs the configuration changed type.
        let runtime = ParticipantAttributes::bare(&Participant::new("rt1", ParticipantKind::Runtime));
        assert!(registry.resolve_for_pair(&runtime, &target).is_none());
    }

    #[test]
    fn test_runtime_context_uses_parent_runtime() {
        let registry = WebhookRegistry::new(false);
        registry
            .register(webhook(
                "rt-hook",
                WebhookOwner::Runtime("rt1".into()),
                WebhookType::ConfigurationChanged,
            ))
            .unwrap();
        let context = ParticipantAttributes {
            parent_runtime_id: Some("rt1".into()),
            ..ParticipantAttributes::bare(&Participant::new("rc1", ParticipantKind::RuntimeContext))
        };
        assert_eq!(
            registry.resolve_for_pair(&app("app1", None), &context).unwrap().id,
            "rt-hook"
        );
    }

    #[test]
    fn test_register_validation() {
        let registry = WebhookRegistry::new(false);
        let owner = WebhookOwner::Application("app1".into());

        let mut unknown = webhook("w1", owner.clone(), WebhookType::ApplicationTenantMapping);
        unknown.input_template = Some(Template::parse("{{ .Bogus.ID }}").unwrap());
        assert!(matches!(
            registry.register(unknown),
            Err(WebhookError::UnknownField { field: "input", .. })
        ));

        // Optional roots outside of a guard only warn in lenient mode.
        let mut unguarded = webhook("w2", owner.clone(), WebhookType::ConfigurationChanged);
        unguarded.input_template = Some(Template::parse("{{ .Runtime.ID }}").unwrap());
        assert!(registry.register(unguarded.clone()).is_ok());

        let strict = WebhookRegistry::new(true);
        assert!(matches!(
            strict.register(unguarded),
            Err(WebhookError::UnguardedOptional { .. })
        ));

        let mut guarded = webhook("w3", owner.clone(), WebhookType::ConfigurationChanged);
        guarded.input_template =
            Some(Template::parse("{{ if .Runtime }}{{ .Runtime.ID }}{{ end }}").unwrap());
        assert!(strict.register(guarded).is_ok());

        let duplicate = webhook("w4", owner, WebhookType::ConfigurationChanged);
        assert!(matches!(
            registry.register(duplicate),
            Err(WebhookError::DuplicateOwner { .. })
        ));

        assert!(registry.delete("w2").is_ok());
        assert!(matches!(registry.delete("w2"), Err(WebhookError::NotFound(_))));
    }

    #[test]
    fn test_render_request() {
        let mut hook = webhook(
            "w1",
            WebhookOwner::Application("app1".into()),
            WebhookType::ApplicationTenantMapping,
        );
        hook.header_template = Some(
            Template::parse(r#"{"Content-Type":["application/json"],"X-Tenant":"{{ .Formation.TenantID }}"}"#)
                .unwrap(),
        );
        hook.input_template = Some(Template::parse(r#"{"op":"{{ .Operation }}"}"#).unwrap());

        let ctx = serde_json::json!({
            "Operation": "assign",
            "Assignment": {"ID": "a1"},
            "Formation": {"TenantID": "t1"},
        });
        let request = hook.render_request(&ctx).unwrap();
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(request.url.as_str(), "http://target.local/a1");
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(request.headers["x-tenant"], "t1");
        assert_eq!(request.body.as_deref(), Some(r#"{"op":"assign"}"#));

        hook.url_template = Template::parse(r#"{"method":"GET","path":"not a url"}"#).unwrap();
        assert!(matches!(
            hook.render_request(&ctx),
            Err(WebhookError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_deserialize_webhook() {
        let yaml = r#"
id: lifecycle
owner:
  type: FORMATION_TEMPLATE
  id: tpl
type: FORMATION_LIFECYCLE
mode: ASYNC_CALLBACK
url_template: '{"method":"POST","path":"http://lifecycle.local"}'
"#;
        let hook: Webhook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hook.owner, WebhookOwner::FormationTemplate("tpl".into()));
        assert_eq!(hook.mode, WebhookMode::AsyncCallback);
        assert!(!hook.supports_reset);
        assert!(hook.output_template().is_ok());
    }
}
