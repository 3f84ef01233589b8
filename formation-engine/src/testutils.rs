use crate::config::{Config, Listener, NotificationConfig};
use crate::constraints::ConstraintEngine;
use crate::constraints::operators::OperatorRegistry;
use crate::engine::{Collaborators, FormationEngine};
use crate::providers::{
    ParticipantAttributes, RecordingDestinations, StaticParticipants, StaticTenants,
    TemplateAttributes, TenantRecord,
};
use crate::store::Store;
use crate::template::Template;
use crate::transport::{NotificationTransport, TransportError, TransportResponse};
use crate::types::{Formation, FormationState, FormationStatus, Participant, ParticipantKind};
use crate::webhooks::{RenderedRequest, Webhook, WebhookMode, WebhookOwner, WebhookType};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A READY formation built from template `tpl` (named `T`).
pub fn formation(tenant: &str, name: &str) -> Formation {
    Formation {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        tenant_id: tenant.to_string(),
        template_id: "tpl".to_string(),
        template_name: "T".to_string(),
        state: FormationState::Ready,
        error: None,
        status: FormationStatus::aggregate(FormationState::Ready, None, &[]),
    }
}

pub fn test_config() -> Config {
    Config {
        listener: Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        },
        admin_listener: Listener {
            host: "127.0.0.1".into(),
            port: 3001,
        },
        callback_base_url: "http://formations.local".parse().unwrap(),
        notifications: NotificationConfig {
            timeout_secs: 5,
            // Keeps the order of sends within a fan-out deterministic.
            concurrency: 1,
        },
        default_formation_template: "default".into(),
        strict_templates: false,
        fixtures: None,
    }
}

struct Rule {
    url_contains: String,
    response: Result<TransportResponse, TransportError>,
    once: bool,
}

/// Records every request. The most recently added rule whose pattern is contained in
/// the request URL answers; without one the response is an empty 200.
#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<Vec<Rule>>,
    delays: Mutex<Vec<(String, Duration)>>,
    requests: Mutex<Vec<RenderedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, url_contains: &str, response: Result<TransportResponse, TransportError>, once: bool) {
        self.rules.lock().push(Rule {
            url_contains: url_contains.to_string(),
            response,
            once,
        });
    }

    pub fn respond(&self, url_contains: &str, status: u16, body: &str) {
        self.push(url_contains, Ok(response(status, body)), false);
    }

    pub fn respond_once(&self, url_contains: &str, status: u16, body: &str) {
        self.push(url_contains, Ok(response(status, body)), true);
    }

    pub fn fail(&self, url_contains: &str, error: TransportError) {
        self.push(url_contains, Err(error), false);
    }

    /// Requests whose URL contains `url_contains` are answered after `delay`.
    pub fn delay(&self, url_contains: &str, delay: Duration) {
        self.delays.lock().push((url_contains.to_string(), delay));
    }

    pub fn requests(&self) -> Vec<RenderedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, url_contains: &str) -> Vec<RenderedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.as_str().contains(url_contains))
            .cloned()
            .collect()
    }
}

fn response(status: u16, body: &str) -> TransportResponse {
    TransportResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from(body.to_string()),
    }
}

#[async_trait]
impl NotificationTransport for MockTransport {
    async fn send(&self, request: &RenderedRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let url = request.url.as_str();
        let delay = self
            .delays
            .lock()
            .iter()
            .find(|(pattern, _)| url.contains(pattern))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut rules = self.rules.lock();
        let Some(index) = rules.iter().rposition(|r| url.contains(&r.url_contains)) else {
            return Ok(response(200, ""));
        };
        if rules[index].once {
            return rules.remove(index).response;
        }
        rules[index].response.clone()
    }
}

pub struct TestHarness {
    pub store: Arc<Store>,
    pub participants: Arc<StaticParticipants>,
    pub tenants: Arc<StaticTenants>,
    pub destinations: Arc<RecordingDestinations>,
    pub transport: Arc<MockTransport>,
}

impl TestHarness {
    pub fn new() -> Self {
        let tenants = StaticTenants::new();
        tenants.insert(TenantRecord {
            id: "t1".into(),
            parent: Some("customer1".into()),
        });
        TestHarness {
            store: Arc::new(Store::new()),
            participants: Arc::new(StaticParticipants::new()),
            tenants: Arc::new(tenants),
            destinations: Arc::new(RecordingDestinations::new()),
            transport: Arc::new(MockTransport::new()),
        }
    }

    pub fn constraint_engine(&self) -> ConstraintEngine {
        ConstraintEngine::new(OperatorRegistry::new(
            self.store.clone(),
            self.destinations.clone(),
        ))
    }

    pub fn engine(&self) -> FormationEngine {
        FormationEngine::new(
            test_config(),
            Collaborators {
                participants: self.participants.clone(),
                tenants: self.tenants.clone(),
                destinations: self.destinations.clone(),
                transport: self.transport.clone(),
            },
        )
    }

    pub fn add_app(&self, id: &str, subtype: &str) {
        self.participants.insert(ParticipantAttributes {
            name: format!("{id} name"),
            subtype: Some(subtype.into()),
            base_url: Some(format!("http://{id}.local")),
            ..ParticipantAttributes::bare(&Participant::new(id, ParticipantKind::Application))
        });
    }

    pub fn add_templated_app(&self, id: &str, subtype: &str, template_id: &str) {
        self.add_app(id, subtype);
        let participant = Participant::new(id, ParticipantKind::Application);
        if let Some(mut attributes) = self.participants.remove(&participant) {
            attributes.application_template = Some(TemplateAttributes {
                id: template_id.into(),
                name: template_id.into(),
                labels: Default::default(),
            });
            self.participants.insert(attributes);
        }
    }

    pub fn add_runtime(&self, id: &str, subtype: &str) {
        self.participants.insert(ParticipantAttributes {
            name: format!("{id} name"),
            subtype: Some(subtype.into()),
            ..ParticipantAttributes::bare(&Participant::new(id, ParticipantKind::Runtime))
        });
    }

    pub fn add_runtime_context(&self, id: &str, runtime_id: &str) {
        self.participants.insert(ParticipantAttributes {
            name: format!("{id} name"),
            parent_runtime_id: Some(runtime_id.into()),
            ..ParticipantAttributes::bare(&Participant::new(id, ParticipantKind::RuntimeContext))
        });
    }
}

/// Webhook posting to `url`, with the assignment id appended for assignment notifications.
pub fn webhook(
    id: &str,
    owner: WebhookOwner,
    webhook_type: WebhookType,
    mode: WebhookMode,
    url: &str,
) -> Webhook {
    let path = if webhook_type == WebhookType::FormationLifecycle {
        format!("{url}/{{{{ .Operation }}}}")
    } else {
        format!("{url}/{{{{ .Assignment.ID }}}}")
    };
    Webhook {
        id: id.into(),
        owner,
        webhook_type,
        mode,
        url_template: Template::parse(&format!(r#"{{"method":"POST","path":"{path}"}}"#)).unwrap(),
        input_template: Some(
            Template::parse(r#"{"operation":"{{ .Operation }}","formation":"{{ .FormationID }}"}"#)
                .unwrap(),
        ),
        output_template: None,
        header_template: None,
        supports_reset: false,
    }
}
