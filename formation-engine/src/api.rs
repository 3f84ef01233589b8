use crate::config::Listener as ListenerConfig;
use crate::engine::FormationEngine;
use crate::errors::{ErrorKind, FormationError};
use crate::lifecycle::FormationStatusReport;
use crate::types::{Formation, FormationAssignment, FormationStatus, Page, ParticipantKind};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;

/// Header naming the acting tenant.
pub const TENANT_HEADER: &str = "tenant";

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub async fn serve(listener: ListenerConfig, engine: FormationEngine) -> Result<(), ApiError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "formation api listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

pub fn router(engine: FormationEngine) -> Router {
    Router::new()
        .route("/v1/formations", post(create_formation).get(list_formations))
        .route(
            "/v1/formations/{formation}",
            get(get_formation).delete(delete_formation),
        )
        .route("/v1/formations/{formation}/assign", post(assign))
        .route("/v1/formations/{formation}/unassign", post(unassign))
        .route("/v1/formations/{formation}/resynchronize", post(resynchronize))
        .route("/v1/formations/{formation}/assignments", get(list_assignments))
        .route("/v1/formations/{formation}/status", get(formation_status))
        .route(
            "/v1/businessIntegrations/{formation_id}/assignments/{assignment_id}/status",
            patch(report_assignment_status),
        )
        .route(
            "/v1/businessIntegrations/{formation_id}/status",
            patch(report_formation_status),
        )
        .with_state(engine)
}

/// Acting tenant, taken from the `tenant` header.
pub struct Tenant(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = FormationError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|tenant| !tenant.is_empty())
            .map(|tenant| Tenant(tenant.to_string()))
            .ok_or_else(|| FormationError::Validation(format!("missing {TENANT_HEADER} header")))
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for FormationError {
    fn into_response(self) -> Response {
        let status = match (&self, self.kind()) {
            (FormationError::AlreadyExists { .. }, _) => StatusCode::CONFLICT,
            (_, ErrorKind::Validation | ErrorKind::ConstraintDenied) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::NotFound) => StatusCode::NOT_FOUND,
            (_, ErrorKind::Notification) => StatusCode::BAD_GATEWAY,
            (_, ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Deserialize, Debug)]
struct CreateFormation {
    name: String,
    #[serde(default)]
    template_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Membership {
    object_id: String,
    object_type: ParticipantKind,
}

#[derive(Deserialize, Debug, Default)]
struct PageParams {
    first: Option<usize>,
    after: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ResyncParams {
    #[serde(default)]
    reset: bool,
}

async fn create_formation(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Json(body): Json<CreateFormation>,
) -> Result<(StatusCode, Json<Formation>), FormationError> {
    let formation = engine
        .create_formation(&tenant, &body.name, body.template_name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(formation)))
}

async fn list_formations(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<Formation>>, FormationError> {
    engine
        .list_formations(&tenant, params.first, params.after.as_deref())
        .map(Json)
}

async fn get_formation(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
) -> Result<Json<Formation>, FormationError> {
    engine.get_formation(&tenant, &formation).map(Json)
}

async fn delete_formation(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
) -> Result<Json<Formation>, FormationError> {
    engine.delete_formation(&tenant, &formation).await.map(Json)
}

async fn assign(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
    Json(body): Json<Membership>,
) -> Result<Json<Formation>, FormationError> {
    engine
        .assign(&tenant, &formation, &body.object_id, body.object_type)
        .await
        .map(Json)
}

async fn unassign(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
    Json(body): Json<Membership>,
) -> Result<Json<Formation>, FormationError> {
    engine
        .unassign(&tenant, &formation, &body.object_id, body.object_type)
        .await
        .map(Json)
}

async fn resynchronize(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
    Query(params): Query<ResyncParams>,
) -> Result<Json<Formation>, FormationError> {
    engine
        .resynchronize(&tenant, &formation, params.reset)
        .await
        .map(Json)
}

async fn list_assignments(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<FormationAssignment>>, FormationError> {
    engine
        .list_formation_assignments(&tenant, &formation, params.first, params.after.as_deref())
        .map(Json)
}

async fn formation_status(
    State(engine): State<FormationEngine>,
    Tenant(tenant): Tenant,
    Path(formation): Path<String>,
) -> Result<Json<FormationStatus>, FormationError> {
    engine.get_formation_status(&tenant, &formation).map(Json)
}

async fn report_assignment_status(
    State(engine): State<FormationEngine>,
    Path((formation_id, assignment_id)): Path<(String, String)>,
    Json(report): Json<Value>,
) -> Result<Response, FormationError> {
    let updated = engine
        .report_assignment_status(&formation_id, &assignment_id, report)
        .await?;
    Ok(match updated {
        Some(assignment) => Json(assignment).into_response(),
        // Removed by a successful delete.
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn report_formation_status(
    State(engine): State<FormationEngine>,
    Path(formation_id): Path<String>,
    Json(report): Json<FormationStatusReport>,
) -> Result<Response, FormationError> {
    let updated = engine.report_formation_status(&formation_id, report).await?;
    Ok(match updated {
        Some(formation) => Json(formation).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::TestHarness;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            request = request.header(TENANT_HEADER, tenant);
        }
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_formation_endpoints() {
        let harness = TestHarness::new();
        harness.add_app("app1", "app-type");
        harness.add_app("app2", "app-type");
        let router = router(harness.engine());

        let (status, created) = call(
            &router,
            Method::POST,
            "/v1/formations",
            Some("t1"),
            Some(json!({"name": "F"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["state"], "READY");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &router,
            Method::POST,
            "/v1/formations",
            Some("t1"),
            Some(json!({"name": "F"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error_message"].as_str().unwrap().contains("already exists"));

        for app in ["app1", "app2"] {
            let (status, _) = call(
                &router,
                Method::POST,
                "/v1/formations/F/assign",
                Some("t1"),
                Some(json!({"object_id": app, "object_type": "APPLICATION"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, page) = call(
            &router,
            Method::GET,
            &format!("/v1/formations/{id}/assignments?first=3"),
            Some("t1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total_count"], 4);
        assert_eq!(page["data"].as_array().unwrap().len(), 3);
        assert_eq!(page["page_info"]["has_next_page"], true);

        let (status, body) = call(
            &router,
            Method::GET,
            &format!("/v1/formations/{id}/status"),
            Some("t1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["condition"], "READY");

        let (status, _) = call(
            &router,
            Method::POST,
            &format!("/v1/formations/{id}/resynchronize?reset=true"),
            Some("t1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&router, Method::GET, "/v1/formations/F", Some("t2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, deleted) =
            call(&router, Method::DELETE, "/v1/formations/F", Some("t1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["id"], id.as_str());
        let (status, page) = call(&router, Method::GET, "/v1/formations", Some("t1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total_count"], 0);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let harness = TestHarness::new();
        harness.add_app("app1", "app-type");
        let router = router(harness.engine());

        let (status, body) = call(&router, Method::GET, "/v1/formations", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_message"], "validation failed: missing tenant header");

        let (status, _) = call(
            &router,
            Method::POST,
            "/v1/formations/nope/assign",
            Some("t1"),
            Some(json!({"object_id": "app1", "object_type": "APPLICATION"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &router,
            Method::GET,
            "/v1/formations?after=not-a-cursor",
            Some("t1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &router,
            Method::PATCH,
            "/v1/businessIntegrations/unknown/status",
            None,
            Some(json!({"state": "READY"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_assignment_status_callback() {
        let harness = TestHarness::new();
        harness.add_app("app1", "app-type");
        harness.add_app("app2", "app-type");
        harness.transport.respond("app2.target.local", 202, "");
        let engine = harness.engine();
        engine
            .register_webhook(crate::testutils::webhook(
                "w2",
                crate::webhooks::WebhookOwner::Application("app2".into()),
                crate::webhooks::WebhookType::ApplicationTenantMapping,
                crate::webhooks::WebhookMode::AsyncCallback,
                "http://app2.target.local",
            ))
            .unwrap();
        let formation = engine.create_formation("t1", "F", None).await.unwrap();
        engine
            .assign("t1", "F", "app1", ParticipantKind::Application)
            .await
            .unwrap();
        engine
            .assign("t1", "F", "app2", ParticipantKind::Application)
            .await
            .unwrap();
        let pending = engine
            .list_formation_assignments("t1", "F", None, None)
            .unwrap()
            .data
            .into_iter()
            .find(|a| a.target.id == "app2" && !a.is_reflexive())
            .unwrap();
        let router = router(engine);

        let uri = format!(
            "/v1/businessIntegrations/{}/assignments/{}/status",
            formation.id, pending.id
        );
        let (status, _) = call(
            &router,
            Method::PATCH,
            &uri,
            None,
            Some(json!({"state": "DELETE_ERROR"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &router,
            Method::PATCH,
            &uri,
            None,
            Some(json!({"state": "READY", "config": {"k": "v"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "READY");
        assert_eq!(body["configuration"], r#"{"k":"v"}"#);
    }
}
