//! Axum endpoints: health probe and webhook receiver.

use std::sync::Arc;

use anyhow::Context;
use atpg_core::{SyncAction, WebhookPayload};
use atpg_storage::RecordStoreBackend;
use atpg_sync::sync_in_transaction;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "atpg-web";

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn RecordStoreBackend>,
}

impl AppState {
    pub fn new(backend: Arc<dyn RecordStoreBackend>) -> Self {
        Self { backend }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    success: bool,
    action: SyncAction,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    detail: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhook", post(webhook_handler))
        .route("/airtable-webhook", post(webhook_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "webhook receiver listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WebhookPayload>, JsonRejection>,
) -> Response {
    let payload = match body {
        Ok(Json(payload)) => payload,
        Err(rejection) => return validation_error(rejection),
    };

    let delivery_id = Uuid::new_v4();
    let span = info_span!("webhook", %delivery_id, record_id = %payload.id);
    match sync_in_transaction(state.backend.as_ref(), &payload)
        .instrument(span.clone())
        .await
    {
        Ok(action) => Json(WebhookResponse {
            success: true,
            action,
        })
        .into_response(),
        Err(err) => {
            span.in_scope(|| error!(error = %err, "webhook sync failed"));
            server_error(err.to_string())
        }
    }
}

fn validation_error(rejection: JsonRejection) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorResponse {
            detail: rejection.body_text(),
        }),
    )
        .into_response()
}

// The underlying error text is returned to the caller verbatim.
fn server_error(detail: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { detail })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atpg_core::FieldMapping;
    use atpg_storage::{MemoryRecordStore, UnconfiguredStore};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn memory_app() -> (Router, MemoryRecordStore) {
        let store = MemoryRecordStore::new(Arc::new(FieldMapping::default()));
        (app(AppState::new(Arc::new(store.clone()))), store)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok_without_database() {
        let app = app(AppState::new(Arc::new(UnconfiguredStore::new("DATABASE_URL"))));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn repeated_delivery_creates_then_updates() {
        let (app, store) = memory_app();
        let body = r#"{"id": "rec1", "fields": {"Startup name": "Acme", "date_sourced": "2024-01-01"}}"#;

        let first = app.clone().oneshot(post_json("/webhook", body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            json_body(first).await,
            json!({"success": true, "action": "created record"})
        );

        let second = app.oneshot(post_json("/webhook", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(
            json_body(second).await,
            json!({"success": true, "action": "updated record"})
        );

        assert_eq!(store.row_count().await, 1);
        let row = store.get("rec1").await.unwrap();
        assert_eq!(row.get("Startup name"), Some("Acme"));
        assert_eq!(row.get("PH1_Constitution_Location"), None);
        assert_eq!(row.get("date_sourced"), Some("2024-01-01"));
    }

    #[tokio::test]
    async fn legacy_path_is_served() {
        let (app, store) = memory_app();
        let resp = app
            .oneshot(post_json("/airtable-webhook", r#"{"id": "rec2", "fields": {}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(store.get("rec2").await.is_some());
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_with_422() {
        let (app, store) = memory_app();
        let cases = [
            r#"{"fields": {}}"#,
            r#"{"id": "rec1"}"#,
            r#"{"id": 7, "fields": {}}"#,
            r#"{"id": "rec1", "fields": ["a"]}"#,
            r#"{"id": "rec1", "fields": "#,
        ];
        for body in cases {
            let resp = app.clone().oneshot(post_json("/webhook", body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "body: {body}");
            let detail = json_body(resp).await;
            assert!(detail["detail"].as_str().is_some_and(|d| !d.is_empty()));
        }

        let resp = app
            .oneshot(post_json("/webhook", r#"{"fields": {}}"#))
            .await
            .unwrap();
        let detail = json_body(resp).await;
        assert!(detail["detail"].as_str().unwrap().contains("missing field `id`"));
        assert_eq!(store.row_count().await, 0);
    }

    #[tokio::test]
    async fn write_failure_returns_500_and_commits_nothing() {
        let (app, store) = memory_app();
        store.set_fail_writes(true).await;
        let resp = app
            .oneshot(post_json("/webhook", r#"{"id": "rec1", "fields": {"Startup name": "Acme"}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await, json!({"detail": "simulated write failure"}));
        assert!(store.get("rec1").await.is_none());
    }

    #[tokio::test]
    async fn missing_configuration_surfaces_on_webhook() {
        let app = app(AppState::new(Arc::new(UnconfiguredStore::new("PG_TABLE_NAME"))));
        let resp = app
            .oneshot(post_json("/webhook", r#"{"id": "rec1", "fields": {}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await, json!({"detail": "PG_TABLE_NAME is not set"}));
    }
}
