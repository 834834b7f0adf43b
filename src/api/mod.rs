//! HTTP v1 frontend.
//!
//! A thin layer over the session manager: routing, JSON marshaling and
//! status mapping only. Admin calls manage sessions; project calls are
//! the reply side of the maintenance negotiation.

use crate::manager::{CreateSessionRequest, ProjectReply, SessionManager};
use crate::DrydockError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/v1/maintenance", get(admin_list).post(admin_create))
        .route(
            "/v1/maintenance/:session_id",
            get(admin_get).put(admin_update).delete(admin_delete),
        )
        .route(
            "/v1/maintenance/:session_id/:project_id",
            get(project_get).put(project_update),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn admin_list(State(manager): State<Arc<SessionManager>>, body: Bytes) -> Response {
    if !body.is_empty() {
        return unexpected_data();
    }
    let sessions = manager.admin_get().await;
    (StatusCode::OK, Json(json!({ "sessions": sessions }))).into_response()
}

async fn admin_create(State(manager): State<Arc<SessionManager>>, body: Bytes) -> Response {
    let request: CreateSessionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "bad session creation body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    match manager.admin_create_session(request).await {
        Ok(session_id) => {
            (StatusCode::OK, Json(json!({ "session_id": session_id }))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn admin_get(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    if !body.is_empty() {
        return unexpected_data();
    }
    match manager.admin_get_session(&session_id).await {
        Some((session_id, state)) => (
            StatusCode::OK,
            Json(json!({ "session_id": session_id, "state": state.as_str() })),
        )
            .into_response(),
        None => error_response(DrydockError::InvalidSession(session_id)),
    }
}

async fn admin_update(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
    _body: Bytes,
) -> Response {
    match manager.admin_update_session(&session_id).await {
        Ok(session_id) => {
            let maintenance = format!(
                "{}/v1/maintenance/{}",
                manager.config().base_url(),
                session_id
            );
            (
                StatusCode::OK,
                Json(json!({ "maintenance": maintenance, "session_id": session_id })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn admin_delete(
    State(manager): State<Arc<SessionManager>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    if !body.is_empty() {
        return unexpected_data();
    }
    match manager.admin_delete_session(&session_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn project_get(
    State(manager): State<Arc<SessionManager>>,
    Path((session_id, project_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if !body.is_empty() {
        return unexpected_data();
    }
    match manager.project_get_session(&session_id, &project_id).await {
        Ok(instance_ids) => {
            (StatusCode::OK, Json(json!({ "instance_ids": instance_ids }))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn project_update(
    State(manager): State<Arc<SessionManager>>,
    Path((session_id, project_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let reply: ProjectReply = match serde_json::from_slice(&body) {
        Ok(reply) => reply,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    match manager
        .project_update_session(&session_id, &project_id, reply)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => error_response(e),
    }
}

fn unexpected_data() -> Response {
    tracing::error!("unexpected data");
    (StatusCode::BAD_REQUEST, Json(json!({}))).into_response()
}

fn error_response(error: DrydockError) -> Response {
    let (status, message) = match &error {
        DrydockError::InvalidSession(_) => (StatusCode::NOT_FOUND, "Invalid session".to_string()),
        DrydockError::NotFound { .. } => (StatusCode::NOT_FOUND, error.to_string()),
        DrydockError::TooManySessions => (
            StatusCode::from_u16(509).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "Too many sessions".to_string(),
        ),
        DrydockError::BadRequest(_) | DrydockError::Config(_) => {
            (StatusCode::BAD_REQUEST, error.to_string())
        }
        DrydockError::Duplicate { .. } => (StatusCode::CONFLICT, error.to_string()),
        _ => {
            tracing::error!(error = %error, "internal error at the API edge");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    };
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::mock::MockCompute;
    use crate::config::AppConfig;
    use crate::manager::MAX_SESSIONS;
    use crate::notify::BusNotifier;
    use crate::store::Store;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let compute = Arc::new(MockCompute::new());
        let notifier = Arc::new(BusNotifier::new("maintenance"));
        let manager = Arc::new(SessionManager::new(
            AppConfig::default(),
            store,
            compute,
            notifier,
        ));
        router(manager)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn create_body() -> String {
        json!({
            "hosts": ["c1", "c2"],
            "maintenance_at": "2038-01-19T03:14:07Z",
            "metadata": {"reason": "upgrade"}
        })
        .to_string()
    }

    #[tokio::test]
    async fn list_rejects_unexpected_body() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::get("/v1/maintenance")
                    .body(Body::from("stray"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_then_get_then_delete() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(
                Request::post("/v1/maintenance")
                    .body(Body::from(create_body()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let session_id = created["session_id"].as_str().expect("id").to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/v1/maintenance/{}", session_id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = body_json(response).await;
        assert_eq!(fetched["session_id"], session_id.as_str());
        assert!(fetched["state"].is_string());

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/v1/maintenance/{}", session_id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get(format!("/v1/maintenance/{}", session_id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Invalid session");
    }

    #[tokio::test]
    async fn create_rejects_unknown_workflow() {
        let app = test_router();
        let body = json!({
            "maintenance_at": "2038-01-19T03:14:07Z",
            "workflow": "vendor_special"
        })
        .to_string();
        let response = app
            .oneshot(
                Request::post("/v1/maintenance")
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cap_maps_to_509() {
        let app = test_router();
        for _ in 0..MAX_SESSIONS {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/v1/maintenance")
                        .body(Body::from(create_body()))
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .oneshot(
                Request::post("/v1/maintenance")
                    .body(Body::from(create_body()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status().as_u16(), 509);
        assert_eq!(body_json(response).await["error"], "Too many sessions");
    }

    #[tokio::test]
    async fn project_reply_validation() {
        let app = test_router();
        let response = app
            .clone()
            .oneshot(
                Request::post("/v1/maintenance")
                    .body(Body::from(create_body()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let session_id = body_json(response).await["session_id"]
            .as_str()
            .expect("id")
            .to_string();

        // No instance of p1 is in scope, so the gateway knows no such
        // project: the reply maps to 404 rather than being recorded.
        let reply = json!({
            "state": "ACK_MAINTENANCE",
            "instance_actions": {"i1": "MIGRATE"}
        })
        .to_string();
        let response = app
            .clone()
            .oneshot(
                Request::put(format!("/v1/maintenance/{}/p1", session_id))
                    .body(Body::from(reply))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // A malformed state string is a 400 even for a known session.
        let response = app
            .oneshot(
                Request::put(format!("/v1/maintenance/{}/p1", session_id))
                    .body(Body::from(json!({"state": "MAYBE_LATER"}).to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_paths_return_404() {
        let app = test_router();
        let response = app
            .clone()
            .oneshot(
                Request::get("/v1/maintenance/missing/p1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::put("/v1/maintenance/missing")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
