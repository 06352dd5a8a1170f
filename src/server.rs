use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    error::{ApiError, StartScanError},
    notifications::NotificationId,
    poller::{ActivityIndicator, RunningScans},
    session::AppSession,
    types::ConnectionState,
};

#[derive(Clone)]
pub struct AppState {
    session: Arc<AppSession>,
}

#[derive(Debug, Deserialize)]
pub struct StartScanBody {
    pub scanners: Vec<String>,
    #[serde(default)]
    pub ports: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionView {
    pub state: ConnectionState,
}

#[derive(Debug, Serialize)]
pub struct NodeActivity {
    pub node: String,
    pub indicator: ActivityIndicator,
    #[serde(flatten)]
    pub listing: RunningScans,
}

/// Dashboard API under `/api`, static UI from `ui/` for everything else.
pub fn router(session: Arc<AppSession>) -> Router {
    let state = AppState { session };

    let api = Router::new()
        .route(
            "/notifications",
            get(list_notifications).delete(clear_notifications),
        )
        .route("/notifications/{id}", delete(close_notification))
        .route("/connection", get(get_connection))
        .route("/nodes/{node}/running", get(get_running))
        .route("/nodes/{node}/watch", post(watch_node).delete(unwatch_node))
        .route("/nodes/{node}/scans", post(post_scan))
        .route("/sessions/{id}", get(get_session).delete(stop_session))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    let static_svc = ServeDir::new("ui").append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

/// Serve the dashboard on `bind` until `shutdown` is cancelled.
pub async fn spawn_server(
    bind: &str,
    session: Arc<AppSession>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving dashboard");
    axum::serve(listener, router(session))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn list_notifications(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.session.notifications().snapshot()))
}

async fn clear_notifications(State(app): State<AppState>) -> impl IntoResponse {
    app.session.notifications().clear_all();
    StatusCode::NO_CONTENT
}

async fn close_notification(
    State(app): State<AppState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    if app.session.notifications().remove(NotificationId::from(id)) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_connection(State(app): State<AppState>) -> impl IntoResponse {
    let view = ConnectionView {
        state: app.session.connection().connection_state(),
    };
    (StatusCode::OK, Json(view))
}

/// Activity of `node`; nodes nobody watched or started a scan on read as idle.
fn activity(app: &AppState, node: String) -> NodeActivity {
    match app.session.existing_poller(&node) {
        Some(poller) => NodeActivity {
            indicator: poller.indicator(),
            listing: poller.snapshot(),
            node,
        },
        None => NodeActivity {
            indicator: ActivityIndicator::Idle,
            listing: RunningScans::default(),
            node,
        },
    }
}

async fn get_running(State(app): State<AppState>, Path(node): Path<String>) -> impl IntoResponse {
    (StatusCode::OK, Json(activity(&app, node)))
}

async fn watch_node(State(app): State<AppState>, Path(node): Path<String>) -> impl IntoResponse {
    app.session.watch_node(&node);
    (StatusCode::OK, Json(activity(&app, node)))
}

async fn unwatch_node(State(app): State<AppState>, Path(node): Path<String>) -> impl IntoResponse {
    app.session.unwatch_node(&node);
    StatusCode::NO_CONTENT
}

async fn post_scan(
    State(app): State<AppState>,
    Path(node): Path<String>,
    Json(req): Json<StartScanBody>,
) -> impl IntoResponse {
    match app
        .session
        .start_scan(&node, req.scanners, req.ports.as_deref())
        .await
    {
        Ok(handle) => (StatusCode::ACCEPTED, Json(handle.status())).into_response(),
        Err(err) => {
            let code = match &err {
                StartScanError::NoScanners | StartScanError::InvalidPorts(_) => {
                    StatusCode::BAD_REQUEST
                }
                StartScanError::Api(ApiError::Status { status, .. }) if *status < 500 => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                StartScanError::Api(_) => StatusCode::BAD_GATEWAY,
            };
            (code, Json(json!({ "error": err.user_message() }))).into_response()
        }
    }
}

async fn get_session(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match app.session.tracker().status(&id) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stop_session(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if app.session.tracker().stop(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
