use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router, extract,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    serve,
};
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::{
    defs::{Command, Mode, Source, StatusEvent},
    device::{Dispatcher, StatusProvider},
    event_log::{Entry, EventLog},
};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub status: Arc<dyn StatusProvider>,
    pub log: EventLog,
    pub mode: Mode,
    pub service: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/command", post(command))
        .route("/api/log", get(event_log))
        .with_state(Arc::new(state))
}

pub async fn bind(address: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP server to {address}"))
}

/// Serves the router until `shutdown` resolves, then lets in-flight
/// requests finish.
pub async fn listen(
    socket: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    tracing::info!("Listening on http://{}", socket.local_addr()?);

    serve(socket, router)
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("HTTP server failed")
}

/* === Routes === */

/* == Health == */

#[derive(Serialize)]
struct Health {
    status: &'static str,
    timestamp: DateTime<Utc>,
    service: String,
    mode: Mode,
}

async fn health(extract::State(state): extract::State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        timestamp: Utc::now(),
        service: state.service.clone(),
        mode: state.mode,
    })
}

/* == Status == */

async fn status(
    extract::State(state): extract::State<Arc<AppState>>,
) -> Result<Json<StatusEvent>, ApiError> {
    state
        .status
        .current_status()
        .map(Json)
        .map_err(|error| ApiError::Internal(error.to_string()))
}

/* == Command == */

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandReceived {
    message: &'static str,
    action: String,
    device_id: String,
    timestamp: DateTime<Utc>,
}

async fn command(
    extract::State(state): extract::State<Arc<AppState>>,
    payload: Result<extract::Json<Command>, JsonRejection>,
) -> Result<Json<CommandReceived>, ApiError> {
    let extract::Json(command) =
        payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    if !state.dispatcher.is_available() {
        return Err(ApiError::Internal("Device controller is not running".into()));
    }

    let received = CommandReceived {
        message: "Command received",
        action: command.action.clone(),
        device_id: command.device_id.clone(),
        timestamp: Utc::now(),
    };

    state.dispatcher.dispatch(command, Source::Rest);

    Ok(Json(received))
}

/* == Event log == */

async fn event_log(extract::State(state): extract::State<Arc<AppState>>) -> Json<Vec<Entry>> {
    Json(state.log.recent())
}

/* == Types == */

enum ApiError {
    BadRequest(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, error) = match self {
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            ApiError::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };

        (code, Json(ErrorBody { error })).into_response()
    }
}
