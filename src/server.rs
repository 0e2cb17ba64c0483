//! HTTP control API.
//!
//! A thin axum front end over [`CoordinatorHandle`]. Every route forwards to
//! the coordinator task, so requests from the API, the drop folder and the
//! CLI are serialized in one place.
//!
//! | Route                   | Action                                   |
//! |-------------------------|------------------------------------------|
//! | `GET /status`           | current [`VmStatus`]                     |
//! | `PUT /slots/{slot}`     | assign a path or `file://` URL to a slot |
//! | `DELETE /slots/{slot}`  | empty a slot                             |
//! | `POST /start`           | start the VM                             |
//! | `POST /stop`            | stop the VM                              |
//! | `GET /console`          | scrollback, then live console output     |
//! | `POST /console`         | raw input bytes for the guest            |

use std::convert::Infallible;
use std::future::Future;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorHandle, StartOutcome, StopOutcome, VmStatus};
use crate::vm::drop_folder::resolve_dropped;
use crate::vm::slots::Slot;

/// Errors a handler turns into an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    UnknownSlot(String),
    BadPath(String),
    NotRunning,
    Unavailable(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnknownSlot(name) => (StatusCode::NOT_FOUND, format!("unknown slot: {name}")),
            ApiError::BadPath(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotRunning => (StatusCode::CONFLICT, "VM is not running".to_string()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        debug!(target: "server", status = %status, error = %message, "request failed");
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Unavailable(format!("{e:#}"))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the API router.
pub fn router(handle: CoordinatorHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/slots/{slot}", put(assign_slot).delete(clear_slot))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/console", get(console_output).post(console_input))
        .with_state(handle)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    handle: CoordinatorHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "server", %addr, "HTTP API listening");
    }
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!(target: "server", "HTTP API stopped");
    Ok(())
}

fn parse_slot(name: &str) -> ApiResult<Slot> {
    name.parse()
        .map_err(|_| ApiError::UnknownSlot(name.to_string()))
}

async fn status(State(handle): State<CoordinatorHandle>) -> Json<VmStatus> {
    Json(handle.status())
}

async fn assign_slot(
    State(handle): State<CoordinatorHandle>,
    Path(name): Path<String>,
    body: String,
) -> ApiResult<Json<VmStatus>> {
    let slot = parse_slot(&name)?;
    let path = resolve_dropped(&body).map_err(|e| ApiError::BadPath(format!("{e:#}")))?;
    handle.set_path(slot, path).await?;
    Ok(Json(handle.status()))
}

async fn clear_slot(
    State(handle): State<CoordinatorHandle>,
    Path(name): Path<String>,
) -> ApiResult<Json<VmStatus>> {
    let slot = parse_slot(&name)?;
    handle.clear_path(slot).await?;
    Ok(Json(handle.status()))
}

async fn start(State(handle): State<CoordinatorHandle>) -> ApiResult<Json<StartOutcome>> {
    let outcome = handle.start().await?;
    if let StartOutcome::Failed { message } = &outcome {
        warn!(target: "server", error = %message, "start via API failed");
    }
    Ok(Json(outcome))
}

async fn stop(State(handle): State<CoordinatorHandle>) -> ApiResult<Json<StopOutcome>> {
    Ok(Json(handle.stop().await?))
}

async fn console_output(State(handle): State<CoordinatorHandle>) -> ApiResult<Response> {
    let console = handle.show_console().await?.ok_or(ApiError::NotRunning)?;
    let stream = console.into_stream().map(Ok::<_, Infallible>);
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn console_input(
    State(handle): State<CoordinatorHandle>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let console = handle.show_console().await?.ok_or(ApiError::NotRunning)?;
    console.send(body.to_vec()).map_err(|_| ApiError::NotRunning)?;
    Ok(StatusCode::NO_CONTENT)
}
