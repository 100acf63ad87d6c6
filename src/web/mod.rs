//! HTTP/WebSocket control surface.
//!
//! REST endpoints for drives and jobs plus a per-job WebSocket feed.
//! Handlers are thin: they translate HTTP into `PipelineExecutor` and
//! `JobStore` calls and map `ControlError` onto status codes.

mod websocket;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::context::AppContext;
use crate::core::Job;
use crate::db;
use crate::error::{ControlError, ControlResult};
use crate::metadata::refined_output_dir;

#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
}

/// Web server for the control API. Runs until `shutdown()` is called.
pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr,
            state: WebState { ctx },
            shutdown_tx,
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Control API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/drives", get(list_drives))
        .route("/api/drives/eject", post(eject_drive))
        .route("/api/drives/blacklist", post(blacklist_drive))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/pause", post(pause_job))
        .route("/api/jobs/{id}/resume", post(resume_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/retry", post(retry_job))
        .route("/api/jobs/{id}/log", get(job_log))
        .route("/api/jobs/{id}/output", get(get_output).put(set_output))
        .route("/api/jobs/{id}/metadata", post(apply_metadata))
        .route("/api/metadata/search", get(search_metadata))
        .route("/ws/jobs/{id}", get(websocket::ws_handler))
        .with_state(state)
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::JobNotFound(_) | ControlError::DriveNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidTransition { .. }
            | ControlError::RetryNotAllowed { .. }
            | ControlError::OutputLocked
            | ControlError::DriveUnavailable(_) => StatusCode::CONFLICT,
            ControlError::InvalidOutputPath(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Metadata(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn list_drives(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.ctx.registry.list().await)
}

#[derive(Deserialize)]
struct DriveBody {
    path: String,
}

async fn eject_drive(
    State(state): State<WebState>,
    Json(body): Json<DriveBody>,
) -> ControlResult<StatusCode> {
    state.ctx.executor.eject_drive(&body.path).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct BlacklistBody {
    path: String,
    blacklisted: bool,
}

async fn blacklist_drive(
    State(state): State<WebState>,
    Json(body): Json<BlacklistBody>,
) -> ControlResult<StatusCode> {
    state.ctx.registry.set_blacklisted(&body.path, body.blacklisted).await?;
    if let Some(drive) = state.ctx.registry.get(&body.path).await {
        db::drives::upsert(
            &state.ctx.db,
            db::drives::DriveRecord {
                path: drive.path,
                model: drive.model,
                capability: drive.capability,
                blacklisted: drive.blacklisted,
            },
        )
        .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs(State(state): State<WebState>) -> impl IntoResponse {
    Json(state.ctx.store.list().await)
}

async fn get_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Json<Job>> {
    state
        .ctx
        .store
        .get(&id)
        .await
        .map(Json)
        .ok_or(ControlError::JobNotFound(id))
}

async fn delete_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<StatusCode> {
    state.ctx.executor.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Json<Job>> {
    Ok(Json(state.ctx.executor.pause(&id).await?))
}

async fn resume_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Json<Job>> {
    Ok(Json(state.ctx.executor.resume(&id).await?))
}

async fn cancel_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Json<Job>> {
    Ok(Json(state.ctx.executor.cancel(&id).await?))
}

async fn retry_job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Json<Job>> {
    Ok(Json(state.ctx.executor.retry(&id).await?))
}

async fn job_log(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Response> {
    let lines = state.ctx.store.full_log(&id).await?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        lines.join("\n"),
    )
        .into_response())
}

async fn get_output(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> ControlResult<Response> {
    let job = state
        .ctx
        .store
        .get(&id)
        .await
        .ok_or(ControlError::JobNotFound(id))?;

    let duplicate = (job.disc_type.is_rom() && !job.output_locked)
        .then(|| !job.output_claimed || job.output_path.exists());
    Ok(Json(json!({
        "output_path": job.output_path,
        "locked": job.output_locked,
        "duplicate": duplicate,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct OutputBody {
    path: PathBuf,
}

async fn set_output(
    State(state): State<WebState>,
    Path(id): Path<String>,
    Json(body): Json<OutputBody>,
) -> ControlResult<Json<Job>> {
    let job = state
        .ctx
        .store
        .get(&id)
        .await
        .ok_or(ControlError::JobNotFound(id.clone()))?;
    if job.output_locked {
        return Err(ControlError::OutputLocked);
    }

    state.ctx.resolver.validate_shape(job.disc_type, &body.path)?;
    if job.disc_type.is_rom() {
        let owned = job.output_claimed.then_some(job.output_path.as_path());
        state.ctx.resolver.reclaim(owned, &body.path)?;
    }
    state
        .ctx
        .store
        .set_output(&id, body.path, job.disc_type.is_rom())
        .await
        .map(Json)
}

#[derive(Deserialize)]
struct SearchQuery {
    query: String,
}

async fn search_metadata(
    State(state): State<WebState>,
    Query(q): Query<SearchQuery>,
) -> ControlResult<Response> {
    let provider = state
        .ctx
        .metadata
        .as_ref()
        .ok_or_else(|| ControlError::Metadata("no metadata provider configured".to_string()))?;
    let matches = provider.search(&q.query).await?;
    Ok(Json(matches).into_response())
}

#[derive(Deserialize)]
struct MetadataBody {
    imdb_id: String,
    season: Option<u32>,
}

/// Attach a matched title to a job. For video jobs whose output is not
/// yet locked, also refine the destination directory.
async fn apply_metadata(
    State(state): State<WebState>,
    Path(id): Path<String>,
    Json(body): Json<MetadataBody>,
) -> ControlResult<Json<Job>> {
    let provider = state
        .ctx
        .metadata
        .as_ref()
        .ok_or_else(|| ControlError::Metadata("no metadata provider configured".to_string()))?;
    let title = provider.lookup(&body.imdb_id).await?;

    let mut job = state
        .ctx
        .store
        .set_metadata(&id, &title.imdb_id, body.season)
        .await?;
    if job.disc_type.is_video() && !job.output_locked {
        let dir = refined_output_dir(&state.ctx.config.video_output_dir, &title, body.season);
        job = state.ctx.store.set_output(&id, dir, false).await?;
    }
    Ok(Json(job))
}
