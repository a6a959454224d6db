use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;

use super::shim::Shim;
use super::types::{SubmitTaskRequest, TaskInfo, TaskSummary, TerminateTaskRequest};
use crate::error::{Error, Result, json_body};

pub fn router(shim: Arc<Shim>) -> Router {
    Router::new()
        .route("/api/healthcheck", get(healthcheck))
        .route("/api/tasks", get(task_list).post(submit_task))
        .route("/api/tasks/{id}", get(task_info))
        .route("/api/tasks/{id}/terminate", post(terminate_task))
        .route("/api/tasks/{id}/remove", post(remove_task))
        .with_state(shim)
}

pub async fn serve(shim: Arc<Shim>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "shim api listening");
    axum::serve(listener, router(shim))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

async fn healthcheck(State(shim): State<Arc<Shim>>) -> Json<super::types::HealthcheckResponse> {
    Json(shim.healthcheck().await)
}

async fn task_list(State(shim): State<Arc<Shim>>) -> Json<Vec<TaskSummary>> {
    let tasks = shim.storage.list().await;
    Json(tasks.iter().map(TaskSummary::from).collect())
}

async fn task_info(
    State(shim): State<Arc<Shim>>,
    Path(id): Path<String>,
) -> Result<Json<TaskInfo>> {
    let task = shim.storage.get(&id).await.ok_or(Error::NotFound)?;
    Ok(Json(TaskInfo::from(&task)))
}

/// Responds once the task is registered and its resources reserved; the
/// image pull and container run happen in a detached unit of work so the
/// handler never blocks on them.
async fn submit_task(
    State(shim): State<Arc<Shim>>,
    payload: std::result::Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<Json<TaskInfo>> {
    let request = json_body(payload)?;
    let config = request.into_config()?;
    let task = shim.submit(config).await?;
    shim.spawn_run(&task.id).await;
    Ok(Json(TaskInfo::from(&task)))
}

async fn terminate_task(
    State(shim): State<Arc<Shim>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<TerminateTaskRequest>, JsonRejection>,
) -> Result<Json<TaskInfo>> {
    let request = json_body(payload)?;
    shim.terminate(
        &id,
        request.timeout,
        request.termination_reason,
        request.termination_message,
    )
    .await?;
    let task = shim.storage.get(&id).await.ok_or(Error::NotFound)?;
    Ok(Json(TaskInfo::from(&task)))
}

async fn remove_task(
    State(shim): State<Arc<Shim>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    shim.remove(&id).await?;
    Ok(Json(serde_json::json!({ "id": id, "removed": true })))
}
