use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Query, State, WebSocketUpgrade,
        rejection::JsonRejection,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::history::PullResponse;
use super::job::JobSpec;
use super::runner::Runner;
use crate::error::{Error, Result, json_body};

pub fn router(runner: Arc<Runner>) -> Router {
    let code_limit = runner.config.max_code_size;
    Router::new()
        .route("/api/healthcheck", get(healthcheck))
        .route("/api/submit", post(submit))
        .route(
            "/api/upload_code",
            post(upload_code).layer(DefaultBodyLimit::max(code_limit)),
        )
        .route("/api/run", post(run))
        .route("/api/pull", get(pull))
        .route("/api/stop", post(stop))
        .route("/logs_ws", get(logs_ws))
        .with_state(runner)
}

pub async fn serve(runner: Arc<Runner>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "runner api listening");
    axum::serve(listener, router(runner))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

async fn healthcheck(State(runner): State<Arc<Runner>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dockhand-runner",
        "version": env!("CARGO_PKG_VERSION"),
        "state": runner.status().await,
    }))
}

async fn submit(
    State(runner): State<Arc<Runner>>,
    payload: std::result::Result<Json<JobSpec>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let spec = json_body(payload)?;
    runner.submit(spec).await?;
    Ok(Json(serde_json::json!({ "status": "submitted" })))
}

async fn upload_code(
    State(runner): State<Arc<Runner>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    runner.upload_code(&body).await?;
    Ok(Json(serde_json::json!({ "status": "stored", "bytes": body.len() })))
}

async fn run(State(runner): State<Arc<Runner>>) -> Result<Json<serde_json::Value>> {
    runner.run().await?;
    Ok(Json(serde_json::json!({ "status": "running" })))
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    #[serde(default)]
    timestamp: u64,
}

async fn pull(
    State(runner): State<Arc<Runner>>,
    Query(query): Query<PullQuery>,
) -> Json<PullResponse> {
    Json(runner.pull(query.timestamp).await)
}

async fn stop(State(runner): State<Arc<Runner>>) -> Result<Json<serde_json::Value>> {
    runner.stop().await?;
    Ok(Json(serde_json::json!({ "status": "stopping" })))
}

async fn logs_ws(State(runner): State<Arc<Runner>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_logs(socket, runner))
}

/// Pushes binary job-log chunks in append order from the start of history,
/// backing off briefly when caught up. The stream closes only once the
/// shared shutdown signal is set and every buffered chunk has been sent.
async fn stream_logs(mut socket: WebSocket, runner: Arc<Runner>) {
    let mut sent = 0usize;
    loop {
        let chunks = {
            runner
                .history
                .lock()
                .await
                .job_log_chunks_from(sent)
        };
        if chunks.is_empty() {
            if runner.shutdown.is_cancelled() {
                break;
            }
            tokio::time::sleep(runner.config.ws_poll_interval).await;
            continue;
        }
        for chunk in chunks {
            sent += 1;
            if socket.send(Message::Binary(chunk.into())).await.is_err() {
                // The client went away mid-stream; the supervisor's bounded
                // drain wait covers this.
                debug!("websocket client disconnected before draining");
                return;
            }
        }
    }
    runner.ws_drained.set_once();
    let _ = socket.send(Message::Close(None)).await;
}
