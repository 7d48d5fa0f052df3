use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use conveyor_core::error::CoreError;
use conveyor_core::job::Job;
use conveyor_core::job_events::{MSG_TYPE_JOB_STATUS, MSG_TYPE_STREAM_END, MSG_TYPE_STREAM_ERROR};
use conveyor_core::types::JobId;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Interval between keep-alive pings (in seconds).
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// GET /api/v1/jobs/{id}/ws
///
/// Unknown ids are rejected with 404 before the upgrade. After the upgrade
/// every distinct snapshot is sent as `{"type": "job_status", "data": job}`,
/// followed by `{"type": "stream_end"}` after the terminal one.
pub async fn status_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    state.status.get_status(job_id).await?;

    let snapshots = state.status.stream_status(job_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, job_id, snapshots)))
}

/// Forward snapshots to the client until the stream ends or the client
/// goes away.
async fn handle_socket(
    socket: WebSocket,
    job_id: JobId,
    snapshots: impl Stream<Item = Result<Job, CoreError>> + Send + 'static,
) {
    tracing::info!(job_id = %job_id, "Status stream connected");

    let (mut sink, mut inbound) = socket.split();
    let mut snapshots = std::pin::pin!(snapshots);

    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.tick().await;

    let last_frame = loop {
        tokio::select! {
            item = snapshots.next() => match item {
                Some(Ok(job)) => {
                    if sink.send(frame(json!({"type": MSG_TYPE_JOB_STATUS, "data": job}))).await.is_err() {
                        tracing::debug!(job_id = %job_id, "Status stream sink closed");
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Status stream failed");
                    let (_, code, message) = AppError::from(e).parts();
                    break Some(json!({"type": MSG_TYPE_STREAM_ERROR, "error": message, "code": code}));
                }
                None => break Some(json!({"type": MSG_TYPE_STREAM_END})),
            },
            msg = inbound.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(job_id = %job_id, "Pong received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(job_id = %job_id, error = %e, "WebSocket receive error");
                    break None;
                }
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    };

    if let Some(last) = last_frame {
        let _ = sink.send(frame(last)).await;
        let _ = sink.send(Message::Close(None)).await;
    }
    tracing::info!(job_id = %job_id, "Status stream closed");
}

fn frame(value: serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}
