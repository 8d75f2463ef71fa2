//! Download submission and task read handlers.

use crate::api::AppState;
use crate::error::Error;
use crate::types::{DownloadRequest, DownloadResponse, ListenCondition, TaskId};
use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

/// POST /download - Start a download, or attach to an identical one
#[utoipa::path(
    post,
    path = "/download",
    tag = "tasks",
    request_body = DownloadRequest,
    responses(
        (status = 201, description = "A new task was started", body = DownloadResponse),
        (status = 200, description = "An identical task was already running or cached", body = DownloadResponse),
        (status = 400, description = "Invalid request", body = crate::error::ApiError)
    )
)]
pub async fn request_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    match state
        .tasks()
        .request_download(request, ListenCondition::DoNotListen)
        .await
    {
        Ok(submission) => {
            let task = &submission.task;
            let status = if submission.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            let body = DownloadResponse {
                id: task.id().clone(),
                created: submission.created,
                url: task.url().to_string(),
                args: task.args().to_vec(),
            };
            (status, Json(body)).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected download request");
            e.into_response()
        }
    }
}

/// GET /:task_id/info - Task snapshot
#[utoipa::path(
    get,
    path = "/{task_id}/info",
    tag = "tasks",
    params(
        ("task_id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task snapshot", body = crate::types::TaskInfo),
        (status = 404, description = "Unknown or expired task", body = crate::error::ApiError)
    )
)]
pub async fn get_task_info(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.tasks().task_info(&TaskId::from(task_id)).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /:task_id/logs - Task log lines
#[utoipa::path(
    get,
    path = "/{task_id}/logs",
    tag = "tasks",
    params(
        ("task_id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Log lines, oldest first", body = Vec<String>),
        (status = 404, description = "Unknown or expired task", body = crate::error::ApiError)
    )
)]
pub async fn get_task_logs(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.tasks().task_logs(&TaskId::from(task_id)).await {
        Ok(lines) => (StatusCode::OK, Json(lines)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /:task_id/download - Task output
#[utoipa::path(
    get,
    path = "/{task_id}/download",
    tag = "tasks",
    params(
        ("task_id" = String, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Output bytes with a guessed content type", content_type = "application/octet-stream"),
        (status = 404, description = "Unknown task or no output yet", body = crate::error::ApiError)
    )
)]
pub async fn get_task_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, Error> {
    let output = state.tasks().task_output(&TaskId::from(task_id)).await?;
    let content_type = output
        .mime_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], output.bytes).into_response())
}
