//! HTTP request handlers for the web adapter.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::domain::run_index::{RunFilter, RunIndex};
use crate::domain::task::{RunRequest, Task, TaskKind, TaskStatus};
use crate::domain::task_id::TaskId;
use crate::queue::TaskFilter;

use super::{AppState, WebError};

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "message": "ok" }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub ok: bool,
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// An empty body means every field takes its default.
fn parse_request(body: &Bytes) -> Result<RunRequest, WebError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| WebError::bad_request(format!("invalid request body: {e}")))
}

async fn submit(state: &AppState, kind: TaskKind, body: &Bytes) -> Result<Json<TaskAccepted>, WebError> {
    let request = parse_request(body)?;
    let task = state.queue.enqueue(kind, request).await;
    Ok(Json(TaskAccepted {
        ok: true,
        task_id: task.id,
        status: task.status,
    }))
}

pub async fn submit_backtest(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TaskAccepted>, WebError> {
    submit(&state, TaskKind::Backtest, &body).await
}

pub async fn submit_sweep(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TaskAccepted>, WebError> {
    submit(&state, TaskKind::Sweep, &body).await
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, WebError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(WebError::bad_request("missing task id"));
    }
    state
        .queue
        .get(&TaskId::from(id))
        .map(Json)
        .ok_or_else(|| WebError::not_found("task not found"))
}

#[derive(Debug, Default, Deserialize)]
pub struct TasksQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub limit: Option<String>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Value>, WebError> {
    let status = match RunFilter::non_empty(query.status) {
        Some(raw) => Some(
            TaskStatus::parse(&raw)
                .ok_or_else(|| WebError::bad_request(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        status,
        task_type: RunFilter::non_empty(query.task_type),
        limit: query
            .limit
            .as_deref()
            .and_then(|v| v.trim().parse::<usize>().ok()),
    };
    let tasks = state.queue.list(&filter);
    Ok(Json(json!({ "ok": true, "tasks": tasks })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<String>,
    pub task_id: Option<String>,
    pub symbol: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunsResponse {
    pub ok: bool,
    pub runs: Vec<RunIndex>,
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsResponse>, WebError> {
    let filter = RunFilter {
        limit: RunFilter::parse_limit(query.limit.as_deref()),
        task_id: RunFilter::non_empty(query.task_id),
        symbol: RunFilter::non_empty(query.symbol),
        from: RunFilter::non_empty(query.from),
        to: RunFilter::non_empty(query.to),
    };
    let runs = state.store.list_runs(&filter)?;
    Ok(Json(RunsResponse { ok: true, runs }))
}

pub async fn method_not_allowed() -> WebError {
    WebError::new(
        axum::http::StatusCode::METHOD_NOT_ALLOWED,
        "method not allowed",
    )
}

pub async fn not_found() -> WebError {
    WebError::not_found("no such route")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_body_is_default_request() {
        let parsed = parse_request(&Bytes::from_static(b"  \n")).unwrap();
        assert_eq!(parsed, RunRequest::default());
    }

    #[test]
    fn unknown_field_is_bad_request() {
        let err = parse_request(&Bytes::from_static(br#"{"cfg":"x"}"#)).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn body_fields_are_read() {
        let parsed = parse_request(&Bytes::from_static(br#"{"config":"a.yml","top_n":4}"#)).unwrap();
        assert_eq!(parsed.config, "a.yml");
        assert_eq!(parsed.top_n, Some(4));
    }
}
