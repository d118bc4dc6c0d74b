//! HTTP and WebSocket front door.
//!
//! Submissions go to the task queue, reads come from the queue's in-memory
//! map or the run index, and `/ws` streams hub events.

mod error;
mod handlers;
mod ws;

pub use error::{WebError, status_from_error};
pub use handlers::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::adapters::event_hub::EventHub;
use crate::ports::task_store::TaskStore;
use crate::queue::TaskQueue;

pub struct AppState {
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<EventHub>,
    pub store: Arc<dyn TaskStore>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health).fallback(handlers::method_not_allowed))
        .route(
            "/api/v1/backtest",
            post(handlers::submit_backtest).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/v1/sweep",
            post(handlers::submit_sweep).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/v1/tasks",
            get(handlers::list_tasks).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/v1/tasks/{id}",
            get(handlers::get_task).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/v1/runs",
            get(handlers::list_runs).fallback(handlers::method_not_allowed),
        )
        .route("/ws", get(ws::events))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
