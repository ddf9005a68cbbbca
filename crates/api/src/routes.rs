use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use taskhub_dispatcher::TaskHub;

use crate::handlers::{
    health::health_check,
    tasks::{cancel_task, get_task, get_task_events, list_tasks, reset_task, submit_task},
    workers::{get_worker, list_workers},
};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<TaskHub>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/tasks", get(list_tasks).post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/events", get(get_task_events))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/reset", post(reset_task))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/{id}", get(get_worker))
        .with_state(state)
}
