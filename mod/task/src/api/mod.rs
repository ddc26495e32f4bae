mod events;
mod tasks;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::engine::TaskEngine;

pub fn router(engine: Arc<TaskEngine>) -> Router {
    Router::new()
        .route("/tasks", post(tasks::submit).get(tasks::list))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/@start", post(tasks::start))
        .route("/tasks/{id}/@heartbeat", post(tasks::heartbeat))
        .route("/tasks/{id}/@progress", post(tasks::progress))
        .route("/tasks/{id}/@complete", post(tasks::complete))
        .route("/tasks/{id}/@fail", post(tasks::fail))
        .route("/tasks/{id}/@dismiss", post(tasks::dismiss))
        .route("/tasks/{id}/@complete-key", post(tasks::complete_key))
        .route("/events", get(events::stream))
        .with_state(engine)
}
