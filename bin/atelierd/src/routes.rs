use axum::routing::get;
use axum::{Json, Router};

/// Merge module routers under their name prefixes.
pub fn build_router(module_routes: Vec<(&str, Router)>) -> Router {
    let mut app = Router::new().route("/healthz", get(healthz));
    for (name, routes) in module_routes {
        app = app.nest(&format!("/{name}"), routes);
    }
    app
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
