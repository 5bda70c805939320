//! The monitor HTTP surface, per SPEC_FULL.md §7 [AMBIENT]: a read-only
//! dashboard over `ApplicationState`, generalizing
//! `examples/original_source/src/status.py`'s Flask `/`, `/status` routes
//! into an axum router, with the HTML rendered through askama rather than
//! hand-built string templates.

use std::sync::Arc;

use askama::Template;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::mr::coordinator::Coordinator;
use crate::mr::status::MasterRow;

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    phase: &'static str,
    elapsed_secs: u64,
    avg_mb_per_sec: String,
    faults: u64,
    map_assigned: u64,
    map_completed: u64,
    reduce_assigned: u64,
    reduce_completed: u64,
    masters: Vec<MasterRow>,
    last_log: Vec<String>,
}

pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/status", get(status_json))
        .route("/favicon.ico", get(favicon))
        .route("/masters/:nick/degree", post(change_degree))
        .with_state(Arc::new(coordinator))
}

async fn dashboard(State(coordinator): State<Arc<Coordinator>>) -> Response {
    let snapshot = coordinator.snapshot().await;

    let phase = snapshot["phase"].as_str().unwrap_or("Map");
    let phase: &'static str = match phase {
        "Reduce" => "Reduce",
        "Merge" => "Merge",
        _ => "Map",
    };

    let masters: Vec<MasterRow> = snapshot["masters"]
        .as_object()
        .map(|obj| obj.values().filter_map(|v| serde_json::from_value(v.clone()).ok()).collect())
        .unwrap_or_default();

    let last_log: Vec<String> = snapshot["last_log"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let template = DashboardTemplate {
        phase,
        elapsed_secs: snapshot["elapsed_secs"].as_u64().unwrap_or(0),
        avg_mb_per_sec: format!("{:.2}", snapshot["average_mb_per_sec"].as_f64().unwrap_or(0.0)),
        faults: snapshot["faults"].as_u64().unwrap_or(0),
        map_assigned: snapshot["map"]["assigned"].as_u64().unwrap_or(0),
        map_completed: snapshot["map"]["completed"].as_u64().unwrap_or(0),
        reduce_assigned: snapshot["reduce"]["assigned"].as_u64().unwrap_or(0),
        reduce_completed: snapshot["reduce"]["completed"].as_u64().unwrap_or(0),
        masters,
        last_log,
    };

    match template.render() {
        Ok(body) => Html(body).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("template error: {err}")).into_response(),
    }
}

async fn status_json(State(coordinator): State<Arc<Coordinator>>) -> Json<serde_json::Value> {
    Json(coordinator.snapshot().await)
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct DegreeChangeQuery {
    /// Negative shrinks the pool, positive is accepted but ignored: spec.md
    /// §4.6 scale-up is a no-op on the Master side.
    delta: i32,
}

/// Admin trigger for a parallelism-degree change, replacing the original's
/// out-of-band `change-degree` wire message with an HTTP action on the same
/// surface operators already use to watch the run.
async fn change_degree(
    State(coordinator): State<Arc<Coordinator>>,
    Path(nick): Path<String>,
    Query(query): Query<DegreeChangeQuery>,
) -> StatusCode {
    if coordinator.request_degree_change(&nick, query.delta).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}
