//! Administrative control plane.
//!
//! Resources hang off `/{service}/{version}/…`; today that is host telemetry
//! under `servers/{hostname}` plus a liveness probe. Anything outside the
//! service/version shape is a bad request, unknown resources are 404 and
//! methods the resource does not speak answer 406.

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use serde_json::{Map, Value, json};

use scribe_core::sysinfo;

#[derive(Clone)]
pub struct ControlState {
    pub service: String,
    pub version: String,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/{service}/{version}/{resource}", any(resource_root))
        .route("/{service}/{version}/{resource}/{id}", any(resource_item))
        .fallback(bad_request)
        .with_state(state)
}

fn error_body(message: &str, detail: &str) -> Json<Value> {
    Json(json!({ "message": message, "detail": detail }))
}

async fn bad_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        error_body("Bad Request", "malformed request path"),
    )
        .into_response()
}

async fn resource_root(
    State(state): State<ControlState>,
    Path((service, version, resource)): Path<(String, String, String)>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    dispatch(&state, &service, &version, &resource, None, method, &params).await
}

async fn resource_item(
    State(state): State<ControlState>,
    Path((service, version, resource, id)): Path<(String, String, String, String)>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    dispatch(&state, &service, &version, &resource, Some(&id), method, &params).await
}

async fn dispatch(
    state: &ControlState,
    service: &str,
    version: &str,
    resource: &str,
    id: Option<&str>,
    method: Method,
    params: &HashMap<String, String>,
) -> Response {
    if service != state.service {
        return (
            StatusCode::BAD_REQUEST,
            error_body("Bad Request", "unsupported service"),
        )
            .into_response();
    }
    if version != state.version {
        return (
            StatusCode::BAD_REQUEST,
            error_body("Bad Request", "unsupported version"),
        )
            .into_response();
    }

    match resource {
        "servers" => servers(id, method, params).await,
        // Reserved resource; nothing is served from it yet.
        "waves" => (
            StatusCode::METHOD_NOT_ALLOWED,
            error_body("Method Not Allowed", "waves is reserved"),
        )
            .into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            error_body("Not Found", "unknown resource"),
        )
            .into_response(),
    }
}

async fn servers(id: Option<&str>, method: Method, params: &HashMap<String, String>) -> Response {
    let Some(id) = id else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("Bad Request", "cannot find server name"),
        )
            .into_response();
    };
    if method != Method::GET {
        return (
            StatusCode::NOT_ACCEPTABLE,
            error_body("Not Acceptable", "method is not allowed"),
        )
            .into_response();
    }

    // The id must name this host; telemetry for other machines lives there.
    let local = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    if id != local {
        tracing::warn!(requested = id, local = %local, "hostname mismatch");
        return (
            StatusCode::BAD_REQUEST,
            error_body("Bad Request", "hostname mismatch"),
        )
            .into_response();
    }

    let baseline = params
        .get("v")
        .and_then(|v| sysinfo::parse_traffic_baseline(v));

    let mut body = Map::new();
    match params.get("q").map(String::as_str) {
        None => {
            body.insert("cpu".into(), sysinfo::cpu_info());
            body.insert("memory".into(), sysinfo::memory_info());
            body.insert("disk".into(), sysinfo::disk_info());
            body.insert("network".into(), sysinfo::network_info(baseline));
        }
        Some("cpu") => {
            body.insert("cpu".into(), sysinfo::cpu_info());
        }
        Some("memory") => {
            body.insert("memory".into(), sysinfo::memory_info());
        }
        Some("disk") => {
            body.insert("disk".into(), sysinfo::disk_info());
        }
        Some("network") => {
            body.insert("network".into(), sysinfo::network_info(baseline));
        }
        Some(_) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("Bad Request", "unknown query"),
            )
                .into_response();
        }
    }

    Json(Value::Object(body)).into_response()
}
