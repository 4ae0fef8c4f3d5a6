//! Liveness and version endpoints

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;
use std::sync::Arc;

use crate::server::http::AppState;

/// GET /health - liveness probe
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let body = json!({
        "status": "ok",
        "authMode": state.auth.mode.to_string(),
        "sessions": state.sessions.count(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// GET /version - deployment verification
pub fn version_info() -> Response<Full<Bytes>> {
    let body = json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
