//! Thin HTTP front end: maps axum requests onto the structured
//! [`ApiRequest`](crate::api::ApiRequest) surface and renders
//! [`ApiResponse`](crate::api::ApiResponse) back out. No registry
//! semantics live here.
#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{ApiRequest, Method, QueryParams, Registry};

/// Build the router serving the whole registry surface.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

/// Serve until the process is told to stop.
pub async fn serve(registry: Arc<Registry>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "registry listening");
    axum::serve(listener, router(registry)).await
}

async fn dispatch(
    State(registry): State<Arc<Registry>>,
    method: axum::http::Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let method = match method {
        axum::http::Method::GET => Method::Get,
        axum::http::Method::PUT => Method::Put,
        axum::http::Method::PATCH => Method::Patch,
        axum::http::Method::POST => Method::Post,
        axum::http::Method::DELETE => Method::Delete,
        other => {
            return problem(
                StatusCode::METHOD_NOT_ALLOWED,
                &format!("method {other} is not supported"),
            )
        }
    };
    let params = match QueryParams::from_pairs(&query_pairs(uri.query().unwrap_or(""))) {
        Ok(params) => params,
        Err(err) => return problem(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let parsed_body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(err) => {
                return problem(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {err}"))
            }
        }
    };
    let request = ApiRequest {
        method,
        path: uri.path().trim_matches('/').to_string(),
        params,
        body: parsed_body,
    };
    // rusqlite blocks; keep the runtime workers free.
    let response =
        match tokio::task::spawn_blocking(move || registry.process(request)).await {
            Ok(response) => response,
            Err(err) => {
                return problem(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("request worker failed: {err}"),
                )
            }
        };
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match response.body {
        Some(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response(),
        None => status.into_response(),
    }
}

fn problem(status: StatusCode, title: &str) -> Response {
    let body = serde_json::json!({
        "type": "https://veridex.dev/errors#bad_request",
        "title": title,
        "status": status.as_u16(),
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Split and percent-decode a query string into key/value pairs, keeping
/// parameter repetition and order.
fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let hex = |b: u8| -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    };
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
