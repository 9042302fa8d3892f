//! The proxy surface: manifest interception plus blind forwarding to the
//! single upstream registry.
//!
//! `HEAD`/`PUT` on a manifest URL record an access in the usage index
//! before the request is forwarded, so even a pull that later fails
//! upstream counts as intent. Write-like methods pass through the
//! maintenance gate and are refused with `503` while cleanup holds it;
//! reads never touch the gate.

use std::sync::LazyLock;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use tagkeep_core::TagEntry;
use tagkeep_index::UsageIndex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use crate::gate::MaintenanceGate;

/// Repo is everything between `/v2/` and the last `/manifests/`; the tag
/// is the final segment and may not contain `/`.
static MANIFEST_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v2/(.+)/manifests/([^/]+)$").unwrap());

const STRIPPED_FORWARD_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-real-ip",
];

#[derive(Clone)]
pub struct ProxyState {
    pub upstream: reqwest::Url,
    pub client: reqwest::Client,
    pub index: UsageIndex,
    pub gate: MaintenanceGate,
    pub use_forwarded_headers: bool,
    pub tls_enabled: bool,
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(handle)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn handle(State(state): State<ProxyState>, req: Request) -> Response {
    debug!("{} {}", req.method(), req.uri());

    let read_like = req.method() == Method::GET || req.method() == Method::HEAD;
    let permit = if read_like {
        None
    } else {
        match state.gate.try_write() {
            Some(permit) => Some(permit),
            None => {
                info!("{} {} refused, maintenance in progress", req.method(), req.uri().path());
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    };

    track_manifest_access(&state, req.method(), req.uri().path()).await;

    match forward(&state, req, permit).await {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "upstream forward failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Records a pull (`HEAD`) or push (`PUT`) of a manifest. Index failures
/// are logged and the request is still forwarded; the next observation
/// repairs the entry.
async fn track_manifest_access(state: &ProxyState, method: &Method, path: &str) {
    if method != Method::HEAD && method != Method::PUT {
        return;
    }
    let Some(caps) = MANIFEST_PATH.captures(path) else {
        return;
    };
    let entry = TagEntry::new(&caps[1], &caps[2], Utc::now());
    if *method == Method::HEAD {
        info!("pulling {entry}");
    } else {
        info!("pushing {entry}");
    }
    if let Err(err) = state.index.observe(&entry).await {
        warn!(%err, "failed to record access for {entry}");
    }
}

async fn forward(
    state: &ProxyState,
    req: Request,
    permit: Option<OwnedSemaphorePermit>,
) -> anyhow::Result<Response> {
    let (mut parts, body) = req.into_parts();
    // Inbound framing headers decide whether a body exists; they go away
    // in the rewrite because the upstream client re-frames the stream.
    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);
    rewrite_headers(
        &mut parts.headers,
        state.use_forwarded_headers,
        state.tls_enabled,
    );

    let mut url = state.upstream.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut upstream_req = state
        .client
        .request(parts.method, url)
        .headers(parts.headers);
    if has_body {
        upstream_req = upstream_req.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let upstream_resp = upstream_req.send().await?;

    let status = upstream_resp.status();
    let mut headers = upstream_resp.headers().clone();
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);

    // The write permit rides the body stream so it is released when the
    // response has been fully delivered, not when this handler returns.
    let body_stream = upstream_resp.bytes_stream().map(move |chunk| {
        let _held = &permit;
        chunk
    });
    Ok((status, headers, Body::from_stream(body_stream)).into_response())
}

/// Applies the forwarding header policy before handing the request to the
/// upstream client.
fn rewrite_headers(headers: &mut HeaderMap, use_forwarded_headers: bool, tls_enabled: bool) {
    if !use_forwarded_headers {
        for name in STRIPPED_FORWARD_HEADERS {
            headers.remove(name);
        }
    }
    if !headers.contains_key("x-forwarded-proto") {
        let proto = if tls_enabled { "https" } else { "http" };
        headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
    }
    // The upstream client derives these from the target URL and the
    // actual body framing.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
}
