use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::payload::Payload;
use crate::transport::StopFlag;

/// Served when `/download` gets no usable `size`.
pub const DEFAULT_DOWNLOAD: u64 = 10 * 1024 * 1024 * 1024;

const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
const ALLOWED_METHODS: &str = "OPTIONS, GET, POST";

pub fn banner() -> String {
    format!("hello qospeedtest-server {}\n", env!("CARGO_PKG_VERSION"))
}

/// All endpoints. `stop` ends in-flight download bodies on shutdown.
pub fn router(stop: StopFlag) -> Router {
    Router::new()
        .route("/hello", get(hello).options(preflight))
        .route("/download", get(download).options(preflight))
        .route("/upload", post(upload).options(preflight))
        .fallback(fallback)
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(log_request))
        .with_state(stop)
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

fn status_page(status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or("Error");
    text(status, format!("{reason}\n"))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let response = next.run(request).await;
    debug!(?peer, %method, %path, status = response.status().as_u16(), "Request");
    response
}

async fn hello() -> Response {
    text(StatusCode::OK, banner())
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    size: Option<String>,
}

fn download_size(params: &DownloadParams) -> u64 {
    params
        .size
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_DOWNLOAD)
}

/// Payload chunks that turn into an error once `stop` is raised.
fn payload_stream(size: u64, stop: StopFlag) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::iter(Payload::new(size)).map(move |chunk| {
        if stop.load(Ordering::Relaxed) {
            Err(io::Error::other("server shutting down"))
        } else {
            Ok(chunk)
        }
    })
}

async fn download(State(stop): State<StopFlag>, Query(params): Query<DownloadParams>) -> Response {
    let size = download_size(&params);
    debug!(size, "Serving download");
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (header::CONTENT_LENGTH, HeaderValue::from(size)),
        ],
        Body::from_stream(payload_stream(size, stop)),
    )
        .into_response()
}

/// Counts the body without buffering it. Bodies without a declared length
/// (chunked transfer) are refused.
async fn upload(request: Request) -> Response {
    if !request.headers().contains_key(header::CONTENT_LENGTH) {
        return status_page(StatusCode::BAD_REQUEST);
    }
    let mut chunks = request.into_body().into_data_stream();
    let mut size: u64 = 0;
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => size += chunk.len() as u64,
            Err(e) => {
                warn!(error = %e, received = size, "Upload body failed");
                return status_page(StatusCode::BAD_REQUEST);
            }
        }
    }
    debug!(size, "Upload received");
    text(StatusCode::OK, format!("size={size}\n"))
}

async fn preflight(headers: HeaderMap) -> Response {
    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    out.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    if let Some(origin) = headers.get(header::ORIGIN) {
        out.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        out.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    if let Some(requested) = headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        out.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    response
}

/// `OPTIONS *` and unknown paths land here.
async fn fallback(method: Method, headers: HeaderMap) -> Response {
    if method == Method::OPTIONS {
        preflight(headers).await
    } else {
        status_page(StatusCode::NOT_FOUND)
    }
}
