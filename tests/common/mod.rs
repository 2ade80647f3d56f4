//! Shared fixtures for the integration suites: a loopback HTTP server with
//! range support and fault injection, plus archive builders.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use sha2::{Digest, Sha256};

/// Loopback file server with byte-range support and fault injection.
///
/// Counters expose how many requests arrived and how many body bytes were
/// served, which the resume tests assert against.
pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

pub struct ServerState {
    /// Body served at any path.
    body: parking_lot::RwLock<Vec<u8>>,
    /// Ranges starting at or beyond this offset fail with 500.
    fail_from: AtomicU64,
    /// When set, every ranged request gets 416.
    always_416: std::sync::atomic::AtomicBool,
    pub requests: AtomicUsize,
    pub body_bytes_served: AtomicU64,
}

impl TestServer {
    pub async fn start(body: Vec<u8>) -> Self {
        let state = Arc::new(ServerState {
            body: parking_lot::RwLock::new(body),
            fail_from: AtomicU64::new(u64::MAX),
            always_416: std::sync::atomic::AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            body_bytes_served: AtomicU64::new(0),
        });

        let app = Router::new()
            .fallback(serve)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, file_name: &str) -> String {
        format!("http://{}/{}", self.addr, file_name)
    }

    pub fn set_body(&self, body: Vec<u8>) {
        *self.state.body.write() = body;
    }

    /// Fail every range starting at or beyond `offset` with HTTP 500.
    pub fn fail_from(&self, offset: u64) {
        self.state.fail_from.store(offset, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.state.fail_from.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn set_always_416(&self, on: bool) {
        self.state.always_416.store(on, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn body_bytes_served(&self) -> u64 {
        self.state.body_bytes_served.load(Ordering::SeqCst)
    }
}

async fn serve(
    State(state): State<Arc<ServerState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let body = state.body.read().clone();
    let total = body.len() as u64;

    if method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty())
            .unwrap();
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match range {
        Some((start, end)) => {
            if state.always_416.load(Ordering::SeqCst) {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            if start >= state.fail_from.load(Ordering::SeqCst) {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            if start >= total {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            let end = end.min(total - 1);
            let slice = body[start as usize..=end as usize].to_vec();
            state
                .body_bytes_served
                .fetch_add(slice.len() as u64, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .header(header::CONTENT_LENGTH, slice.len())
                .body(Body::from(slice))
                .unwrap()
        }
        None => {
            state.body_bytes_served.fetch_add(total, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, total)
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from(body))
                .unwrap()
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        u64::MAX
    } else {
        end.parse().ok()?
    };
    Some((start, end))
}

/// Build an in-memory `.tar.bz2` with the given entries.
pub fn build_tar_bz2(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Write a manifest file describing one model and load it into a registry.
pub fn manifest_json(
    model_id: &str,
    module_type: &str,
    url: &str,
    file_names: &[&str],
    file_hashes: &[&str],
) -> String {
    let names: Vec<String> = file_names.iter().map(|n| format!("\"{n}\"")).collect();
    let hashes: Vec<String> = file_hashes.iter().map(|h| format!("\"{h}\"")).collect();
    format!(
        r#"{{"models": [{{
            "modelId": "{model_id}",
            "moduleType": "{module_type}",
            "downloadUrl": "{url}",
            "modelFileNames": [{}],
            "modelFileHashes": [{}]
        }}]}}"#,
        names.join(", "),
        hashes.join(", ")
    )
}

/// Assert a file exists and hashes to the expected digest.
pub fn assert_file_hash(path: &Path, expected: &str) {
    let data = std::fs::read(path)
        .unwrap_or_else(|e| panic!("missing file {}: {e}", path.display()));
    assert_eq!(sha256_hex(&data), expected, "hash of {}", path.display());
}
