//! WebDAV frontend.
//!
//! A single fallback handler dispatches on the raw request method, since
//! PROPFIND/MKCOL/MOVE are not part of axum's standard method routing.
//! Directories are virtual: they exist exactly when some manifest lives
//! beneath them, MKCOL always succeeds, and MOVE rewrites manifests only
//! (chunk objects are opaque keys and never move).

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use rpool_core::types::{normalize_path, split_file_path, FileSummary, Manifest};
use rpool_core::config::AuthMethod;
use rpool_core::PoolResult;
use rpool_engine::PoolEngine;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;

#[derive(Clone)]
pub struct DavState {
    pub engine: Arc<PoolEngine>,
    pub auth: Arc<AuthManager>,
}

pub fn router(state: DavState) -> Router {
    Router::<DavState>::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<DavState>, req: Request<Body>) -> Response {
    if state.auth.verify(req.headers()).is_none() {
        return unauthorized(state.auth.method());
    }
    let method = req.method().as_str().to_ascii_uppercase();
    let path = request_path(&req);
    let result = match method.as_str() {
        "OPTIONS" => Ok(options_response()),
        "HEAD" => head(&state, &path).await,
        "GET" => get(&state, &path, req.headers()).await,
        "PUT" => put(&state, &path, req).await,
        "DELETE" => delete(&state, &path).await,
        "MKCOL" => Ok(empty_status(StatusCode::CREATED)),
        "MOVE" => move_file(&state, &path, req.headers()).await,
        "PROPFIND" => propfind(&state, &path, req.headers()).await,
        _ => Ok(empty_status(StatusCode::METHOD_NOT_ALLOWED)),
    };
    match result {
        Ok(response) => response,
        Err(e) if e.is_not_found() => empty_status(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(method = %method, error = %e, "webdav request failed");
            empty_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn unauthorized(method: AuthMethod) -> Response {
    let mut response = empty_status(StatusCode::UNAUTHORIZED);
    if method == AuthMethod::Basic {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            header::HeaderValue::from_static("Basic realm=\"rpool\""),
        );
    }
    response
}

fn empty_status(status: StatusCode) -> Response {
    (status, [(header::CONTENT_LENGTH, "0")], Body::empty()).into_response()
}

fn options_response() -> Response {
    (
        StatusCode::OK,
        [
            (
                header::ALLOW,
                "OPTIONS, GET, HEAD, PUT, DELETE, PROPFIND, MKCOL, MOVE",
            ),
            (header::HeaderName::from_static("dav"), "1, 2"),
            (header::HeaderName::from_static("ms-author-via"), "DAV"),
            (header::CONTENT_LENGTH, "0"),
        ],
    )
        .into_response()
}

fn request_path(req: &Request<Body>) -> String {
    normalize_path(&percent_decode(req.uri().path()))
}

// ─── GET / HEAD ────────────────────────────────────────────────────────

async fn head(state: &DavState, path: &str) -> PoolResult<Response> {
    if let Some(manifest) = state.engine.load_manifest(path).await? {
        let mut response = empty_status(StatusCode::OK);
        file_headers(response.headers_mut(), &manifest);
        return Ok(response);
    }
    if directory_exists(&state.engine, path).await? {
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "httpd/unix-directory")],
        )
            .into_response());
    }
    Ok(empty_status(StatusCode::NOT_FOUND))
}

async fn get(state: &DavState, path: &str, headers: &HeaderMap) -> PoolResult<Response> {
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let Some(manifest) = state.engine.load_manifest(path).await? else {
        if directory_exists(&state.engine, path).await? {
            return directory_listing(state, path).await;
        }
        return Ok(empty_status(StatusCode::NOT_FOUND));
    };

    if let Some(range) = range_header {
        return ranged_get(state, &manifest, &range).await;
    }

    // full download: stream chunks in index order, stop quietly if the
    // client goes away
    let mut chunks = manifest.chunks.clone();
    chunks.sort_by_key(|c| c.index);
    let engine = state.engine.clone();
    let stream = futures::stream::iter(chunks.into_iter())
        .then(move |chunk| {
            let engine = engine.clone();
            async move {
                engine.read_chunk(&chunk).await.map_err(|e| {
                    tracing::error!(chunk = chunk.index, error = %e, "chunk read failed mid-stream");
                    std::io::Error::other(e)
                })
            }
        });

    let mut response = Response::new(Body::from_stream(stream));
    file_headers(response.headers_mut(), &manifest);
    Ok(response)
}

async fn ranged_get(state: &DavState, manifest: &Manifest, range: &str) -> PoolResult<Response> {
    let size = manifest.file_size;
    let Some((start, end)) = parse_range(range, size) else {
        return Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{size}"))],
        )
            .into_response());
    };
    let length = end - start + 1;
    let body = state
        .engine
        .download_range(&manifest.file_path, start, length)
        .await?;
    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{size}"),
            ),
            (header::CONTENT_LENGTH, body.len().to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                header::CONTENT_TYPE,
                guess_content_type(&manifest.file_name).to_string(),
            ),
        ],
        Body::from(body),
    )
        .into_response())
}

/// `bytes=a-b`, `bytes=a-`, `bytes=-n`; end clamped to `size - 1`.
/// `None` means 416.
fn parse_range(header: &str, size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?.trim();
    if size == 0 {
        return None;
    }
    let (start, end) = if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        if n == 0 {
            return None;
        }
        (size.saturating_sub(n), size - 1)
    } else if let Some(prefix) = spec.strip_suffix('-') {
        (prefix.parse().ok()?, size - 1)
    } else {
        let (a, b) = spec.split_once('-')?;
        (a.parse().ok()?, b.parse().ok()?)
    };
    let end = end.min(size - 1);
    if start >= size || start > end {
        return None;
    }
    Some((start, end))
}

fn file_headers(headers: &mut HeaderMap, manifest: &Manifest) {
    headers.insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from(manifest.file_size),
    );
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(guess_content_type(&manifest.file_name)),
    );
    headers.insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
    if let Ok(value) = header::HeaderValue::from_str(&http_date(manifest.created_at)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

// ─── PUT ───────────────────────────────────────────────────────────────

async fn put(state: &DavState, path: &str, req: Request<Body>) -> PoolResult<Response> {
    if req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_none()
    {
        return Ok(empty_status(StatusCode::LENGTH_REQUIRED));
    }
    tracing::info!(path = %path, "webdav PUT");

    let temp_dir = state.engine.config().temp_dir.clone();
    tokio::fs::create_dir_all(&temp_dir).await?;
    let temp_path = temp_dir.join(format!("webdav_upload_{}.tmp", uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut body = req.into_body().into_data_stream();
        while let Some(piece) = body.next().await {
            let piece: Bytes = piece.map_err(|e| {
                rpool_core::PoolError::Other(anyhow::anyhow!("body read: {e}"))
            })?;
            file.write_all(&piece).await?;
        }
        file.flush().await?;
        drop(file);
        state
            .engine
            .upload(&temp_path, path, &CancellationToken::new())
            .await
    }
    .await;
    let _ = tokio::fs::remove_file(&temp_path).await;

    result.map(|_| empty_status(StatusCode::CREATED))
}

// ─── DELETE / MOVE ─────────────────────────────────────────────────────

async fn delete(state: &DavState, path: &str) -> PoolResult<Response> {
    tracing::info!(path = %path, "webdav DELETE");
    match state.engine.delete(path).await {
        Ok(()) => Ok(empty_status(StatusCode::NO_CONTENT)),
        Err(e) if e.is_not_found() => Ok(empty_status(StatusCode::NOT_FOUND)),
        Err(e) => Err(e),
    }
}

async fn move_file(state: &DavState, src: &str, headers: &HeaderMap) -> PoolResult<Response> {
    let Some(destination) = headers.get("destination").and_then(|v| v.to_str().ok()) else {
        return Ok(empty_status(StatusCode::BAD_REQUEST));
    };
    let dst = normalize_path(&percent_decode(strip_scheme_host(destination)));
    tracing::info!(src = %src, dst = %dst, "webdav MOVE");
    match state.engine.rename(src, &dst).await {
        Ok(()) => Ok(empty_status(StatusCode::CREATED)),
        Err(e) if e.is_not_found() => Ok(empty_status(StatusCode::NOT_FOUND)),
        Err(e) => Err(e),
    }
}

/// `http://host:port/a/b` -> `/a/b`; already-relative values pass through.
fn strip_scheme_host(destination: &str) -> &str {
    match destination.find("://") {
        Some(idx) => {
            let rest = &destination[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => destination,
    }
}

// ─── PROPFIND ──────────────────────────────────────────────────────────

struct PropEntry {
    href: String,
    is_dir: bool,
    size: u64,
    modified: f64,
    content_type: String,
}

impl PropEntry {
    fn dir(path: &str) -> Self {
        PropEntry {
            href: if path == "/" {
                "/".to_string()
            } else {
                format!("{}/", percent_encode_path(path))
            },
            is_dir: true,
            size: 0,
            modified: rpool_core::types::unix_now(),
            content_type: String::new(),
        }
    }

    fn file(summary: &FileSummary) -> Self {
        PropEntry {
            href: percent_encode_path(&summary.path),
            is_dir: false,
            size: summary.size,
            modified: summary.created_at,
            content_type: guess_content_type(&summary.name).to_string(),
        }
    }
}

async fn propfind(state: &DavState, path: &str, headers: &HeaderMap) -> PoolResult<Response> {
    let depth = headers
        .get("depth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("1")
        .to_string();

    let mut entries = Vec::new();
    if let Some(manifest) = state.engine.load_manifest(path).await? {
        entries.push(PropEntry::file(&FileSummary::from(&manifest)));
    } else if directory_exists(&state.engine, path).await? {
        entries.push(PropEntry::dir(path));
        if depth != "0" {
            let (files, subdirs) = directory_entries(&state.engine, path).await?;
            for dir in subdirs {
                entries.push(PropEntry::dir(&dir));
            }
            for file in &files {
                entries.push(PropEntry::file(file));
            }
        }
    } else {
        return Ok(empty_status(StatusCode::NOT_FOUND));
    }

    let xml = build_multistatus(&entries);
    Ok((
        StatusCode::MULTI_STATUS,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        xml,
    )
        .into_response())
}

fn build_multistatus(entries: &[PropEntry]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str("<D:multistatus xmlns:D=\"DAV:\">\n");
    for entry in entries {
        xml.push_str("  <D:response>\n");
        xml.push_str(&format!("    <D:href>{}</D:href>\n", xml_escape(&entry.href)));
        xml.push_str("    <D:propstat>\n      <D:prop>\n");
        if entry.is_dir {
            xml.push_str("        <D:resourcetype><D:collection/></D:resourcetype>\n");
        } else {
            xml.push_str("        <D:resourcetype/>\n");
            xml.push_str(&format!(
                "        <D:getcontentlength>{}</D:getcontentlength>\n",
                entry.size
            ));
            xml.push_str(&format!(
                "        <D:getcontenttype>{}</D:getcontenttype>\n",
                xml_escape(&entry.content_type)
            ));
        }
        xml.push_str(&format!(
            "        <D:getlastmodified>{}</D:getlastmodified>\n",
            http_date(entry.modified)
        ));
        xml.push_str("      </D:prop>\n      <D:status>HTTP/1.1 200 OK</D:status>\n");
        xml.push_str("    </D:propstat>\n  </D:response>\n");
    }
    xml.push_str("</D:multistatus>\n");
    xml
}

// ─── Directory helpers ─────────────────────────────────────────────────

async fn directory_exists(engine: &PoolEngine, path: &str) -> PoolResult<bool> {
    if path == "/" {
        return Ok(true);
    }
    Ok(!engine.list(path, true).await?.is_empty())
}

/// Files directly inside `dir`, plus the immediate subdirectories implied
/// by deeper files.
async fn directory_entries(
    engine: &PoolEngine,
    dir: &str,
) -> PoolResult<(Vec<FileSummary>, Vec<String>)> {
    let all = engine.list(dir, true).await?;
    let mut files = Vec::new();
    let mut subdirs = BTreeSet::new();
    let prefix = if dir == "/" { String::new() } else { dir.to_string() };
    for summary in all {
        let (parent, _) = split_file_path(&summary.path);
        if parent == normalize_path(dir) {
            files.push(summary);
        } else if let Some(rest) = summary.path.strip_prefix(&format!("{prefix}/")) {
            if let Some((first, _)) = rest.split_once('/') {
                subdirs.insert(format!("{prefix}/{first}"));
            }
        }
    }
    Ok((files, subdirs.into_iter().collect()))
}

async fn directory_listing(state: &DavState, path: &str) -> PoolResult<Response> {
    let (files, subdirs) = directory_entries(&state.engine, path).await?;
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>rpool — {path}</title></head>\n<body>\n<h2>rpool — {path}</h2>\n<table>\n<tr><th>Name</th><th>Size</th><th>Chunks</th><th>Remotes</th></tr>\n"
    );
    if path != "/" {
        let parent = split_file_path(path).0;
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">..</a></td><td></td><td></td><td></td></tr>\n",
            percent_encode_path(&parent)
        ));
    }
    for dir in &subdirs {
        html.push_str(&format!(
            "<tr><td><a href=\"{}/\">{}/</a></td><td></td><td></td><td></td></tr>\n",
            percent_encode_path(dir),
            xml_escape(&split_file_path(dir).1)
        ));
    }
    for file in &files {
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            percent_encode_path(&file.path),
            xml_escape(&file.name),
            human_size(file.size),
            file.chunk_count,
            file.remotes.join(", ")
        ));
    }
    html.push_str("</table>\n</body></html>\n");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response())
}

// ─── Small utilities ───────────────────────────────────────────────────

pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn percent_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn http_date(timestamp: f64) -> String {
    let ts = if timestamp <= 0.0 {
        rpool_core::types::unix_now()
    } else {
        timestamp
    };
    chrono::DateTime::<chrono::Utc>::from_timestamp(ts as i64, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn human_size(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

fn guess_content_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "txt" | "srt" | "sub" => "text/plain",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" => "text/html",
        "iso" => "application/x-iso9660-image",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use rpool_core::PoolConfig;
    use rpool_storage::MemoryClient;
    use tower::ServiceExt;

    fn dav(remotes: &[&str]) -> (Router, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            remotes: remotes.iter().map(|s| s.to_string()).collect(),
            chunk_size: 100,
            cache_dir: Some(tmp.path().join("manifest-cache")),
            chunk_cache_dir: tmp.path().join("chunk-cache"),
            temp_dir: tmp.path().join("tmp"),
            ..Default::default()
        };
        let client = Arc::new(MemoryClient::new(config.remotes.iter().cloned()));
        let engine = Arc::new(PoolEngine::new(config.clone(), client).unwrap());
        let auth = Arc::new(AuthManager::from_config(&config));
        (router(DavState { engine, auth }), tmp)
    }

    async fn body_bytes(response: Response) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn request(method: &str, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    fn put_request(path: &str, data: &[u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(path)
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from(data.to_vec()))
            .unwrap()
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=90-", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=-10", 100), Some((90, 99)));
        assert_eq!(parse_range("bytes=0-500", 100), Some((0, 99)));
        assert_eq!(parse_range("bytes=100-", 100), None);
        assert_eq!(parse_range("bytes=5-2", 100), None);
        assert_eq!(parse_range("bytes=0-0", 0), None);
    }

    #[test]
    fn percent_codec_round_trip() {
        assert_eq!(percent_decode("/a%20b/c"), "/a b/c");
        assert_eq!(percent_encode_path("/a b/c"), "/a%20b/c");
        assert_eq!(percent_decode(&percent_encode_path("/späce/f")), "/späce/f");
    }

    #[test]
    fn destination_header_stripping() {
        assert_eq!(strip_scheme_host("http://h:8080/a/b"), "/a/b");
        assert_eq!(strip_scheme_host("/a/b"), "/a/b");
    }

    #[tokio::test]
    async fn options_advertises_dav_methods() {
        let (app, _tmp) = dav(&["a"]);
        let response = app.oneshot(request("OPTIONS", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let allow = response.headers()[header::ALLOW].to_str().unwrap();
        assert!(allow.contains("PROPFIND"));
        assert!(allow.contains("MOVE"));
        assert_eq!(response.headers()["dav"], "1, 2");
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (app, _tmp) = dav(&["a", "b"]);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();

        let response = app
            .clone()
            .oneshot(put_request("/media/f.bin", &data))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.oneshot(request("GET", "/media/f.bin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH].to_str().unwrap(),
            "250"
        );
        assert_eq!(body_bytes(response).await, Bytes::from(data));
    }

    #[tokio::test]
    async fn put_without_length_is_411() {
        let (app, _tmp) = dav(&["a"]);
        let req = Request::builder()
            .method("PUT")
            .uri("/f.bin")
            .body(Body::from("data"))
            .unwrap();
        // Content-Length is normally set automatically; strip it
        let (mut parts, body) = req.into_parts();
        parts.headers.remove(header::CONTENT_LENGTH);
        let response = app
            .oneshot(Request::from_parts(parts, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn ranged_get_returns_206_with_content_range() {
        let (app, _tmp) = dav(&["a", "b"]);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        app.clone()
            .oneshot(put_request("/f.bin", &data))
            .await
            .unwrap();

        let req = Request::builder()
            .method("GET")
            .uri("/f.bin")
            .header(header::RANGE, "bytes=100-103")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
            "bytes 100-103/250"
        );
        assert_eq!(body_bytes(response).await, Bytes::from(vec![100, 101, 102, 103]));
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416() {
        let (app, _tmp) = dav(&["a"]);
        app.clone()
            .oneshot(put_request("/f.bin", b"0123456789"))
            .await
            .unwrap();
        let req = Request::builder()
            .method("GET")
            .uri("/f.bin")
            .header(header::RANGE, "bytes=50-")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers()[header::CONTENT_RANGE].to_str().unwrap(),
            "bytes */10"
        );
    }

    #[tokio::test]
    async fn head_reports_metadata() {
        let (app, _tmp) = dav(&["a"]);
        app.clone()
            .oneshot(put_request("/f.mkv", b"0123456789"))
            .await
            .unwrap();
        let response = app.oneshot(request("HEAD", "/f.mkv")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/x-matroska");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    }

    #[tokio::test]
    async fn delete_then_404() {
        let (app, _tmp) = dav(&["a"]);
        app.clone()
            .oneshot(put_request("/f.bin", b"0123456789"))
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(request("DELETE", "/f.bin"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.oneshot(request("DELETE", "/f.bin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mkcol_always_succeeds() {
        let (app, _tmp) = dav(&["a"]);
        let response = app.oneshot(request("MKCOL", "/new-dir")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn move_renames_file() {
        let (app, _tmp) = dav(&["a"]);
        app.clone()
            .oneshot(put_request("/old.bin", b"0123456789"))
            .await
            .unwrap();
        let req = Request::builder()
            .method("MOVE")
            .uri("/old.bin")
            .header("destination", "http://localhost:8080/dir/new.bin")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(request("GET", "/dir/new.bin"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request("GET", "/old.bin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn move_without_destination_is_400() {
        let (app, _tmp) = dav(&["a"]);
        let response = app.oneshot(request("MOVE", "/f.bin")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn propfind_lists_collection_and_children() {
        let (app, _tmp) = dav(&["a"]);
        app.clone()
            .oneshot(put_request("/media/f.bin", b"0123456789"))
            .await
            .unwrap();

        let req = Request::builder()
            .method("PROPFIND")
            .uri("/")
            .header("depth", "1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
        let xml = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(xml.contains("<D:multistatus"));
        assert!(xml.contains("<D:collection/>"));
        assert!(xml.contains("/media/"));

        // file node exposes length and type
        let req = Request::builder()
            .method("PROPFIND")
            .uri("/media/f.bin")
            .header("depth", "0")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        let xml = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(xml.contains("<D:getcontentlength>10</D:getcontentlength>"));
    }

    #[tokio::test]
    async fn propfind_unknown_path_is_404() {
        let (app, _tmp) = dav(&["a"]);
        let response = app.oneshot(request("PROPFIND", "/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_get_returns_html_listing() {
        let (app, _tmp) = dav(&["a"]);
        app.clone()
            .oneshot(put_request("/media/f.bin", b"0123456789"))
            .await
            .unwrap();
        let response = app.oneshot(request("GET", "/media")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(html.contains("f.bin"));
    }
}
