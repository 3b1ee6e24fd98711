use std::any::Any;

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Local};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    error::ApiError,
    settings::RefreshSettings,
    storage::FileEntry,
    transfer::{format_file_size, TransferError},
    AppState,
};

/// Characters left unescaped in a path segment, matching `encodeURIComponent`.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

// ── Static UI ────────────────────────────────────────────────────────────────

/// Browsers get the web UI; command-line clients get one file name per line.
pub async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !is_line_client(&headers) {
        return serve_asset("index.html").unwrap_or_else(|| {
            (StatusCode::NOT_FOUND, "UI not found (index.html missing).").into_response()
        });
    }
    match state.transfer.list().await {
        Ok(entries) => {
            let mut body = String::new();
            for entry in &entries {
                body.push_str(&entry.name);
                body.push('\n');
            }
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
        Err(e) => ApiError::from(e).into_plain(),
    }
}

pub async fn asset(Path(path): Path<String>) -> Response {
    serve_asset(&path).unwrap_or_else(not_found_response)
}

fn is_line_client(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|ua| {
            let ua = ua.to_ascii_lowercase();
            ua.contains("curl") || ua.contains("wget")
        })
        .unwrap_or(false)
}

fn serve_asset(path: &str) -> Option<Response> {
    let asset = Assets::get(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Some(
        (
            [(header::CONTENT_TYPE, mime.essence_str().to_owned())],
            Body::from(asset.data.into_owned()),
        )
            .into_response(),
    )
}

// ── Ping ─────────────────────────────────────────────────────────────────────

pub async fn ping() -> &'static str {
    "pong"
}

// ── Refresh settings ─────────────────────────────────────────────────────────

pub async fn get_refresh_settings(State(state): State<AppState>) -> Json<RefreshSettings> {
    Json(state.settings.current().refresh)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshUpdate {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_seconds: i64,
}

fn default_enabled() -> bool {
    RefreshSettings::default().enabled
}

fn default_interval() -> i64 {
    RefreshSettings::default().interval_seconds.into()
}

pub async fn set_refresh_settings(State(state): State<AppState>, body: Bytes) -> Response {
    let update: RefreshUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => return ApiError::BadRequest(format!("Invalid request body: {e}")).into_response(),
    };
    let refresh = match RefreshSettings::validated(update.enabled, update.interval_seconds) {
        Ok(r) => r,
        Err(e) => return ApiError::from(e).into_response(),
    };
    match state.settings.set_refresh(refresh) {
        Ok(_) => {
            info!(
                enabled = refresh.enabled,
                interval_seconds = refresh.interval_seconds,
                "audit: settings.refresh"
            );
            Json(json!({"message": "Refresh settings updated"})).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── List ─────────────────────────────────────────────────────────────────────

/// One row of the `/api/files` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub formatted_size: String,
    pub last_modified: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub download_url: String,
}

impl From<&FileEntry> for FileInfo {
    fn from(entry: &FileEntry) -> Self {
        let modified: DateTime<Local> = entry.modified.into();
        Self {
            name: entry.name.clone(),
            size: entry.size,
            formatted_size: format_file_size(entry.size),
            last_modified: modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            mime: entry.mime.clone(),
            download_url: format!("/api/download/{}", encode_segment(&entry.name)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<FileInfo>,
}

pub fn encode_segment(name: &str) -> String {
    utf8_percent_encode(name, PATH_SEGMENT).to_string()
}

pub async fn list_files(State(state): State<AppState>) -> Response {
    match state.transfer.list().await {
        Ok(entries) => Json(FileList {
            files: entries.iter().map(FileInfo::from).collect(),
        })
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Download ─────────────────────────────────────────────────────────────────

pub async fn download(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match open_file(&state, &name).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn open_file(state: &AppState, name: &str) -> Result<Response, ApiError> {
    let (entry, reader) = state.transfer.open_download(name).await?;
    debug!(name = %entry.name, size = entry.size, "audit: file.download");
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(&entry.mime)?);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.size));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&entry.name)?);
    Ok((headers, stream_body(reader, state.transfer.chunk_size())).into_response())
}

fn stream_body<R>(reader: R, chunk_size: usize) -> Body
where
    R: AsyncRead + Send + 'static,
{
    Body::from_stream(ReaderStream::with_capacity(reader, chunk_size))
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|e| ApiError::Internal(format!("invalid header value {value:?}: {e}")))
}

/// `attachment` with an ASCII fallback name plus the exact UTF-8 name.
pub fn content_disposition(name: &str) -> Result<HeaderValue, ApiError> {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    header_value(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        encode_segment(name)
    ))
}

// ── Zip ──────────────────────────────────────────────────────────────────────

pub async fn zip_all(State(state): State<AppState>) -> Response {
    match state.transfer.archive().await {
        Ok(archive) => {
            let file_name = format!("transfer_files_{}.zip", Local::now().format("%Y%m%d_%H%M%S"));
            let disposition = match content_disposition(&file_name) {
                Ok(v) => v,
                Err(e) => return e.into_response(),
            };
            (
                [
                    (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                Body::from_stream(archive),
            )
                .into_response()
        }
        Err(TransferError::Empty) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Upload ───────────────────────────────────────────────────────────────────

pub async fn upload_files(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut uploaded = Vec::new();
    let mut failed = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart body");
                failed.push(format!("Part processing error: {e}"));
                break;
            }
        };
        let Some(raw_name) = field.file_name().map(str::to_owned) else {
            debug!(field = ?field.name(), "ignoring non-file form field");
            continue;
        };
        let raw_name = if raw_name.trim().is_empty() {
            "uploaded_file".to_owned()
        } else {
            raw_name
        };
        match state.transfer.upload(&raw_name, field).await {
            Ok(stored) => uploaded.push(stored),
            Err(e) => {
                warn!(name = %raw_name, error = %e, "upload failed");
                failed.push(format!("{raw_name}: {e}"));
            }
        }
    }

    match (uploaded.is_empty(), failed.is_empty()) {
        (false, true) => format!(
            "Successfully uploaded {} file(s): {}",
            uploaded.len(),
            uploaded.join(", ")
        )
        .into_response(),
        (false, false) => format!(
            "Partially successful: {} uploaded ({}), {} failed ({})",
            uploaded.len(),
            uploaded.join(", "),
            failed.len(),
            failed.join("; ")
        )
        .into_response(),
        (true, _) => {
            let reason = if failed.is_empty() {
                "no files in request".to_owned()
            } else {
                failed.join("; ")
            };
            ApiError::BadRequest(format!("Upload failed: {reason}")).into_response()
        }
    }
}

// ── Delete ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub filename: String,
}

pub async fn delete_api(State(state): State<AppState>, body: Bytes) -> Response {
    let request: DeleteRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return ApiError::BadRequest(format!("Invalid request body: {e}")).into_response(),
    };
    if request.filename.is_empty() {
        return ApiError::BadRequest("Filename not provided.".into()).into_response();
    }
    match state.transfer.delete(&request.filename).await {
        Ok(()) => Json(json!({"message": format!("File '{}' deleted.", request.filename)}))
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

// ── Raw file verbs ───────────────────────────────────────────────────────────

pub async fn put_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Body,
) -> Response {
    match state.transfer.replace(&name, body.into_data_stream()).await {
        Ok(stored) => {
            let location = format!("/{}", encode_segment(&stored));
            let mut response = (
                StatusCode::CREATED,
                format!("File '{stored}' uploaded successfully via PUT.\n"),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            response
        }
        Err(e) => ApiError::from(e).into_plain(),
    }
}

pub async fn get_file(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match open_file(&state, &name).await {
        Ok(response) => response,
        Err(e) => e.into_plain(),
    }
}

pub async fn delete_file(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.transfer.delete(&name).await {
        Ok(()) => format!("File '{name}' deleted.\n").into_response(),
        Err(e) => ApiError::from(e).into_plain(),
    }
}

// ── Fallbacks ────────────────────────────────────────────────────────────────

pub async fn not_found() -> Response {
    not_found_response()
}

fn not_found_response() -> Response {
    (StatusCode::NOT_FOUND, "404: Page Not Found").into_response()
}

/// Turns a handler panic into a plain 500 carrying the panic message.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown error");
    tracing::error!(error = %message, "handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("500: {message}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn file_info_matches_wire_shape() {
        let entry = FileEntry {
            name: "my report #1.pdf".into(),
            size: 2048,
            modified: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            mime: "application/pdf".into(),
        };
        let json = serde_json::to_value(FileInfo::from(&entry)).unwrap();
        assert_eq!(json["name"], "my report #1.pdf");
        assert_eq!(json["size"], 2048);
        assert_eq!(json["formattedSize"], "2.0 KB");
        assert_eq!(json["type"], "application/pdf");
        assert_eq!(json["downloadUrl"], "/api/download/my%20report%20%231.pdf");
        assert_eq!(json["lastModified"].as_str().unwrap().len(), 19);
    }

    #[test]
    fn content_disposition_carries_exact_name() {
        let value = content_disposition("résumé \"final\".txt").unwrap();
        let value = value.to_str().unwrap();
        assert!(value.starts_with("attachment; filename=\"r_sum_ _final_.txt\""));
        assert!(value.ends_with("filename*=UTF-8''r%C3%A9sum%C3%A9%20%22final%22.txt"));
    }

    #[test]
    fn line_clients_are_detected_by_user_agent() {
        let mut headers = HeaderMap::new();
        assert!(!is_line_client(&headers));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.5.0"));
        assert!(is_line_client(&headers));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Wget/1.21"));
        assert!(is_line_client(&headers));
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (X11; Linux x86_64)"),
        );
        assert!(!is_line_client(&headers));
    }

    #[test]
    fn refresh_update_defaults_missing_fields() {
        let update: RefreshUpdate = serde_json::from_str("{}").unwrap();
        assert!(update.enabled);
        assert_eq!(update.interval_seconds, 30);
        let update: RefreshUpdate = serde_json::from_str(r#"{"intervalSeconds": 3}"#).unwrap();
        assert_eq!(update.interval_seconds, 3);
    }

    #[test]
    fn panic_message_is_reported() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn embedded_ui_is_present() {
        assert!(serve_asset("index.html").is_some());
        assert!(serve_asset("missing.css").is_none());
    }
}
