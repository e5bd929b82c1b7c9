//! Per-agent content-addressed blob store.
//!
//! `POST /blobs/<agent>` stores the raw body and returns
//! `{id, size, mime, downloadUrl}`; `GET /blobs/<agent>/<id>` streams it
//! back, honouring single-range `bytes=` requests with 206 responses.
//! IDs are 48 hex chars; bodies live under
//! `.ploinky/blobs/<agent>/<id[..2]>/<id>` with a JSON sidecar.

use std::{fs, path::PathBuf, sync::Arc};

use {
    axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Json, Response},
    },
    rand::RngCore,
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::{auth::error_response, state::GatewayState};

pub const BLOB_ID_LEN: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    pub size: u64,
    pub mime: String,
}

pub fn new_blob_id() -> String {
    let mut bytes = [0u8; BLOB_ID_LEN / 2];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn valid_blob_id(id: &str) -> bool {
    id.len() == BLOB_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn valid_agent_segment(agent: &str) -> bool {
    !agent.is_empty()
        && agent
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn blob_path(root: &std::path::Path, agent: &str, id: &str) -> PathBuf {
    root.join(agent).join(&id[..2]).join(id)
}

/// Parse a single `bytes=` range against a body of `len` bytes.
/// Returns the inclusive byte span, or `None` for an unsatisfiable or
/// malformed header.
pub fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    // Single range only.
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    if start.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || len == 0 {
            return None;
        }
        let start = len.saturating_sub(suffix);
        return Some((start, len - 1));
    }
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len - 1)))
}

/// `POST /blobs/<agent>` — store a blob.
pub async fn post_handler(
    State(state): State<Arc<GatewayState>>,
    Path(agent): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !valid_agent_segment(&agent) {
        return error_response(StatusCode::BAD_REQUEST, "internal", "invalid agent name");
    }
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let id = new_blob_id();
    let path = blob_path(&state.paths.blobs_dir(), &agent, &id);
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &body)?;
        let meta = BlobMeta {
            size: body.len() as u64,
            mime: mime.clone(),
        };
        fs::write(
            path.with_extension("json"),
            serde_json::to_vec(&meta).unwrap_or_default(),
        )
    };
    if let Err(e) = write() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            &format!("blob write failed: {e}"),
        );
    }
    debug!(agent = %agent, id = %id, size = body.len(), "blob stored");
    Json(serde_json::json!({
        "id": id,
        "size": body.len(),
        "mime": mime,
        "downloadUrl": format!("/blobs/{agent}/{id}"),
    }))
    .into_response()
}

/// `GET /blobs/<agent>/<id>` — fetch a blob, honouring `Range`.
pub async fn get_handler(
    State(state): State<Arc<GatewayState>>,
    Path((agent, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !valid_agent_segment(&agent) || !valid_blob_id(&id) {
        return error_response(StatusCode::BAD_REQUEST, "internal", "invalid blob reference");
    }
    let path = blob_path(&state.paths.blobs_dir(), &agent, &id);
    let Ok(data) = fs::read(&path) else {
        return error_response(StatusCode::NOT_FOUND, "internal", "blob not found");
    };
    let meta: BlobMeta = fs::read(path.with_extension("json"))
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or(BlobMeta {
            size: data.len() as u64,
            mime: "application/octet-stream".to_string(),
        });

    let len = data.len() as u64;
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    match range_header {
        None => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, meta.mime),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            data,
        )
            .into_response(),
        Some(range) => match parse_range(range, len) {
            Some((start, end)) => {
                let slice = data[start as usize..=end as usize].to_vec();
                (
                    StatusCode::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_TYPE, meta.mime),
                        (
                            header::CONTENT_RANGE,
                            format!("bytes {start}-{end}/{len}"),
                        ),
                    ],
                    slice,
                )
                    .into_response()
            },
            None => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{len}"))],
            )
                .into_response(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_shape() {
        let id = new_blob_id();
        assert_eq!(id.len(), BLOB_ID_LEN);
        assert!(valid_blob_id(&id));
        assert_ne!(id, new_blob_id());

        assert!(!valid_blob_id("short"));
        assert!(!valid_blob_id(&"G".repeat(BLOB_ID_LEN)));
        assert!(!valid_blob_id(&"A".repeat(BLOB_ID_LEN)));
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        // End clamped to the body.
        assert_eq!(parse_range("bytes=900-2000", 1000), Some((900, 999)));
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(parse_range("bytes=1000-1100", 1000), None);
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
        assert_eq!(parse_range("items=0-10", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
    }

    #[test]
    fn test_agent_segment_validation() {
        assert!(valid_agent_segment("simulator"));
        assert!(valid_agent_segment("my-agent_2"));
        assert!(!valid_agent_segment("../escape"));
        assert!(!valid_agent_segment(""));
    }
}
