//! Relay wire format.
//!
//! Requests are one JSON object tagged by `type`. Responses carry a
//! `status` discriminator; the remaining fields come back in more than one
//! shape (a handle may be a bare string or an object, numbers may arrive as
//! strings), so everything is normalized here and nowhere else.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec;
use crate::error::TransferError;

/// A request to the relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Open an upload session.
    #[serde(rename_all = "camelCase")]
    Init {
        folder_name: String,
        file_name: String,
        total_size: u64,
        category: String,
    },
    /// Send one chunk. `end` is exclusive.
    #[serde(rename_all = "camelCase")]
    Upload {
        upload_url: String,
        chunk_data: String,
        start: u64,
        end: u64,
        total: u64,
    },
    /// Read a byte range of a stored file.
    #[serde(rename_all = "camelCase")]
    ViewGetChunk {
        file_id: String,
        offset: u64,
        length: u64,
    },
    /// Fetch a short-lived storage access token.
    GetToken,
    /// Drop the relay's cached listing for a folder.
    #[serde(rename_all = "camelCase")]
    ClearCache { folder_id: String },
}

impl RelayRequest {
    /// Request kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Upload { .. } => "upload",
            Self::ViewGetChunk { .. } => "view_get_chunk",
            Self::GetToken => "get_token",
            Self::ClearCache { .. } => "clear_cache",
        }
    }
}

/// Opaque handle identifying an upload session on the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget(pub String);

/// Reply to `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReply {
    pub target: UploadTarget,
    /// Resolved destination container, passed through untouched.
    pub container_id: Option<String>,
}

/// Reply to `view_get_chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReply {
    pub data: Vec<u8>,
    pub next_offset: u64,
    pub has_more: bool,
    pub total_size: Option<u64>,
}

/// Reply to `get_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReply {
    pub token: String,
    pub expires_in_secs: u64,
}

const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Parse a relay response body and check its status.
///
/// Returns the remaining fields on success.
///
/// # Errors
///
/// Returns a protocol error for non-JSON bodies, a missing status, or
/// `status: "error"`.
pub fn parse_envelope(body: &str) -> Result<Map<String, Value>, TransferError> {
    let value: Value = serde_json::from_str(body).map_err(|_| {
        let snippet: String = body.chars().take(120).collect();
        TransferError::Protocol(format!("relay returned non-JSON body: {snippet}"))
    })?;
    let Value::Object(mut fields) = value else {
        return Err(TransferError::Protocol(
            "relay response is not an object".to_string(),
        ));
    };

    let status = fields
        .remove("status")
        .and_then(|s| s.as_str().map(str::to_ascii_lowercase))
        .ok_or_else(|| TransferError::Protocol("relay response has no status".to_string()))?;

    match status.as_str() {
        "success" | "ok" => Ok(fields),
        "error" => {
            let message = ["message", "error", "details"]
                .iter()
                .find_map(|k| fields.get(*k).and_then(text_of))
                .unwrap_or_else(|| "unspecified relay error".to_string());
            Err(TransferError::Protocol(message))
        }
        other => Err(TransferError::Protocol(format!(
            "unknown relay status '{other}'"
        ))),
    }
}

/// Normalize an `init` reply.
///
/// # Errors
///
/// Returns a protocol error if no upload handle is present.
pub fn parse_init(fields: &Map<String, Value>) -> Result<InitReply, TransferError> {
    let target = ["uploadUrl", "uploadTarget", "url", "sessionUrl"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(text_of))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransferError::Protocol("init reply has no upload handle".to_string()))?;

    let container_id = ["folderId", "folder"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(text_of))
        .filter(|s| !s.is_empty());

    Ok(InitReply {
        target: UploadTarget(target),
        container_id,
    })
}

/// Normalize a `view_get_chunk` reply.
///
/// # Errors
///
/// Returns a protocol error if the payload is missing or not decodable.
pub fn parse_chunk(fields: &Map<String, Value>, offset: u64) -> Result<ChunkReply, TransferError> {
    let encoded = fields
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| TransferError::Protocol("chunk reply has no data".to_string()))?;
    let data = codec::decode(encoded)?;

    let next_offset = fields
        .get("nextOffset")
        .and_then(u64_of)
        .unwrap_or(offset + data.len() as u64);
    let total_size = fields.get("totalSize").and_then(u64_of);
    let has_more = fields
        .get("hasMore")
        .and_then(bool_of)
        .unwrap_or_else(|| total_size.is_some_and(|t| next_offset < t));

    Ok(ChunkReply {
        data,
        next_offset,
        has_more,
        total_size,
    })
}

/// Normalize a `get_token` reply.
///
/// # Errors
///
/// Returns a protocol error if no token is present.
pub fn parse_token(fields: &Map<String, Value>) -> Result<TokenReply, TransferError> {
    let token = ["token", "accessToken", "access_token"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(text_of))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransferError::Protocol("token reply has no token".to_string()))?;
    let expires_in_secs = ["expiresIn", "expires_in"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(u64_of))
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

    Ok(TokenReply {
        token,
        expires_in_secs,
    })
}

/// A field that is either a bare string or an object wrapping one.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => ["url", "uploadUrl", "id", "value"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(ToString::to_string),
        _ => None,
    }
}

fn u64_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_shapes() {
        let init = RelayRequest::Init {
            folder_name: "Series".into(),
            file_name: "Series - 0001.cbz".into(),
            total_size: 42,
            category: "Comics".into(),
        };
        assert_eq!(
            serde_json::to_value(&init).unwrap(),
            json!({
                "type": "init",
                "folderName": "Series",
                "fileName": "Series - 0001.cbz",
                "totalSize": 42,
                "category": "Comics"
            })
        );
        assert_eq!(
            serde_json::to_value(&RelayRequest::GetToken).unwrap(),
            json!({"type": "get_token"})
        );
    }

    #[test]
    fn test_init_handle_as_bare_string_or_object() {
        let bare = parse_envelope(r#"{"status":"success","uploadUrl":"https://up/1"}"#).unwrap();
        let wrapped = parse_envelope(
            r#"{"status":"success","uploadUrl":{"url":"https://up/1"},"folderId":"F9"}"#,
        )
        .unwrap();

        assert_eq!(parse_init(&bare).unwrap().target, UploadTarget("https://up/1".into()));
        let reply = parse_init(&wrapped).unwrap();
        assert_eq!(reply.target, UploadTarget("https://up/1".into()));
        assert_eq!(reply.container_id.as_deref(), Some("F9"));
    }

    #[test]
    fn test_error_status_is_protocol_error() {
        let err = parse_envelope(r#"{"status":"error","message":"quota exceeded"}"#).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(ref m) if m == "quota exceeded"));
        assert!(parse_envelope("<html>502</html>").is_err());
        assert!(parse_envelope(r#"{"uploadUrl":"x"}"#).is_err());
    }

    #[test]
    fn test_chunk_numbers_as_strings() {
        let fields = parse_envelope(&format!(
            r#"{{"status":"success","data":"{}","nextOffset":"3","hasMore":"false","totalSize":3}}"#,
            codec::encode(b"abc")
        ))
        .unwrap();
        let reply = parse_chunk(&fields, 0).unwrap();
        assert_eq!(reply.data, b"abc");
        assert_eq!(reply.next_offset, 3);
        assert!(!reply.has_more);
        assert_eq!(reply.total_size, Some(3));
    }

    #[test]
    fn test_chunk_has_more_inferred_from_total() {
        let fields = parse_envelope(&format!(
            r#"{{"status":"success","data":"{}","totalSize":10}}"#,
            codec::encode(b"abcd")
        ))
        .unwrap();
        let reply = parse_chunk(&fields, 0).unwrap();
        assert_eq!(reply.next_offset, 4);
        assert!(reply.has_more);
    }

    #[test]
    fn test_token_defaults_lifetime() {
        let fields = parse_envelope(r#"{"status":"success","accessToken":"ya29"}"#).unwrap();
        let token = parse_token(&fields).unwrap();
        assert_eq!(token.token, "ya29");
        assert_eq!(token.expires_in_secs, DEFAULT_TOKEN_LIFETIME_SECS);
    }
}
