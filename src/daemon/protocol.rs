//! Wire protocol between the CLI and the model daemon.
//!
//! One request per connection, JSON over a Unix Domain Socket:
//!
//! ```text
//! client -> daemon   {"diff": "<text>"}\n\n
//! daemon -> client   {"message": "<text>", "elapsed": 0.42, "model": "<id>"}\n
//!                or  {"error": "<text>"}\n
//! ```
//!
//! `model` names the model the daemon was started with and may be absent.
//! A reply carrying `error` is a failure even if other fields are present.
//!
//! serde_json never emits a raw newline inside a document, so the blank-line
//! request terminator cannot occur inside the payload.

use std::io::{self, Read};
use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ends a request.
pub const REQUEST_TERMINATOR: &[u8] = b"\n\n";

/// Ends a response.
pub const RESPONSE_TERMINATOR: u8 = b'\n';

/// Requests larger than this are rejected.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// Default socket path, one per user on the host.
pub fn default_socket_path() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    // Keep only characters that cannot escape the file name.
    let safe_user: String = user
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    let safe_user = if safe_user.is_empty() {
        "unknown".to_string()
    } else {
        safe_user
    };
    PathBuf::from(format!("/tmp/llmcommit-{}.sock", safe_user))
}

/// Request to generate a message for one diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub diff: String,
}

/// Daemon reply: a message or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Generated {
        message: String,
        /// Generation time in seconds.
        elapsed: f64,
        /// Model the daemon serves.
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Error {
        error: String,
    },
}

/// Every field a reply may carry, before deciding which variant it is.
#[derive(Deserialize)]
struct WireResponse {
    message: Option<String>,
    elapsed: Option<f64>,
    model: Option<String>,
    error: Option<String>,
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireResponse::deserialize(deserializer)?;
        if let Some(error) = wire.error {
            return Ok(Response::Error { error });
        }
        let message = wire.message.ok_or_else(|| de::Error::missing_field("message"))?;
        let elapsed = wire.elapsed.ok_or_else(|| de::Error::missing_field("elapsed"))?;
        Ok(Response::Generated {
            message,
            elapsed,
            model: wire.model,
        })
    }
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("connection closed before any data was received")]
    Empty,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn encode_request(request: &GenerateRequest) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(request).map_err(ProtocolError::Encode)?;
    buf.extend_from_slice(REQUEST_TERMINATOR);
    Ok(buf)
}

pub fn decode_request(data: &[u8]) -> Result<GenerateRequest, ProtocolError> {
    serde_json::from_slice(data.trim_ascii()).map_err(ProtocolError::Decode)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(response).map_err(ProtocolError::Encode)?;
    buf.push(RESPONSE_TERMINATOR);
    Ok(buf)
}

pub fn decode_response(data: &[u8]) -> Result<Response, ProtocolError> {
    let data = data.trim_ascii();
    if data.is_empty() {
        return Err(ProtocolError::Empty);
    }
    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

/// Read a request: everything up to the blank-line terminator, or up to EOF
/// when the peer closes first. The terminator is not included.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    read_until(reader, REQUEST_TERMINATOR, MAX_REQUEST_BYTES)
}

/// Read a response line (up to `\n` or EOF).
pub fn read_response<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    read_until(reader, &[RESPONSE_TERMINATOR], MAX_REQUEST_BYTES)
}

fn read_until<R: Read>(
    reader: &mut R,
    marker: &[u8],
    limit: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(buf),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        // The marker may straddle two reads.
        let search_from = buf.len().saturating_sub(marker.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find(&buf[search_from..], marker) {
            buf.truncate(search_from + pos);
            return Ok(buf);
        }
        if buf.len() > limit {
            return Err(ProtocolError::TooLarge { limit });
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
