//! Client side of the daemon socket.
//!
//! Liveness is judged by the socket file alone: if it exists the daemon is
//! assumed to be up. A leftover socket from a crashed daemon therefore shows
//! up as a transport error on the first request, not as "not running".

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::protocol::{
    GenerateRequest, ProtocolError, Response, decode_response, default_socket_path,
    encode_request, read_response,
};
use crate::engine::{Attributed, Engine, GenerationError};

/// Errors from talking to the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is not running (no socket at {}); start it with `llmcommit daemon start`", socket.display())]
    NotRunning { socket: PathBuf },

    #[error("daemon unavailable: {0}")]
    Unavailable(String),

    #[error("daemon timed out: {0}")]
    Timeout(String),

    #[error("daemon protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon answered with `{"error": ...}`.
    #[error("daemon error: {0}")]
    Generation(String),
}

/// Configuration for the daemon client.
#[derive(Debug, Clone)]
pub struct DaemonClientConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,
    /// Read/write timeout for one request.
    pub request_timeout: Duration,
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl DaemonClientConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("LLMCOMMIT_DAEMON_SOCKET") {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("LLMCOMMIT_DAEMON_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            cfg.request_timeout = Duration::from_secs(secs);
        }

        cfg
    }
}

/// Unix Domain Socket client for the model daemon. One connection per request.
pub struct UdsDaemonClient {
    config: DaemonClientConfig,
    request_counter: AtomicU64,
}

impl UdsDaemonClient {
    /// Create a new client with the given configuration.
    pub fn new(config: DaemonClientConfig) -> Self {
        Self {
            config,
            request_counter: AtomicU64::new(0),
        }
    }

    /// Create a client with configuration from the environment.
    pub fn with_defaults() -> Self {
        Self::new(DaemonClientConfig::from_env())
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Whether the daemon socket exists.
    pub fn is_running(&self) -> bool {
        self.config.socket_path.exists()
    }

    /// Send one diff to the daemon and wait for its message.
    pub fn generate(&self, diff: &str) -> Result<String, DaemonError> {
        self.request(diff).map(|attributed| attributed.message)
    }

    /// Send one diff and return the message with the model the daemon serves.
    pub fn request(&self, diff: &str) -> Result<Attributed, DaemonError> {
        if !self.is_running() {
            return Err(DaemonError::NotRunning {
                socket: self.config.socket_path.clone(),
            });
        }

        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let start = Instant::now();
        let encoded = encode_request(&GenerateRequest {
            diff: diff.to_string(),
        })?;

        let mut stream = self.connect()?;
        stream
            .write_all(&encoded)
            .and_then(|()| stream.flush())
            .map_err(|e| transport_error("failed to send request", e))?;

        let raw = read_response(&mut stream).map_err(|e| match e {
            ProtocolError::Io(io) => transport_error("failed to read response", io),
            other => DaemonError::Protocol(other),
        })?;

        match decode_response(&raw)? {
            Response::Generated {
                message,
                elapsed,
                model,
            } => {
                debug!(
                    request_id,
                    daemon_secs = elapsed,
                    model = model.as_deref().unwrap_or("-"),
                    total_ms = start.elapsed().as_millis() as u64,
                    "Daemon generated message"
                );
                Ok(Attributed { message, model })
            }
            Response::Error { error } => Err(DaemonError::Generation(error)),
        }
    }

    fn connect(&self) -> Result<UnixStream, DaemonError> {
        let stream = UnixStream::connect(&self.config.socket_path).map_err(|e| {
            DaemonError::Unavailable(format!(
                "cannot connect to {}: {}",
                self.config.socket_path.display(),
                e
            ))
        })?;
        let timeouts = stream
            .set_read_timeout(Some(self.config.request_timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.config.request_timeout)));
        timeouts.map_err(|e| DaemonError::Unavailable(format!("socket setup failed: {}", e)))?;
        Ok(stream)
    }
}

fn transport_error(context: &str, e: io::Error) -> DaemonError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            DaemonError::Timeout(format!("{}: {}", context, e))
        }
        _ => DaemonError::Unavailable(format!("{}: {}", context, e)),
    }
}

impl Engine for UdsDaemonClient {
    fn id(&self) -> &str {
        "daemon"
    }

    fn generate(&self, diff: &str) -> Result<String, GenerationError> {
        UdsDaemonClient::generate(self, diff).map_err(GenerationError::from)
    }

    fn generate_attributed(&self, diff: &str) -> Result<Attributed, GenerationError> {
        self.request(diff).map_err(GenerationError::from)
    }
}
