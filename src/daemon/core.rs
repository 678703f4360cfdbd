//! Daemon server core.
//!
//! Loads one engine, then serves generation requests over a Unix Domain
//! Socket strictly one at a time: the listen backlog is 1 and a connection is
//! fully handled before the next `accept`, so the engine never runs two
//! generations concurrently and needs no locking of its own.

use std::any::Any;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::protocol::{
    ProtocolError, Response, decode_request, default_socket_path, encode_response, read_request,
};
use crate::engine::{Engine, EngineFactory, GenerationError};

/// Pending connections the kernel may queue while a request is in progress.
const LISTEN_BACKLOG: libc::c_int = 1;

/// Configuration for the daemon server.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,
    /// Read/write timeout on each client connection.
    pub request_timeout: Duration,
    /// How often the idle accept loop checks for shutdown.
    pub poll_interval: Duration,
    /// Model id reported with every message, so clients cache under it.
    pub model: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            request_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(10),
            model: None,
        }
    }
}

impl DaemonConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("LLMCOMMIT_DAEMON_SOCKET") {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("LLMCOMMIT_DAEMON_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.request_timeout = Duration::from_secs(secs);
        }

        if let Ok(model) = dotenvy::var("LLMCOMMIT_MODEL") {
            cfg.model = Some(model);
        }

        cfg
    }
}

/// Lifecycle of a [`ModelDaemon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    LoadingEngine,
    /// Bound and waiting for a connection.
    Listening,
    /// Serving one connection.
    Handling,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum DaemonRunError {
    #[error("engine failed to load: {0}")]
    EngineLoad(#[source] GenerationError),

    #[error("socket error at {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Cloneable control surface for a running daemon (signal handlers, tests).
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    shutdown: Arc<AtomicBool>,
    state: Arc<RwLock<DaemonState>>,
}

impl DaemonHandle {
    /// Ask the accept loop to exit after the current connection.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> DaemonState {
        *self.state.read()
    }
}

/// Daemon server state.
pub struct ModelDaemon {
    config: DaemonConfig,
    factory: EngineFactory,
    handle: DaemonHandle,
    start_time: Instant,
    total_requests: AtomicU64,
}

impl ModelDaemon {
    /// Create a new daemon. Nothing is loaded until [`ModelDaemon::run`].
    pub fn new(config: DaemonConfig, factory: EngineFactory) -> Self {
        Self {
            config,
            factory,
            handle: DaemonHandle {
                shutdown: Arc::new(AtomicBool::new(false)),
                state: Arc::new(RwLock::new(DaemonState::Created)),
            },
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.handle.state()
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Request the daemon to shutdown.
    pub fn request_shutdown(&self) {
        self.handle.request_shutdown();
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: DaemonState) {
        *self.handle.state.write() = state;
    }

    fn shutdown_requested(&self) -> bool {
        self.handle.shutdown.load(Ordering::SeqCst)
    }

    /// Load the engine, bind the socket and serve until shutdown is requested.
    ///
    /// Blocks the calling thread. A failed engine load returns before the
    /// socket is bound.
    pub fn run(&self) -> Result<(), DaemonRunError> {
        let socket_path = self.config.socket_path.clone();
        let socket_err = |source: io::Error| DaemonRunError::Socket {
            path: socket_path.clone(),
            source,
        };

        // Leftover from a daemon that did not shut down cleanly.
        remove_socket_if_exists(&socket_path).map_err(socket_err)?;

        self.set_state(DaemonState::LoadingEngine);
        info!("Loading engine...");
        let load_start = Instant::now();
        let engine = match (self.factory)() {
            Ok(engine) => engine,
            Err(e) => {
                error!(error = %e, "Engine failed to load");
                self.set_state(DaemonState::Stopped);
                return Err(DaemonRunError::EngineLoad(e));
            }
        };
        info!(
            engine = engine.id(),
            model = self.config.model.as_deref().unwrap_or("-"),
            elapsed_ms = load_start.elapsed().as_millis() as u64,
            "Engine loaded"
        );

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(socket_err)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(socket_err)?;
        let served = self.serve(&listener, engine.as_ref());

        self.set_state(DaemonState::ShuttingDown);
        drop(listener);
        if let Err(e) = remove_socket_if_exists(&socket_path) {
            warn!(socket = %socket_path.display(), error = %e, "Failed to remove socket");
        }

        info!(
            total_requests = self.total_requests(),
            uptime_secs = self.start_time.elapsed().as_secs(),
            "Daemon stopped"
        );
        self.set_state(DaemonState::Stopped);
        served.map_err(socket_err)
    }

    fn serve(&self, listener: &UnixListener, engine: &dyn Engine) -> io::Result<()> {
        set_backlog(listener, LISTEN_BACKLOG)?;
        listener.set_nonblocking(true)?;

        self.set_state(DaemonState::Listening);
        info!(socket = %self.config.socket_path.display(), "Daemon listening");

        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested, stopping daemon");
                return Ok(());
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    self.set_state(DaemonState::Handling);
                    self.handle_connection(stream, engine);
                    self.set_state(DaemonState::Listening);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "Accept error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Handle a single client connection. Never fails: every problem becomes
    /// an error response for this client only.
    fn handle_connection(&self, mut stream: UnixStream, engine: &dyn Engine) {
        let request_id = self.total_requests.fetch_add(1, Ordering::Relaxed) + 1;

        let response = match self.process(&mut stream, engine) {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id, error = %e, "Request failed");
                Response::error(e.to_string())
            }
        };

        let written = encode_response(&response)
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|bytes| stream.write_all(&bytes))
            .and_then(|()| stream.flush());
        if let Err(e) = written {
            debug!(request_id, error = %e, "Failed to send response");
        }
    }

    fn process(&self, stream: &mut UnixStream, engine: &dyn Engine) -> Result<Response, RequestError> {
        // Accepted sockets inherit O_NONBLOCK from the listener on some platforms.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.request_timeout))?;
        stream.set_write_timeout(Some(self.config.request_timeout))?;

        let raw = read_request(stream)?;
        let request = decode_request(&raw)?;
        debug!(diff_len = request.diff.len(), "Processing generate request");

        let start = Instant::now();
        let message = panic::catch_unwind(AssertUnwindSafe(|| engine.generate(&request.diff)))
            .map_err(|payload| RequestError::Panic(panic_message(payload.as_ref())))??;
        let elapsed = start.elapsed().as_secs_f64();

        debug!(elapsed_secs = elapsed, "Generated message");
        Ok(Response::Generated {
            message,
            elapsed,
            model: self.config.model.clone(),
        })
    }
}

#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("engine panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Re-issue `listen(2)` on a bound socket to shrink its backlog.
fn set_backlog(listener: &UnixListener, backlog: libc::c_int) -> io::Result<()> {
    // SAFETY: the fd belongs to `listener`, which outlives this call.
    let rc = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn remove_socket_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Flip the daemon's shutdown flag on SIGINT/SIGTERM.
///
/// Can only be installed once per process.
pub fn install_signal_handlers(handle: DaemonHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Signal received, shutting down");
        handle.request_shutdown();
    })
}
