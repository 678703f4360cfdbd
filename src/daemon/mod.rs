//! Resident model daemon.
//!
//! Keeps one engine loaded and answers generation requests over a Unix
//! Domain Socket, so repeated commits skip the model load.
//!
//! ## Architecture
//!
//! ```text
//! llmcommit daemon start          llmcommit commit --daemon
//!   └─ DaemonSupervisor             └─ CachingClient
//!        │ spawn + daemon.pid            └─ UdsDaemonClient
//!        ▼                                    │ {"diff": ...}\n\n
//!   llmcommit daemon run                      ▼
//!   └─ ModelDaemon  ◄──────── /tmp/llmcommit-$USER.sock
//!        └─ Engine (loaded once, one request at a time)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use llmcommit::daemon::{DaemonConfig, ModelDaemon, UdsDaemonClient};
//!
//! // Server (blocks until shutdown)
//! let daemon = ModelDaemon::new(DaemonConfig::from_env(), factory);
//! daemon.run()?;
//!
//! // Client
//! let client = UdsDaemonClient::with_defaults();
//! let message = client.generate(&diff)?;
//! ```

pub mod client;
pub mod core;
pub mod protocol;
pub mod supervisor;

pub use client::{DaemonClientConfig, DaemonError, UdsDaemonClient};
pub use self::core::{DaemonConfig, DaemonHandle, DaemonRunError, DaemonState, ModelDaemon};
pub use protocol::{GenerateRequest, Response, default_socket_path};
pub use supervisor::{
    DaemonStatus, DaemonSupervisor, StartOutcome, StopOutcome, SupervisorConfig, SupervisorError,
};
