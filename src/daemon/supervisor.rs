//! Lifecycle management for the detached daemon process.
//!
//! The supervisor never talks to the daemon over its socket. It tracks the
//! process through a PID file and probes liveness with `kill(pid, 0)`.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::core::{
    DaemonConfig, DaemonRunError, ModelDaemon, install_signal_handlers, remove_socket_if_exists,
};
use super::protocol::default_socket_path;
use crate::engine::EngineFactory;

pub const PID_FILE_NAME: &str = "daemon.pid";
pub const LOG_FILE_NAME: &str = "daemon.log";

const LIVENESS_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn daemon: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("process {pid} did not exit after SIGKILL")]
    Unkillable { pid: u32 },

    #[error("failed to install signal handlers: {0}")]
    SignalHandlers(#[from] ctrlc::Error),

    #[error(transparent)]
    Daemon(#[from] DaemonRunError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SupervisorError + '_ {
    move |source| SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Holds the PID file and the daemon log.
    pub state_dir: PathBuf,
    /// Socket the daemon binds; removed after a forced stop.
    pub socket_path: PathBuf,
    /// Executable started by [`DaemonSupervisor::start`].
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// How long `stop` waits after SIGTERM before sending SIGKILL.
    pub stop_timeout: Duration,
}

impl SupervisorConfig {
    /// Supervise `current_exe daemon run`.
    pub fn for_current_exe(state_dir: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            state_dir: state_dir.into(),
            socket_path: default_socket_path(),
            program: std::env::current_exe()?,
            args: vec!["daemon".into(), "run".into()],
            stop_timeout: Duration::from_secs(5),
        })
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join(PID_FILE_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// `forced` is set when the process ignored SIGTERM for the whole grace
    /// period and was killed.
    Stopped { pid: u32, forced: bool },
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    NotRunning,
    /// A PID file whose process is gone.
    Stale { pid: u32 },
}

impl fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { pid } => write!(f, "Daemon started (PID {pid})"),
            Self::AlreadyRunning { pid } => write!(f, "Daemon already running (PID {pid})"),
        }
    }
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped { pid, forced: false } => write!(f, "Daemon stopped (PID {pid})"),
            Self::Stopped { pid, forced: true } => {
                write!(f, "Daemon killed after ignoring SIGTERM (PID {pid})")
            }
            Self::NotRunning => write!(f, "Daemon not running"),
        }
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { pid } => write!(f, "Daemon running (PID {pid})"),
            Self::NotRunning => write!(f, "Daemon not running"),
            Self::Stale { pid } => write!(f, "Daemon not running (stale PID file for {pid})"),
        }
    }
}

pub struct DaemonSupervisor {
    config: SupervisorConfig,
}

impl DaemonSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Report the daemon's state. Leaves a stale PID file in place.
    pub fn status(&self) -> SupervisorResult<DaemonStatus> {
        let Some(pid) = self.read_pid()? else {
            return Ok(DaemonStatus::NotRunning);
        };
        if process_alive(pid) {
            Ok(DaemonStatus::Running { pid })
        } else {
            Ok(DaemonStatus::Stale { pid })
        }
    }

    /// Spawn the daemon detached from this process unless one is alive.
    pub fn start(&self) -> SupervisorResult<StartOutcome> {
        match self.status()? {
            DaemonStatus::Running { pid } => return Ok(StartOutcome::AlreadyRunning { pid }),
            DaemonStatus::Stale { pid } => {
                info!(pid, "Removing stale PID file");
                self.remove_pid_file()?;
            }
            DaemonStatus::NotRunning => {}
        }

        let state_dir = &self.config.state_dir;
        fs::create_dir_all(state_dir).map_err(io_err(state_dir))?;

        let log_path = self.config.log_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(io_err(&log_path))?;
        let log_err = log.try_clone().map_err(io_err(&log_path))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(SupervisorError::Spawn)?;
        let pid = child.id();

        let pid_path = self.config.pid_path();
        if let Err(e) = fs::write(&pid_path, format!("{pid}\n")) {
            // Without a PID file the daemon could never be stopped.
            let _ = child.kill();
            let _ = child.wait();
            return Err(io_err(&pid_path)(e));
        }

        // Reap the child if it exits while this process is still alive, so a
        // zombie never passes the liveness probe.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        info!(
            pid,
            program = %self.config.program.display(),
            log = %log_path.display(),
            "Spawned daemon process"
        );
        Ok(StartOutcome::Started { pid })
    }

    /// SIGTERM the daemon, then SIGKILL it if it outlives the grace period.
    pub fn stop(&self) -> SupervisorResult<StopOutcome> {
        let pid = match self.status()? {
            DaemonStatus::NotRunning => return Ok(StopOutcome::NotRunning),
            DaemonStatus::Stale { pid } => {
                debug!(pid, "PID file is stale");
                self.remove_pid_file()?;
                self.remove_socket();
                return Ok(StopOutcome::NotRunning);
            }
            DaemonStatus::Running { pid } => pid,
        };

        send_signal(pid, libc::SIGTERM)?;
        let mut forced = false;
        if !wait_for_exit(pid, self.config.stop_timeout) {
            warn!(
                pid,
                timeout_secs = self.config.stop_timeout.as_secs_f64(),
                "Daemon ignored SIGTERM, killing"
            );
            send_signal(pid, libc::SIGKILL)?;
            forced = true;
            if !wait_for_exit(pid, Duration::from_secs(2)) {
                return Err(SupervisorError::Unkillable { pid });
            }
        }

        self.remove_pid_file()?;
        self.remove_socket();
        info!(pid, forced, "Daemon stopped");
        Ok(StopOutcome::Stopped { pid, forced })
    }

    /// Run the daemon in this process until SIGINT/SIGTERM.
    ///
    /// Records this process in the PID file for the duration, so `status`
    /// and `stop` work the same as for a detached daemon.
    pub fn foreground(
        &self,
        daemon_config: DaemonConfig,
        factory: EngineFactory,
    ) -> SupervisorResult<()> {
        let daemon = ModelDaemon::new(daemon_config, factory);
        install_signal_handlers(daemon.handle())?;
        self.run_daemon(&daemon)
    }

    /// Run an already constructed daemon, maintaining the PID file.
    pub fn run_daemon(&self, daemon: &ModelDaemon) -> SupervisorResult<()> {
        let state_dir = &self.config.state_dir;
        fs::create_dir_all(state_dir).map_err(io_err(state_dir))?;

        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        let owns_pid_file = match self.read_pid()? {
            // `start` already recorded us.
            Some(recorded) if recorded == pid => true,
            Some(recorded) if process_alive(recorded) => {
                warn!(recorded, "PID file names another live process; leaving it alone");
                false
            }
            _ => {
                fs::write(&pid_path, format!("{pid}\n")).map_err(io_err(&pid_path))?;
                true
            }
        };

        let result = daemon.run();

        if owns_pid_file && self.read_pid().ok().flatten() == Some(pid) {
            let _ = self.remove_pid_file();
        }
        result.map_err(SupervisorError::from)
    }

    fn read_pid(&self) -> SupervisorResult<Option<u32>> {
        let path = self.config.pid_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(path = %path.display(), "Ignoring unparsable PID file");
                Ok(None)
            }
        }
    }

    fn remove_pid_file(&self) -> SupervisorResult<()> {
        let path = self.config.pid_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    fn remove_socket(&self) {
        if let Err(e) = remove_socket_if_exists(&self.config.socket_path) {
            warn!(socket = %self.config.socket_path.display(), error = %e, "Failed to remove socket");
        }
    }
}

/// `kill(pid, 0)`: the process exists (EPERM still means it exists).
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_signal(pid: u32, signal: libc::c_int) -> SupervisorResult<()> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| SupervisorError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: plain kill(2) on a PID read from our own PID file.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(());
    }
    let source = io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        // Exited between the probe and the signal.
        return Ok(());
    }
    Err(SupervisorError::Signal { pid, source })
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(LIVENESS_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> SupervisorConfig {
        SupervisorConfig {
            state_dir: tmp.path().join("state"),
            socket_path: tmp.path().join("d.sock"),
            program: PathBuf::from("sleep"),
            args: vec!["30".into()],
            stop_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn paths_live_in_state_dir() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp);
        assert_eq!(cfg.pid_path(), tmp.path().join("state/daemon.pid"));
        assert_eq!(cfg.log_path(), tmp.path().join("state/daemon.log"));
    }

    #[test]
    fn status_without_pid_file_is_not_running() {
        let tmp = TempDir::new().unwrap();
        let sup = DaemonSupervisor::new(config(&tmp));
        assert_eq!(sup.status().unwrap(), DaemonStatus::NotRunning);
        assert_eq!(sup.stop().unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn garbage_pid_file_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let sup = DaemonSupervisor::new(config(&tmp));
        fs::create_dir_all(&sup.config().state_dir).unwrap();
        fs::write(sup.config().pid_path(), "not a pid").unwrap();
        assert_eq!(sup.status().unwrap(), DaemonStatus::NotRunning);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn outcomes_render_for_humans() {
        assert_eq!(
            StartOutcome::AlreadyRunning { pid: 42 }.to_string(),
            "Daemon already running (PID 42)"
        );
        assert_eq!(StopOutcome::NotRunning.to_string(), "Daemon not running");
        assert!(DaemonStatus::Stale { pid: 7 }.to_string().contains("stale"));
    }
}
