use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use llmcommit::engine::{Engine, EngineFactory, GenerationError};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Engine whose behaviour is picked by the diff text: `panic` panics,
/// `fail` returns an error, anything else yields `msg`.
#[allow(dead_code)]
pub struct ScriptedEngine;

impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        "scripted"
    }

    fn generate(&self, diff: &str) -> Result<String, GenerationError> {
        match diff {
            "panic" => panic!("engine blew up"),
            "fail" => Err(GenerationError::Failed("scripted failure".into())),
            _ => Ok("msg".to_string()),
        }
    }
}

#[allow(dead_code)]
pub fn scripted_factory() -> EngineFactory {
    Box::new(|| Ok(Box::new(ScriptedEngine) as Box<dyn Engine>))
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[allow(dead_code)]
pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

/// A fresh repository with an identity configured, or `None` when git is
/// not installed.
#[allow(dead_code)]
pub fn init_git_repo() -> Option<TempDir> {
    which::which("git").ok()?;
    let tmp = TempDir::new().expect("tempdir");
    git(tmp.path(), &["init", "-q"]);
    git(tmp.path(), &["config", "user.email", "dev@example.com"]);
    git(tmp.path(), &["config", "user.name", "Dev"]);
    git(tmp.path(), &["config", "commit.gpgsign", "false"]);
    Some(tmp)
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}
