//! Commit message engines.
//!
//! Everything that turns a diff into a message sits behind [`Engine`]. The
//! cache layer and the daemon only ever see this trait, so the rule-based
//! generator, an external LLM runner, and the daemon client are
//! interchangeable.

pub mod command;
pub mod rules;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::daemon::client::DaemonError;

pub use command::CommandEngine;
pub use rules::RuleEngine;

/// A loaded message generator.
pub trait Engine: Send + Sync {
    /// Short identifier for logs.
    fn id(&self) -> &str;

    /// Produce a commit message for `diff`.
    fn generate(&self, diff: &str) -> Result<String, GenerationError>;

    /// Like [`Engine::generate`], also naming the model that produced the
    /// message when it is not the one the caller configured.
    fn generate_attributed(&self, diff: &str) -> Result<Attributed, GenerationError> {
        self.generate(diff).map(|message| Attributed {
            message,
            model: None,
        })
    }
}

/// A generated message and, for proxies, the model that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributed {
    pub message: String,
    /// `None` means the configured model.
    pub model: Option<String>,
}

/// Deferred engine construction. Loading can be expensive, so callers decide
/// when (and how often) to pay for it.
pub type EngineFactory = Box<dyn Fn() -> Result<Box<dyn Engine>, GenerationError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("engine failed to load: {0}")]
    Load(String),

    #[error("generation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

/// Which engine a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Fast rule-based messages, no model.
    #[default]
    Rules,
    /// Pipe a prompt through an external command (any local LLM runner).
    Command,
}

/// Build the factory for the engine selected by `config`.
pub fn engine_factory(config: &Config) -> EngineFactory {
    match config.engine {
        EngineKind::Rules => Box::new(|| Ok(Box::new(RuleEngine::new()) as Box<dyn Engine>)),
        EngineKind::Command => {
            let model = config.model.clone();
            let argv = config.command.clone();
            let template = config.prompt_template.clone();
            let max_diff_chars = config.max_diff_chars;
            Box::new(move || {
                let engine =
                    CommandEngine::new(&model, argv.clone(), template.clone(), max_diff_chars)?;
                Ok(Box::new(engine) as Box<dyn Engine>)
            })
        }
    }
}
