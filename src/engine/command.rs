//! Engine that delegates to an external command.
//!
//! The rendered prompt goes to the command's stdin and the message is read
//! from its stdout, so any local LLM runner that reads a prompt and prints a
//! completion works (`ollama run <model>`, `llm -m <model>`, a script...).
//! `{model}` in any argument is replaced with the configured model id.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use super::{Engine, GenerationError};

#[derive(Debug, Clone)]
pub struct CommandEngine {
    id: String,
    program: PathBuf,
    args: Vec<String>,
    prompt_template: String,
    max_diff_chars: usize,
}

impl CommandEngine {
    /// Resolve the program on `PATH`. Fails with [`GenerationError::Load`] when
    /// the command is empty or cannot be found.
    pub fn new(
        model: &str,
        argv: Vec<String>,
        prompt_template: String,
        max_diff_chars: usize,
    ) -> Result<Self, GenerationError> {
        let mut argv = argv
            .into_iter()
            .map(|arg| arg.replace("{model}", model));
        let program = argv
            .next()
            .ok_or_else(|| GenerationError::Load("no command configured".to_string()))?;
        let program = which::which(&program)
            .map_err(|e| GenerationError::Load(format!("cannot find `{program}`: {e}")))?;

        Ok(Self {
            id: format!("command:{model}"),
            program,
            args: argv.collect(),
            prompt_template,
            max_diff_chars,
        })
    }

    /// Substitute the (truncated) diff into the prompt template.
    pub fn render_prompt(&self, diff: &str) -> String {
        let end = diff
            .char_indices()
            .nth(self.max_diff_chars)
            .map_or(diff.len(), |(idx, _)| idx);
        self.prompt_template.replace("{diff}", &diff[..end])
    }
}

impl Engine for CommandEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate(&self, diff: &str) -> Result<String, GenerationError> {
        let prompt = self.render_prompt(diff);
        debug!(program = %self.program.display(), prompt_len = prompt.len(), "Running engine command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                GenerationError::Failed(format!("failed to run {}: {e}", self.program.display()))
            })?;

        // A command that exits without reading its input is judged by its exit
        // status below, not by the broken pipe.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(prompt.as_bytes())
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(GenerationError::Failed(format!("failed to write prompt: {e}")));
        }

        let output = child
            .wait_with_output()
            .map_err(|e| GenerationError::Failed(format!("engine command failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let message = clean_message(&String::from_utf8_lossy(&output.stdout));
        if message.is_empty() {
            return Err(GenerationError::Failed(
                "engine produced an empty message".to_string(),
            ));
        }
        Ok(message)
    }
}

/// Trim every line and drop blank lines at both ends.
pub fn clean_message(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().map(str::trim).collect();
    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.is_empty())
        .map_or(start, |idx| idx + 1);
    lines[start..end].join("\n")
}
