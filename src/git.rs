//! Git access for the commit flow.
//!
//! [`Repository`] is the seam the CLI works against; [`GitCli`] drives the
//! `git` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {}", path.display())]
    NotARepo { path: PathBuf },

    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("`git {args}` failed: {stderr}")]
    Command { args: String, stderr: String },

    #[error("no remote repository configured")]
    NoRemote,

    #[error("HEAD is detached; cannot push")]
    DetachedHead,
}

pub type GitResult<T> = Result<T, GitError>;

pub trait Repository {
    /// `git diff --cached`; `None` when nothing is staged.
    fn staged_diff(&self) -> GitResult<Option<String>>;

    /// `git diff`; `None` when the working tree matches the index.
    fn unstaged_diff(&self) -> GitResult<Option<String>>;

    fn add_all(&self) -> GitResult<()>;

    fn commit(&self, message: &str, no_verify: bool) -> GitResult<()>;

    /// Push the current branch to `origin`, setting the upstream if needed.
    fn push(&self, force: bool) -> GitResult<()>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    /// Open the repository containing `workdir`.
    pub fn open(workdir: impl Into<PathBuf>) -> GitResult<Self> {
        let git = Self {
            workdir: workdir.into(),
        };
        let output = git.raw(&["rev-parse", "--git-dir"])?;
        if !output.status.success() {
            return Err(GitError::NotARepo {
                path: git.workdir.clone(),
            });
        }
        Ok(git)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn raw(&self, args: &[&str]) -> GitResult<Output> {
        debug!(args = ?args, "Running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(GitError::Spawn)
    }

    /// Run git and return its trimmed stdout, failing on a non-zero exit.
    fn run(&self, args: &[&str]) -> GitResult<String> {
        let output = self.raw(args)?;
        if !output.status.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn non_empty(text: String) -> Option<String> {
        if text.is_empty() { None } else { Some(text) }
    }

    fn current_branch(&self) -> GitResult<String> {
        let branch = self.run(&["branch", "--show-current"])?;
        if branch.is_empty() {
            return Err(GitError::DetachedHead);
        }
        Ok(branch)
    }
}

impl Repository for GitCli {
    fn staged_diff(&self) -> GitResult<Option<String>> {
        self.run(&["diff", "--cached"]).map(Self::non_empty)
    }

    fn unstaged_diff(&self) -> GitResult<Option<String>> {
        self.run(&["diff"]).map(Self::non_empty)
    }

    fn add_all(&self) -> GitResult<()> {
        self.run(&["add", "-A"]).map(drop)
    }

    fn commit(&self, message: &str, no_verify: bool) -> GitResult<()> {
        let mut args = vec!["commit", "-m", message];
        if no_verify {
            args.push("--no-verify");
        }
        self.run(&args).map(drop)
    }

    fn push(&self, force: bool) -> GitResult<()> {
        if self.run(&["remote"])?.is_empty() {
            return Err(GitError::NoRemote);
        }
        let branch = self.current_branch()?;

        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        args.extend(["origin", branch.as_str()]);

        match self.run(&args) {
            Ok(_) => Ok(()),
            Err(GitError::Command { stderr, .. }) if stderr.contains("no upstream branch") => {
                info!(branch = %branch, "No upstream branch, retrying with --set-upstream");
                let mut args = vec!["push"];
                if force {
                    args.push("--force");
                }
                args.extend(["--set-upstream", "origin", branch.as_str()]);
                self.run(&args).map(drop)
            }
            Err(e) => Err(e),
        }
    }
}
