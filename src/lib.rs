pub mod cache;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod git;
pub mod profile;

use std::ffi::OsString;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cache::{CacheStats, CacheStore, CachingClient};
use config::{Config, Preset};
use daemon::{
    DaemonClientConfig, DaemonConfig, DaemonSupervisor, StartOutcome, SupervisorConfig,
    UdsDaemonClient,
};
use engine::{Engine, EngineFactory, engine_factory};
use git::{GitCli, Repository};
use profile::Profiler;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "llmcommit",
    version,
    about = "Generate git commit messages with a cached, resident model"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that override the loaded configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Configuration preset
    #[arg(long, value_enum, global = true)]
    pub preset: Option<Preset>,

    /// Override the model id
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Override the cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

impl SettingsArgs {
    pub fn resolve(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref(), self.preset)?;
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        Ok(config)
    }

    /// The same overrides as arguments for a spawned daemon.
    fn forwarded(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(path) = &self.config {
            let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
            args.push("--config".into());
            args.push(path.into_os_string());
        }
        if let Some(preset) = self.preset {
            let name = match preset {
                Preset::Fast => "fast",
                Preset::Command => "command",
            };
            args.push("--preset".into());
            args.push(name.into());
        }
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.into());
        }
        args
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a message for the staged changes and commit them
    Commit(CommitArgs),
    /// Manage the resident model daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Inspect or clear the message cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CommitArgs {
    /// Print the message without committing
    #[arg(long)]
    pub dry_run: bool,

    /// Stage all changes first (`git add -A`)
    #[arg(short = 'a', long)]
    pub add_all: bool,

    /// Skip git hooks
    #[arg(long)]
    pub no_verify: bool,

    /// Push after committing
    #[arg(short, long)]
    pub push: bool,

    /// Force push after committing
    #[arg(long)]
    pub force_push: bool,

    /// Bypass the message cache
    #[arg(long)]
    pub no_cache: bool,

    /// Generate through the running daemon instead of loading the engine here
    #[arg(long)]
    pub daemon: bool,

    /// Print per-phase timings to stderr when done
    #[arg(long)]
    pub profile: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Stop the background daemon
    Stop,
    /// Show whether the daemon is running
    Status,
    /// Run the daemon attached to this terminal
    Foreground,
    /// Daemon process entry point (used by `start`)
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum CacheAction {
    /// Show cache statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete old cache entries
    Clear {
        /// Delete entries at least this many days old
        #[arg(long, default_value_t = 7, conflicts_with = "all")]
        days: u64,

        /// Delete every entry
        #[arg(long)]
        all: bool,
    },
    /// Show cache directories
    Show,
}

impl Commands {
    /// Long-running daemon processes log at `info` by default.
    fn is_daemon_process(&self) -> bool {
        matches!(
            self,
            Commands::Daemon {
                action: DaemonAction::Run | DaemonAction::Foreground
            }
        )
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.command.is_daemon_process());

    match cli.command {
        Commands::Commit(args) => run_commit(&args, &cli.settings),
        Commands::Daemon { action } => run_daemon(action, &cli.settings),
        Commands::Cache { action } => run_cache(action, &cli.settings),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "llmcommit", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8, daemon_process: bool) {
    let level = match verbose {
        0 if daemon_process => "info",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn run_commit(args: &CommitArgs, settings: &SettingsArgs) -> Result<()> {
    let mut profiler = Profiler::new();
    let result = commit_in_cwd(args, settings, &mut profiler);
    if args.profile {
        eprintln!("\n{}", profiler.report());
    }
    result
}

fn commit_in_cwd(
    args: &CommitArgs,
    settings: &SettingsArgs,
    profiler: &mut Profiler,
) -> Result<()> {
    let config = profiler.time("config_load", || settings.resolve())?;
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let repo = GitCli::open(&cwd)?;
    let client = build_client(&config, args);
    commit_with(&repo, &client, args, profiler, &mut std::io::stdout().lock())
}

/// Engine chain for `commit`: cache in front of either a local engine or the
/// daemon.
pub fn build_client(config: &Config, args: &CommitArgs) -> CachingClient {
    let factory: EngineFactory = if args.daemon {
        let client_config = DaemonClientConfig {
            socket_path: config.socket_path(),
            request_timeout: config.request_timeout(),
        };
        Box::new(move || {
            Ok(Box::new(UdsDaemonClient::new(client_config.clone())) as Box<dyn Engine>)
        })
    } else {
        engine_factory(config)
    };

    if args.no_cache {
        CachingClient::uncached(config.model.clone(), factory)
    } else {
        CachingClient::new(
            CacheStore::new(config.cache_dir()),
            config.model.clone(),
            factory,
        )
        .with_config_snapshot(config.snapshot())
    }
}

/// Stage, generate, then commit (and push) unless this is a dry run.
///
/// Each phase is recorded in `profiler`, including the phase that failed.
pub fn commit_with<R: Repository>(
    repo: &R,
    client: &CachingClient,
    args: &CommitArgs,
    profiler: &mut Profiler,
    out: &mut impl Write,
) -> Result<()> {
    if args.add_all {
        profiler
            .time("stage_all", || repo.add_all())
            .context("failed to stage files")?;
    }

    let staged = profiler.time("staged_diff", || repo.staged_diff())?;
    let Some(diff) = staged else {
        if repo.unstaged_diff()?.is_some() {
            bail!("no staged changes found; use `git add` or run with --add-all");
        }
        bail!("no changes found");
    };

    info!(model = client.model(), diff_len = diff.len(), "Generating commit message");
    let already_loaded = client.engine_loaded();
    let started = Instant::now();
    let generated = client.generate(&diff);
    let elapsed = started.elapsed();
    let load = client.engine_load_time().filter(|_| !already_loaded);
    if let Some(load) = load {
        profiler.record("model_load", load);
    }
    profiler.record(
        "message_generation",
        elapsed.saturating_sub(load.unwrap_or_default()),
    );
    let message = generated.context("failed to generate a commit message")?;
    info!(elapsed_ms = elapsed.as_millis() as u64, "Message ready");

    if args.dry_run {
        writeln!(out, "{message}")?;
        return Ok(());
    }

    profiler
        .time("commit", || repo.commit(&message, args.no_verify))
        .context("failed to commit changes")?;
    writeln!(out, "Committed: {message}")?;

    if args.push || args.force_push {
        profiler
            .time("push", || repo.push(args.force_push))
            .context("failed to push; you may need to pull first or use --force-push")?;
        writeln!(out, "Pushed to remote")?;
    }
    Ok(())
}

fn supervisor_for(config: &Config, settings: &SettingsArgs) -> Result<DaemonSupervisor> {
    let mut sup_config = SupervisorConfig::for_current_exe(config.state_dir())
        .context("cannot locate the llmcommit executable")?;
    sup_config.socket_path = config.socket_path();
    sup_config.stop_timeout = config.stop_timeout();
    sup_config.args.extend(settings.forwarded());
    Ok(DaemonSupervisor::new(sup_config))
}

fn daemon_config(config: &Config) -> DaemonConfig {
    DaemonConfig {
        socket_path: config.socket_path(),
        request_timeout: config.request_timeout(),
        model: Some(config.model.clone()),
        ..DaemonConfig::default()
    }
}

fn run_daemon(action: DaemonAction, settings: &SettingsArgs) -> Result<()> {
    let config = settings.resolve()?;
    let supervisor = supervisor_for(&config, settings)?;

    match action {
        DaemonAction::Start => {
            let outcome = supervisor.start()?;
            println!("{outcome}");
            if let StartOutcome::Started { .. } = outcome {
                println!("Socket: {}", supervisor.config().socket_path.display());
                println!("Log: {}", supervisor.config().log_path().display());
            }
        }
        DaemonAction::Stop => println!("{}", supervisor.stop()?),
        DaemonAction::Status => match supervisor.status() {
            Ok(status) => println!("{status}"),
            Err(e) => {
                warn!(error = %e, "Could not read daemon state");
                println!("Daemon status unknown: {e}");
            }
        },
        DaemonAction::Foreground | DaemonAction::Run => {
            let daemon_config = daemon_config(&config);
            eprintln!(
                "Serving {} on {} (Ctrl-C to stop)",
                config.model,
                daemon_config.socket_path.display()
            );
            supervisor.foreground(daemon_config, engine_factory(&config))?;
        }
    }
    Ok(())
}

fn run_cache(action: CacheAction, settings: &SettingsArgs) -> Result<()> {
    let config = settings.resolve()?;
    let store = CacheStore::new(config.cache_dir());
    let mut out = std::io::stdout().lock();

    match action {
        CacheAction::Stats { json } => {
            let stats = store.stats()?;
            if json {
                serde_json::to_writer_pretty(&mut out, &stats)?;
                writeln!(out)?;
            } else {
                write_stats(&mut out, &stats)?;
            }
        }
        CacheAction::Clear { all: true, .. } => {
            let report = store.clear_all()?;
            writeln!(out, "All cache cleared ({} entries removed)", report.removed_blobs)?;
        }
        CacheAction::Clear { days, all: false } => {
            let report = store.clear_older_than(days)?;
            writeln!(
                out,
                "Cleared {} cache entries older than {} days",
                report.removed_blobs, days
            )?;
        }
        CacheAction::Show => {
            writeln!(out, "Cache directory: {}", store.root().display())?;
            writeln!(out, "Outputs: {}", store.outputs_dir().display())?;
            writeln!(out, "Models: {}", store.models_dir().display())?;
        }
    }
    Ok(())
}

fn write_stats(out: &mut impl Write, stats: &CacheStats) -> std::io::Result<()> {
    writeln!(out, "Cache Statistics:")?;
    writeln!(out, "  Directory: {}", stats.cache_dir.display())?;
    writeln!(out, "  Total entries: {}", stats.entry_count)?;
    writeln!(out, "  Total size: {} MB", stats.total_size_mb())?;
    writeln!(out, "  Models:")?;
    for (model, count) in &stats.models {
        writeln!(out, "    {model}: {count} entries")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitError, GitResult};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeRepo {
        staged: Mutex<Option<String>>,
        unstaged: Option<String>,
        commits: Mutex<Vec<(String, bool)>>,
        pushes: Mutex<Vec<bool>>,
        no_remote: bool,
    }

    impl Repository for FakeRepo {
        fn staged_diff(&self) -> GitResult<Option<String>> {
            Ok(self.staged.lock().clone())
        }

        fn unstaged_diff(&self) -> GitResult<Option<String>> {
            Ok(self.unstaged.clone())
        }

        fn add_all(&self) -> GitResult<()> {
            let mut staged = self.staged.lock();
            if staged.is_none() {
                *staged = self.unstaged.clone();
            }
            Ok(())
        }

        fn commit(&self, message: &str, no_verify: bool) -> GitResult<()> {
            self.commits.lock().push((message.to_string(), no_verify));
            Ok(())
        }

        fn push(&self, force: bool) -> GitResult<()> {
            if self.no_remote {
                return Err(GitError::NoRemote);
            }
            self.pushes.lock().push(force);
            Ok(())
        }
    }

    const README_DIFF: &str = "diff --git a/README.md b/README.md\n+hello\n";

    fn rules_client(tmp: &TempDir) -> CachingClient {
        let config = Config {
            cache_dir: Some(tmp.path().to_path_buf()),
            ..Config::default()
        };
        build_client(&config, &CommitArgs::default())
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cache_clear_days_defaults_to_seven() {
        let cli = Cli::try_parse_from(["llmcommit", "cache", "clear"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheAction::Clear { days: 7, all: false }
            }
        ));
    }

    #[test]
    fn cache_clear_days_conflicts_with_all() {
        assert!(Cli::try_parse_from(["llmcommit", "cache", "clear", "--days", "3", "--all"]).is_err());
    }

    #[test]
    fn daemon_run_is_hidden_but_parses() {
        let cli = Cli::try_parse_from(["llmcommit", "daemon", "run", "--model", "m"]).unwrap();
        assert!(cli.command.is_daemon_process());
        assert_eq!(cli.settings.model.as_deref(), Some("m"));
    }

    #[test]
    fn forwarded_settings_reach_the_daemon() {
        let settings = SettingsArgs {
            preset: Some(Preset::Command),
            model: Some("tiny".into()),
            ..SettingsArgs::default()
        };
        let args: Vec<String> = settings
            .forwarded()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["--preset", "command", "--model", "tiny"]);
    }

    #[test]
    fn dry_run_prints_without_committing() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            staged: Mutex::new(Some(README_DIFF.into())),
            ..FakeRepo::default()
        };
        let args = CommitArgs {
            dry_run: true,
            ..CommitArgs::default()
        };
        let mut out = Vec::new();
        commit_with(&repo, &rules_client(&tmp), &args, &mut Profiler::new(), &mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Update documentation\n");
        assert!(repo.commits.lock().is_empty());
    }

    #[test]
    fn commit_then_push() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            staged: Mutex::new(Some(README_DIFF.into())),
            ..FakeRepo::default()
        };
        let args = CommitArgs {
            no_verify: true,
            force_push: true,
            ..CommitArgs::default()
        };
        let mut out = Vec::new();
        commit_with(&repo, &rules_client(&tmp), &args, &mut Profiler::new(), &mut out).unwrap();

        assert_eq!(*repo.commits.lock(), vec![("Update documentation".to_string(), true)]);
        assert_eq!(*repo.pushes.lock(), vec![true]);
    }

    #[test]
    fn unstaged_changes_need_add_all() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            unstaged: Some(README_DIFF.into()),
            ..FakeRepo::default()
        };
        let err = commit_with(
            &repo,
            &rules_client(&tmp),
            &CommitArgs::default(),
            &mut Profiler::new(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("--add-all"), "{err}");

        let args = CommitArgs {
            add_all: true,
            dry_run: true,
            ..CommitArgs::default()
        };
        commit_with(&repo, &rules_client(&tmp), &args, &mut Profiler::new(), &mut Vec::new())
            .unwrap();
    }

    #[test]
    fn clean_tree_reports_no_changes() {
        let tmp = TempDir::new().unwrap();
        let err = commit_with(
            &FakeRepo::default(),
            &rules_client(&tmp),
            &CommitArgs::default(),
            &mut Profiler::new(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "no changes found");
    }

    #[test]
    fn push_failure_is_reported_after_commit() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            staged: Mutex::new(Some(README_DIFF.into())),
            no_remote: true,
            ..FakeRepo::default()
        };
        let args = CommitArgs {
            push: true,
            ..CommitArgs::default()
        };
        let err = commit_with(&repo, &rules_client(&tmp), &args, &mut Profiler::new(), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("failed to push"), "{err}");
        assert_eq!(repo.commits.lock().len(), 1);
    }

    #[test]
    fn second_commit_of_same_diff_hits_cache() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            staged: Mutex::new(Some(README_DIFF.into())),
            ..FakeRepo::default()
        };
        let args = CommitArgs {
            dry_run: true,
            ..CommitArgs::default()
        };
        commit_with(&repo, &rules_client(&tmp), &args, &mut Profiler::new(), &mut Vec::new())
            .unwrap();

        let second = rules_client(&tmp);
        commit_with(&repo, &second, &args, &mut Profiler::new(), &mut Vec::new()).unwrap();
        assert!(!second.engine_loaded());
    }

    #[test]
    fn phases_are_profiled_including_a_failed_push() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            staged: Mutex::new(Some(README_DIFF.into())),
            no_remote: true,
            ..FakeRepo::default()
        };
        let args = CommitArgs {
            push: true,
            ..CommitArgs::default()
        };
        let mut profiler = Profiler::new();
        let result = commit_with(&repo, &rules_client(&tmp), &args, &mut profiler, &mut Vec::new());
        assert!(result.is_err());

        let report = profiler.report();
        for phase in ["staged_diff", "model_load", "message_generation", "commit", "push"] {
            assert!(report.contains(phase), "missing {phase}:\n{report}");
        }
    }

    #[test]
    fn cache_hit_has_no_model_load_phase() {
        let tmp = TempDir::new().unwrap();
        let repo = FakeRepo {
            staged: Mutex::new(Some(README_DIFF.into())),
            ..FakeRepo::default()
        };
        let args = CommitArgs {
            dry_run: true,
            ..CommitArgs::default()
        };
        commit_with(&repo, &rules_client(&tmp), &args, &mut Profiler::new(), &mut Vec::new())
            .unwrap();

        let mut profiler = Profiler::new();
        commit_with(&repo, &rules_client(&tmp), &args, &mut profiler, &mut Vec::new()).unwrap();
        let report = profiler.report();
        assert!(report.contains("message_generation"), "{report}");
        assert!(!report.contains("model_load"), "{report}");
    }

    #[test]
    fn daemon_reports_the_configured_model() {
        let config = Config {
            model: "org/tiny".into(),
            ..Config::default()
        };
        assert_eq!(daemon_config(&config).model.as_deref(), Some("org/tiny"));
    }

    #[test]
    fn stats_render_per_model_lines() {
        let stats = CacheStats {
            entry_count: 2,
            total_size_bytes: 2048,
            models: [("distilgpt2".to_string(), 2)].into_iter().collect(),
            cache_dir: PathBuf::from("/c"),
        };
        let mut out = Vec::new();
        write_stats(&mut out, &stats).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Total entries: 2"));
        assert!(text.contains("Total size: 0 MB"), "{text}");
        assert!(text.contains("distilgpt2: 2 entries"));
    }
}
