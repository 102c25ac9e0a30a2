mod cli;

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use arbor::cleanup::CleanupService;
use arbor::config::{self, Config};
use arbor::git::GitService;
use arbor::setup::{FailureDecision, SetupObserver, SetupOptions, SetupPipeline};
use arbor::worktrees::{CreateOptions, WorktreeService, WorktreeState};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let git = GitService::new(&cwd);
    let repo_root = git
        .repo_root()
        .await
        .context("not inside a git repository")?;
    let config = config::load(&repo_root)?;
    let worktrees = WorktreeService::new(git.clone(), config.clone());

    match cli.command {
        Command::List { json, refresh } => list(&worktrees, json, refresh).await?,
        Command::Create {
            branch,
            base,
            existing,
            path,
            no_copy,
            install,
        } => {
            let created = worktrees
                .create(&CreateOptions {
                    branch,
                    base_branch: base,
                    new_branch: !existing,
                    custom_path: path,
                })
                .await?;
            println!("Created worktree at {}", created.display());

            let pipeline = SetupPipeline::new(git, config);
            let cancel = CancellationToken::new();
            pipeline
                .run(
                    &created,
                    SetupOptions {
                        copy_env_files: !no_copy,
                        install_deps: install,
                    },
                    &PromptObserver,
                    &cancel,
                )
                .await?;
        }
        Command::Remove { path, force } => {
            worktrees.remove(&path, force).await?;
            println!("Removed worktree at {}", path.display());
        }
        Command::Cleanup { apply, json } => {
            let service = CleanupService::new(git, worktrees, config);
            cleanup(&service, apply, json).await?;
        }
        Command::Watch => watch(&worktrees, &config).await?,
    }

    Ok(())
}

async fn list(worktrees: &WorktreeService, json: bool, refresh: bool) -> Result<()> {
    let cards = worktrees.get_all(refresh).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&*cards)?);
        return Ok(());
    }

    for card in cards.iter() {
        let marker = if card.is_main { "*" } else { " " };
        let state = card.state.to_string();
        println!(
            "{marker} {:<24} {state:<7} +{} ~{} ?{}  {:<16} {}",
            card.display_name,
            card.status.staged,
            card.status.modified,
            card.status.untracked,
            card.last_commit.relative_date,
            card.record.path.display()
        );
    }

    Ok(())
}

async fn cleanup(service: &CleanupService, apply: bool, json: bool) -> Result<()> {
    let candidates = service.analyze().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        if !apply {
            return Ok(());
        }
    } else if candidates.is_empty() {
        println!("Nothing to clean up.");
        return Ok(());
    } else {
        println!("{} removal candidate(s):\n", candidates.len());
        for candidate in &candidates {
            let safety = if candidate.safe_to_delete {
                "safe"
            } else {
                "UNSAFE"
            };
            println!(
                "  {} ({}) — {} — {}",
                candidate.worktree.display_name, candidate.reason, safety, candidate.details
            );
        }
    }

    if apply {
        let safe: Vec<PathBuf> = candidates
            .iter()
            .filter(|c| c.safe_to_delete)
            .map(|c| c.worktree.record.path.clone())
            .collect();
        if safe.is_empty() {
            println!("\nNo candidates are safe to delete.");
            return Ok(());
        }

        let result = service.batch_remove(&safe).await;
        println!("\nRemoved {} worktree(s).", result.succeeded.len());
        for failure in &result.failed {
            println!("  failed: {} — {}", failure.path.display(), failure.error);
        }
    }

    Ok(())
}

async fn watch(worktrees: &WorktreeService, config: &Config) -> Result<()> {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.poll_interval_seconds.max(1)));
    let mut previous: HashMap<PathBuf, WorktreeState> = HashMap::new();

    loop {
        interval.tick().await;
        let cards = worktrees.refresh().await;

        for card in cards.iter() {
            match previous.insert(card.record.path.clone(), card.state) {
                None => println!("{} is {}", card.display_name, card.state),
                Some(old) if old != card.state => {
                    println!("{} is now {} (was {old})", card.display_name, card.state);
                }
                Some(_) => {}
            }
        }
        previous.retain(|path, _| cards.iter().any(|card| &card.record.path == path));
    }
}

/// Asks on the terminal whether to continue after a failed setup step.
struct PromptObserver;

impl SetupObserver for PromptObserver {
    fn step_started(&self, index: usize, total: usize, name: &str) {
        println!("[{}/{total}] {name}", index + 1);
    }

    fn step_failed(&self, name: &str, error: &anyhow::Error) -> FailureDecision {
        eprintln!("Setup step \"{name}\" failed: {error:#}");
        eprint!("Continue with the remaining steps? [y/N] ");
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return FailureDecision::Abort;
        }
        if answer.trim().eq_ignore_ascii_case("y") {
            FailureDecision::Continue
        } else {
            FailureDecision::Abort
        }
    }
}
