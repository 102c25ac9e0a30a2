//! End-to-end flow over a real repository: create, observe, clean up.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use arbor::cleanup::{CleanupReason, CleanupService};
use arbor::config::Config;
use arbor::git::GitService;
use arbor::setup::{FailureDecision, SetupObserver, SetupOptions, SetupPipeline};
use arbor::worktrees::{CreateOptions, WorktreeService, WorktreeState};
use tokio_util::sync::CancellationToken;

/// Initialize a git repo with an initial commit on `main`.
fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .unwrap_or_else(|e| panic!("git {args:?} failed: {e}"));
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@test.com"]);
    run(&["config", "user.name", "Test"]);
    fs::write(dir.join("README.md"), "# test repo\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial commit"]);
}

fn git_in(dir: &Path, args: &[&str]) {
    Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("git {args:?} failed: {e}"));
}

fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    fs::write(dir.join(name), content).unwrap();
    git_in(dir, &["add", name]);
    git_in(dir, &["commit", "-m", message]);
}

struct Silent;

impl SetupObserver for Silent {
    fn step_failed(&self, _name: &str, _error: &anyhow::Error) -> FailureDecision {
        FailureDecision::Abort
    }
}

#[tokio::test]
async fn create_setup_observe_cleanup_roundtrip() {
    let repo = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    init_repo(repo.path());
    fs::write(repo.path().join(".env"), "SECRET=1\n").unwrap();

    let config = Config {
        worktree_base: Some(base.path().to_path_buf()),
        ..Config::default()
    };
    let git = GitService::new(repo.path());
    let worktrees = WorktreeService::new(git.clone(), config.clone());

    // Create a worktree for a new branch and run the setup pipeline on it.
    let created = worktrees
        .create(&CreateOptions {
            branch: "feat/login".to_string(),
            base_branch: Some("main".to_string()),
            new_branch: true,
            custom_path: None,
        })
        .await
        .unwrap();
    assert!(created.join("README.md").exists());

    SetupPipeline::new(git.clone(), config.clone())
        .run(
            &created,
            SetupOptions {
                copy_env_files: true,
                install_deps: false,
            },
            &Silent,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        fs::read_to_string(created.join(".env")).unwrap(),
        "SECRET=1\n"
    );

    // The fresh branch sits at the trunk head: idle, never merged.
    let cards = worktrees.get_all(false).await;
    assert_eq!(cards.len(), 2);
    let card = cards.iter().find(|c| c.display_name == "feat/login").unwrap();
    assert_eq!(card.state, WorktreeState::Idle);
    assert!(!card.is_main);

    // Land the branch and advance trunk; the worktree becomes merged.
    commit_file(&created, "login.rs", "fn login() {}\n", "add login");
    git_in(repo.path(), &["merge", "feat/login"]);
    commit_file(repo.path(), "other.txt", "x\n", "advance main");

    let cleanup = CleanupService::new(git, worktrees.clone(), config);
    let candidates = cleanup.analyze().await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].reason, CleanupReason::Merged);
    assert!(candidates[0].safe_to_delete);

    // Batch-remove the candidate; the view ends up trunk-only.
    let paths: Vec<PathBuf> = candidates
        .iter()
        .map(|c| c.worktree.record.path.clone())
        .collect();
    let result = cleanup.batch_remove(&paths).await;
    assert_eq!(result.succeeded.len(), 1);
    assert!(result.failed.is_empty());
    assert!(!created.exists());

    let cards = worktrees.get_all(false).await;
    assert_eq!(cards.len(), 1);
    assert!(cards[0].is_main);
}
