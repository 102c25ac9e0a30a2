//! Post-creation setup pipeline.
//!
//! After a worktree is created, an ordered list of side-effect steps brings
//! it up to a workable state: env files copied from the trunk worktree,
//! heavyweight directories linked instead of rebuilt, and optional install
//! commands. Steps run strictly in order; cancellation is polled between
//! steps only, so a running step always completes and never leaves a
//! half-applied side effect mid-step.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::git::GitService;

/// What the operator chose after a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Proceed to the next step.
    Continue,
    /// Stop the pipeline.
    Abort,
}

/// Progress and failure-decision hooks for a pipeline run.
///
/// `step_failed` must answer whether the remaining steps should still run;
/// no failure is ever swallowed without passing through it.
pub trait SetupObserver: Send + Sync {
    fn step_started(&self, _index: usize, _total: usize, _name: &str) {}
    fn step_succeeded(&self, _name: &str) {}
    fn step_failed(&self, name: &str, error: &anyhow::Error) -> FailureDecision;
}

/// A single setup side effect. The set is closed: steps are built from
/// configuration before the run begins and carry everything they need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Copy the named files from the trunk worktree, skipping missing
    /// sources and creating destination directories as needed.
    CopyFiles(Vec<String>),
    /// Link the named directories from the trunk worktree, skipping missing
    /// sources and existing destinations.
    LinkDirs(Vec<String>),
    /// Run a shell command inside the new worktree.
    Run(String),
}

impl Step {
    /// Label shown while the step runs.
    pub fn name(&self) -> String {
        match self {
            Self::CopyFiles(files) => format!("Copying {}", files.join(", ")),
            Self::LinkDirs(dirs) => format!("Linking {}", dirs.join(", ")),
            Self::Run(command) => format!("Running: {command}"),
        }
    }

    async fn execute(&self, worktree: &Path, trunk: &Path) -> Result<()> {
        match self {
            Self::CopyFiles(files) => copy_files(trunk, worktree, files).await,
            Self::LinkDirs(dirs) => link_dirs(trunk, worktree, dirs).await,
            Self::Run(command) => run_command(worktree, command).await,
        }
    }
}

/// Caller-supplied switches for a pipeline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupOptions {
    pub copy_env_files: bool,
    pub install_deps: bool,
}

/// Builds and executes the post-creation step list.
pub struct SetupPipeline {
    git: GitService,
    config: Config,
}

impl SetupPipeline {
    pub fn new(git: GitService, config: Config) -> Self {
        Self { git, config }
    }

    /// The ordered step list for the given switches. May be empty.
    pub fn build_steps(&self, options: SetupOptions) -> Vec<Step> {
        let mut steps = Vec::new();

        if options.copy_env_files && !self.config.copy_files.is_empty() {
            steps.push(Step::CopyFiles(self.config.copy_files.clone()));
        }
        if !self.config.symlink_dirs.is_empty() {
            steps.push(Step::LinkDirs(self.config.symlink_dirs.clone()));
        }
        if options.install_deps {
            for command in &self.config.post_create_commands {
                steps.push(Step::Run(command.clone()));
            }
        }

        steps
    }

    /// Run the configured setup steps for a freshly created worktree.
    ///
    /// With zero steps this is a complete no-op. The trunk worktree is
    /// resolved from the live worktree list, never assumed to be the process
    /// working directory: the process may itself be running inside a
    /// secondary worktree.
    pub async fn run(
        &self,
        worktree_path: &Path,
        options: SetupOptions,
        observer: &dyn SetupObserver,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let steps = self.build_steps(options);
        if steps.is_empty() {
            return Ok(());
        }

        let trunk = self.trunk_path().await?;
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("setup pipeline cancelled before step {}", index + 1);
                break;
            }

            let name = step.name();
            observer.step_started(index, total, &name);

            match step.execute(worktree_path, &trunk).await {
                Ok(()) => {
                    debug!("setup step completed: {name}");
                    observer.step_succeeded(&name);
                }
                Err(err) => {
                    warn!("setup step failed: {name}: {err:#}");
                    if observer.step_failed(&name, &err) == FailureDecision::Abort {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn trunk_path(&self) -> Result<PathBuf> {
        let worktrees = self
            .git
            .list_worktrees()
            .await
            .context("failed to list worktrees")?;
        worktrees
            .into_iter()
            .next()
            .map(|wt| wt.path)
            .context("repository has no worktrees")
    }
}

async fn copy_files(source_dir: &Path, target_dir: &Path, files: &[String]) -> Result<()> {
    for file in files {
        let src = source_dir.join(file);
        let dest = target_dir.join(file);

        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            continue;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(&src, &dest)
            .await
            .with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))?;
    }
    Ok(())
}

async fn link_dirs(source_dir: &Path, target_dir: &Path, dirs: &[String]) -> Result<()> {
    for dir in dirs {
        let src = source_dir.join(dir);
        let dest = target_dir.join(dir);

        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            continue;
        }
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            continue;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        symlink_dir(&src, &dest)
            .with_context(|| format!("failed to link {} to {}", dest.display(), src.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dest)
}

#[cfg(windows)]
fn symlink_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(src, dest)
}

async fn run_command(worktree: &Path, command: &str) -> Result<()> {
    let status = shell_command(command)
        .current_dir(worktree)
        .status()
        .await
        .with_context(|| format!("failed to run `{command}`"))?;
    if !status.success() {
        bail!("`{command}` exited with {status}");
    }
    Ok(())
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use std::sync::Mutex;

    use tempfile::TempDir;

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

    fn add_worktree(repo: &Path, base: &Path, branch: &str) -> PathBuf {
        let path = base.join(branch);
        Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(["worktree", "add", "-b", branch])
            .arg(&path)
            .output()
            .unwrap();
        path
    }

    /// Records progress; answers every failure with a fixed decision.
    struct Recording {
        decision: FailureDecision,
        started: Mutex<Vec<String>>,
        failed: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(decision: FailureDecision) -> Self {
            Self {
                decision,
                started: Mutex::new(Vec::new()),
                failed: Mutex::new(Vec::new()),
            }
        }
    }

    impl SetupObserver for Recording {
        fn step_started(&self, _index: usize, _total: usize, name: &str) {
            self.started.lock().unwrap().push(name.to_string());
        }

        fn step_failed(&self, name: &str, _error: &anyhow::Error) -> FailureDecision {
            self.failed.lock().unwrap().push(name.to_string());
            self.decision
        }
    }

    fn pipeline(repo: &Path, config: Config) -> SetupPipeline {
        SetupPipeline::new(GitService::new(repo), config)
    }

    #[test]
    fn build_steps_empty_without_flags_or_config() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            copy_files: Vec::new(),
            ..Config::default()
        };
        let steps = pipeline(dir.path(), config).build_steps(SetupOptions {
            copy_env_files: true,
            install_deps: true,
        });
        assert!(steps.is_empty());
    }

    #[test]
    fn build_steps_orders_copy_link_run() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            symlink_dirs: vec!["node_modules".to_string()],
            post_create_commands: vec!["pnpm install".to_string(), "pnpm build".to_string()],
            ..Config::default()
        };
        let steps = pipeline(dir.path(), config).build_steps(SetupOptions {
            copy_env_files: true,
            install_deps: true,
        });

        assert_eq!(steps.len(), 4);
        assert!(matches!(steps[0], Step::CopyFiles(_)));
        assert!(matches!(steps[1], Step::LinkDirs(_)));
        assert_eq!(steps[2], Step::Run("pnpm install".to_string()));
        assert_eq!(steps[3], Step::Run("pnpm build".to_string()));
    }

    #[test]
    fn build_steps_gates_on_flags() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            post_create_commands: vec!["pnpm install".to_string()],
            ..Config::default()
        };
        let steps = pipeline(dir.path(), config).build_steps(SetupOptions {
            copy_env_files: false,
            install_deps: false,
        });
        assert!(steps.is_empty());
    }

    #[tokio::test]
    async fn zero_steps_is_a_no_op() {
        // No git repository needed: the trunk lookup must not even run.
        let dir = TempDir::new().unwrap();
        let config = Config {
            copy_files: Vec::new(),
            ..Config::default()
        };
        let observer = Recording::new(FailureDecision::Abort);

        pipeline(dir.path(), config)
            .run(
                dir.path(),
                SetupOptions::default(),
                &observer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(observer.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn copies_env_files_skipping_missing() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        fs::write(repo.path().join(".env"), "SECRET=1\n").unwrap();

        let observer = Recording::new(FailureDecision::Abort);
        pipeline(repo.path(), Config::default())
            .run(
                &wt,
                SetupOptions {
                    copy_env_files: true,
                    install_deps: false,
                },
                &observer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(wt.join(".env")).unwrap(), "SECRET=1\n");
        // `.env.local` was configured but missing at the source: skipped.
        assert!(!wt.join(".env.local").exists());
        assert!(observer.failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn copies_nested_files_creating_parents() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        fs::create_dir_all(repo.path().join("config")).unwrap();
        fs::write(repo.path().join("config/.env.local"), "NESTED=1\n").unwrap();
        let config = Config {
            copy_files: vec!["config/.env.local".to_string()],
            ..Config::default()
        };

        pipeline(repo.path(), config)
            .run(
                &wt,
                SetupOptions {
                    copy_env_files: true,
                    install_deps: false,
                },
                &Recording::new(FailureDecision::Abort),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(wt.join("config/.env.local")).unwrap(),
            "NESTED=1\n"
        );
    }

    #[tokio::test]
    async fn links_directories_and_skips_existing_destinations() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        fs::create_dir_all(repo.path().join("node_modules/dep")).unwrap();
        fs::create_dir_all(wt.join("target")).unwrap();
        fs::write(wt.join("target/keep.txt"), "mine\n").unwrap();
        fs::create_dir_all(repo.path().join("target")).unwrap();

        let config = Config {
            copy_files: Vec::new(),
            symlink_dirs: vec![
                "node_modules".to_string(),
                "target".to_string(),
                "missing".to_string(),
            ],
            ..Config::default()
        };

        pipeline(repo.path(), config)
            .run(
                &wt,
                SetupOptions::default(),
                &Recording::new(FailureDecision::Abort),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(wt.join("node_modules").is_symlink());
        assert!(wt.join("node_modules/dep").exists());
        // Existing destination untouched, missing source skipped.
        assert!(!wt.join("target").is_symlink());
        assert!(wt.join("target/keep.txt").exists());
        assert!(!wt.join("missing").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_commands_in_the_new_worktree() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        let config = Config {
            copy_files: Vec::new(),
            post_create_commands: vec!["echo ran > marker.txt".to_string()],
            ..Config::default()
        };

        pipeline(repo.path(), config)
            .run(
                &wt,
                SetupOptions {
                    copy_env_files: false,
                    install_deps: true,
                },
                &Recording::new(FailureDecision::Abort),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(wt.join("marker.txt").exists());
        assert!(!repo.path().join("marker.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abort_decision_stops_remaining_steps() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        let config = Config {
            copy_files: Vec::new(),
            post_create_commands: vec!["false".to_string(), "touch after.txt".to_string()],
            ..Config::default()
        };

        let observer = Recording::new(FailureDecision::Abort);
        pipeline(repo.path(), config)
            .run(
                &wt,
                SetupOptions {
                    copy_env_files: false,
                    install_deps: true,
                },
                &observer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(observer.failed.lock().unwrap().len(), 1);
        assert_eq!(observer.started.lock().unwrap().len(), 1);
        assert!(!wt.join("after.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn continue_decision_runs_remaining_steps() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        let config = Config {
            copy_files: Vec::new(),
            post_create_commands: vec!["false".to_string(), "touch after.txt".to_string()],
            ..Config::default()
        };

        let observer = Recording::new(FailureDecision::Continue);
        pipeline(repo.path(), config)
            .run(
                &wt,
                SetupOptions {
                    copy_env_files: false,
                    install_deps: true,
                },
                &observer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(observer.failed.lock().unwrap().len(), 1);
        assert!(wt.join("after.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_before_first_step_runs_nothing() {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        init_repo(repo.path());
        let wt = add_worktree(repo.path(), base.path(), "feature");

        fs::write(repo.path().join(".env"), "SECRET=1\n").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let observer = Recording::new(FailureDecision::Abort);
        pipeline(repo.path(), Config::default())
            .run(
                &wt,
                SetupOptions {
                    copy_env_files: true,
                    install_deps: false,
                },
                &observer,
                &cancel,
            )
            .await
            .unwrap();

        assert!(observer.started.lock().unwrap().is_empty());
        assert!(!wt.join(".env").exists());
    }
}
