//! Git subprocess gateway.
//!
//! Every interaction with the repository goes through the `git` binary: this
//! module owns invocation (working directory, timeout, output cap) and the
//! parsing of each line-oriented output format the rest of the crate consumes.
//! It never interprets repository data itself beyond those formats.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard cap on captured stdout per invocation.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Timeout for read-only queries.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// `worktree add` checks out a full tree.
const ADD_TIMEOUT: Duration = Duration::from_secs(30);
/// `worktree remove` deletes from disk.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts for the forced-delete fallback on a locked worktree.
const FORCED_DELETE_ATTEMPTS: u32 = 3;
const FORCED_DELETE_RETRY_DELAY: Duration = Duration::from_millis(500);

const LOCAL_BRANCH_FORMAT: &str =
    "%(refname:short)\t%(upstream:short)\t%(upstream:track,nobracket)\t%(committerdate:iso-strict)";
const REMOTE_BRANCH_FORMAT: &str = "%(refname:short)\t%(committerdate:iso-strict)";
const COMMIT_FORMAT: &str = "%H%n%h%n%s%n%an%n%aI%n%ar";

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("i/o error running git: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {} timed out after {}ms", args.join(" "), timeout.as_millis())]
    Timeout { args: Vec<String>, timeout: Duration },
    #[error("git {} produced more than {MAX_OUTPUT_BYTES} bytes of output", args.join(" "))]
    OutputTooLarge { args: Vec<String> },
    #[error("git {} failed: {message}", args.join(" "))]
    Command {
        message: String,
        stderr: String,
        args: Vec<String>,
    },
    #[error(
        "could not remove {}: files appear to be held open by another program ({source})",
        path.display()
    )]
    WorktreeHeldOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub path: PathBuf,
    /// Full commit id of the checked-out HEAD.
    pub head: String,
    /// Fully qualified ref, or `None` for a detached HEAD.
    pub branch: Option<String>,
    /// Branch name without `refs/heads/`, falling back to the directory name.
    pub branch_short: String,
    pub is_bare: bool,
    pub is_detached: bool,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    /// The recorded directory no longer exists on disk.
    pub is_prunable: bool,
}

/// Working-tree counters from `git status --porcelain=v2 --branch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub modified: u32,
    pub staged: u32,
    pub untracked: u32,
    /// Commits ahead of upstream.
    pub ahead: u32,
    /// Commits behind upstream.
    pub behind: u32,
}

impl StatusSnapshot {
    pub fn has_changes(&self) -> bool {
        self.modified > 0 || self.staged > 0 || self.untracked > 0
    }
}

/// The last commit of a worktree, from a fixed six-field `git log -1` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub short_sha: String,
    /// Subject line only.
    pub message: String,
    pub author: String,
    /// Strict ISO-8601 author date.
    pub date: String,
    pub relative_date: String,
}

impl CommitSummary {
    /// The documented value for a worktree with no history. Carries the
    /// current time as its date so an empty worktree never counts as stale.
    pub fn missing() -> Self {
        Self {
            sha: String::new(),
            short_sha: String::new(),
            message: "No commits".to_string(),
            author: String::new(),
            date: chrono::Utc::now().to_rfc3339(),
            relative_date: "never".to_string(),
        }
    }
}

/// A local or remote ref from `git for-each-ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    pub is_remote: bool,
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub last_commit_date: String,
}

/// How `add_worktree` treats the branch argument.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Create the branch at the new worktree instead of checking out an
    /// existing one.
    pub new_branch: bool,
    /// Starting point for the new branch. Only ever applied together with
    /// `new_branch`.
    pub base_branch: Option<String>,
}

/// Invokes `git` with a fixed repository working directory.
#[derive(Debug, Clone)]
pub struct GitService {
    cwd: PathBuf,
}

impl GitService {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    // ── Worktree operations ─────────────────────────────────────────────

    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeRecord>, GitError> {
        let output = self.exec(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    pub async fn add_worktree(
        &self,
        path: &Path,
        branch: &str,
        options: &AddOptions,
    ) -> Result<(), GitError> {
        let args = worktree_add_args(path, branch, options);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec_with(&arg_refs, &self.cwd, ADD_TIMEOUT).await?;
        Ok(())
    }

    /// Remove the worktree at `path`.
    ///
    /// When git itself cannot delete the directory because another program
    /// holds files open inside it, falls back to a retrying recursive delete
    /// followed by `worktree prune`. Every other failure is returned as-is.
    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.display().to_string();
        let mut args = vec!["worktree", "remove", path_str.as_str()];
        if force {
            args.push("--force");
        }

        match self.exec_with(&args, &self.cwd, REMOVE_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(err) if is_permission_error(&err) => {
                warn!(
                    "git could not remove {}, falling back to forced delete: {err}",
                    path.display()
                );
                remove_dir_all_retrying(path)
                    .await
                    .map_err(|source| GitError::WorktreeHeldOpen {
                        path: path.to_path_buf(),
                        source,
                    })?;
                self.prune_worktrees().await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Drop metadata for worktrees whose directories are gone.
    pub async fn prune_worktrees(&self) -> Result<(), GitError> {
        self.exec(&["worktree", "prune"]).await?;
        Ok(())
    }

    // ── Branch operations ───────────────────────────────────────────────

    pub async fn list_local_branches(&self) -> Result<Vec<BranchRecord>, GitError> {
        let format = format!("--format={LOCAL_BRANCH_FORMAT}");
        let output = self.exec(&["for-each-ref", &format, "refs/heads/"]).await?;
        Ok(parse_local_branches(&output))
    }

    pub async fn list_remote_branches(&self) -> Result<Vec<BranchRecord>, GitError> {
        let format = format!("--format={REMOTE_BRANCH_FORMAT}");
        let output = self.exec(&["for-each-ref", &format, "refs/remotes/"]).await?;
        Ok(parse_remote_branches(&output))
    }

    /// Whether `branch` is reachable from `target` by following ancestry.
    ///
    /// Any failure (including a plain "no") answers `false`; callers treat an
    /// unanswerable merge question as "not merged".
    pub async fn is_ancestor(&self, branch: &str, target: &str) -> bool {
        self.exec(&["merge-base", "--is-ancestor", branch, target])
            .await
            .is_ok()
    }

    // ── Status operations ───────────────────────────────────────────────

    pub async fn status(&self, worktree: &Path) -> Result<StatusSnapshot, GitError> {
        let output = self
            .exec_with(
                &["status", "--porcelain=v2", "--branch"],
                worktree,
                DEFAULT_TIMEOUT,
            )
            .await?;
        Ok(parse_status(&output))
    }

    pub async fn last_commit(&self, worktree: &Path) -> Result<CommitSummary, GitError> {
        let format = format!("--format={COMMIT_FORMAT}");
        let output = self
            .exec_with(&["log", "-1", &format], worktree, DEFAULT_TIMEOUT)
            .await?;
        Ok(parse_commit(&output))
    }

    // ── Utility ─────────────────────────────────────────────────────────

    /// Canonical repository root (`rev-parse --show-toplevel`).
    pub async fn repo_root(&self) -> Result<PathBuf, GitError> {
        let output = self.exec(&["rev-parse", "--show-toplevel"]).await?;
        Ok(PathBuf::from(output.trim()))
    }

    // ── Internal ────────────────────────────────────────────────────────

    async fn exec(&self, args: &[&str]) -> Result<String, GitError> {
        self.exec_with(args, &self.cwd, DEFAULT_TIMEOUT).await
    }

    async fn exec_with(
        &self,
        args: &[&str],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<String, GitError> {
        debug!("git {} (cwd: {})", args.join(" "), cwd.display());

        let child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GitError::Timeout {
                    args: owned_args(args),
                    timeout,
                });
            }
        };

        if output.stdout.len() > MAX_OUTPUT_BYTES {
            return Err(GitError::OutputTooLarge {
                args: owned_args(args),
            });
        }

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let message = match output.status.code() {
                Some(code) => format!("exit status {code}: {}", stderr.trim()),
                None => format!("terminated by signal: {}", stderr.trim()),
            };
            Err(GitError::Command {
                message,
                stderr,
                args: owned_args(args),
            })
        }
    }
}

fn owned_args(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Build the argument vector for `git worktree add`.
///
/// New-branch mode creates `branch` at `path`, optionally from a base branch;
/// existing-branch mode checks `branch` out as-is. The base branch is only
/// ever applied when creating a new branch.
pub fn worktree_add_args(path: &Path, branch: &str, options: &AddOptions) -> Vec<String> {
    let mut args = vec!["worktree".to_string(), "add".to_string()];
    if options.new_branch {
        args.push("-b".to_string());
        args.push(branch.to_string());
        args.push(path.display().to_string());
        if let Some(base) = &options.base_branch {
            args.push(base.clone());
        }
    } else {
        args.push(path.display().to_string());
        args.push(branch.to_string());
    }
    args
}

/// Failure classes where git cannot delete because another program holds
/// files open inside the worktree.
const PERMISSION_PATTERNS: &[&str] = &["Permission denied", "EBUSY", "EPERM", "Resource busy"];

fn is_permission_error(err: &GitError) -> bool {
    let GitError::Command {
        message, stderr, ..
    } = err
    else {
        return false;
    };
    PERMISSION_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern) || stderr.contains(pattern))
}

async fn remove_dir_all_retrying(path: &Path) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt >= FORCED_DELETE_ATTEMPTS {
                    return Err(err);
                }
                tokio::time::sleep(FORCED_DELETE_RETRY_DELAY).await;
            }
        }
    }
}

// ── Parsers ─────────────────────────────────────────────────────────────

/// Parse `git worktree list --porcelain` output.
///
/// Blocks are separated by blank lines; a record is emitted only when both
/// the `worktree` and `HEAD` lines were present in its block.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeRecord> {
    let normalized = output.replace("\r\n", "\n");
    let mut records = Vec::new();

    for block in normalized.split("\n\n").filter(|b| !b.trim().is_empty()) {
        let mut path: Option<PathBuf> = None;
        let mut head: Option<String> = None;
        let mut branch: Option<String> = None;
        let mut is_bare = false;
        let mut is_detached = false;
        let mut is_locked = false;
        let mut lock_reason = None;
        let mut is_prunable = false;

        for line in block.trim().lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(h) = line.strip_prefix("HEAD ") {
                head = Some(h.to_string());
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.to_string());
            } else if line == "bare" {
                is_bare = true;
            } else if line == "detached" {
                is_detached = true;
            } else if let Some(rest) = line.strip_prefix("locked") {
                is_locked = true;
                let reason = rest.trim();
                if !reason.is_empty() {
                    lock_reason = Some(reason.to_string());
                }
            } else if line.starts_with("prunable") {
                // Emitted bare or with a trailing reason, like `locked`.
                is_prunable = true;
            }
        }

        let (Some(path), Some(head)) = (path, head) else {
            continue;
        };
        let branch_short = match &branch {
            Some(b) => b.strip_prefix("refs/heads/").unwrap_or(b).to_string(),
            None => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        records.push(WorktreeRecord {
            path,
            head,
            branch,
            branch_short,
            is_bare,
            is_detached,
            is_locked,
            lock_reason,
            is_prunable,
        });
    }

    records
}

/// Parse `git status --porcelain=v2 --branch` output.
///
/// Ordinary (`1`) and rename/copy (`2`) entries carry a two-character XY code
/// at a fixed offset: X counts toward staged, Y toward modified, `.` and `?`
/// count toward neither.
pub fn parse_status(output: &str) -> StatusSnapshot {
    static BRANCH_AB_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\+(\d+)\s+-(\d+)").expect("static pattern"));

    let mut snapshot = StatusSnapshot::default();

    for line in output.lines() {
        if line.starts_with("# branch.ab") {
            if let Some(captures) = BRANCH_AB_RE.captures(line) {
                snapshot.ahead = captures
                    .get(1)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);
                snapshot.behind = captures
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);
            }
        } else if line.starts_with("1 ") || line.starts_with("2 ") {
            let mut xy = line.chars().skip(2);
            let x = xy.next().unwrap_or('.');
            let y = xy.next().unwrap_or('.');
            if x != '.' && x != '?' {
                snapshot.staged += 1;
            }
            if y != '.' && y != '?' {
                snapshot.modified += 1;
            }
        } else if line.starts_with("? ") {
            snapshot.untracked += 1;
        }
    }

    snapshot
}

/// Parse the fixed six-line commit format (`%H%n%h%n%s%n%an%n%aI%n%ar`).
///
/// Anything shorter than six lines yields the documented "no commits" value
/// rather than an error.
pub fn parse_commit(output: &str) -> CommitSummary {
    let mut lines = output.trim().split('\n');
    let mut next = || lines.next().map(str::to_string);

    let (Some(sha), Some(short_sha), Some(message), Some(author), Some(date), Some(relative_date)) =
        (next(), next(), next(), next(), next(), next())
    else {
        return CommitSummary::missing();
    };

    CommitSummary {
        sha,
        short_sha,
        message,
        author,
        date,
        relative_date,
    }
}

/// Extract `ahead N` / `behind N` counts from an `%(upstream:track,nobracket)`
/// field. Either count may be absent, in any order; absent counts are zero.
pub fn parse_track(track: &str) -> (u32, u32) {
    static AHEAD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"ahead\s+(\d+)").expect("static pattern"));
    static BEHIND_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"behind\s+(\d+)").expect("static pattern"));

    let grab = |re: &Regex| {
        re.captures(track)
            .and_then(|captures| captures.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    (grab(&AHEAD_RE), grab(&BEHIND_RE))
}

fn parse_local_branches(output: &str) -> Vec<BranchRecord> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default().to_string();
            let upstream = fields.next().unwrap_or_default();
            let track = fields.next().unwrap_or_default();
            let date = fields.next().unwrap_or_default();
            let (ahead, behind) = parse_track(track);

            BranchRecord {
                name,
                is_remote: false,
                upstream: (!upstream.is_empty()).then(|| upstream.to_string()),
                ahead,
                behind,
                last_commit_date: branch_date(date),
            }
        })
        .collect()
}

fn parse_remote_branches(output: &str) -> Vec<BranchRecord> {
    output
        .lines()
        .filter(|line| !line.is_empty() && !line.contains("/HEAD"))
        .map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default().to_string();
            let date = fields.next().unwrap_or_default();

            BranchRecord {
                name,
                is_remote: true,
                upstream: None,
                ahead: 0,
                behind: 0,
                last_commit_date: branch_date(date),
            }
        })
        .collect()
}

fn branch_date(date: &str) -> String {
    if date.is_empty() {
        chrono::Utc::now().to_rfc3339()
    } else {
        date.to_string()
    }
}
