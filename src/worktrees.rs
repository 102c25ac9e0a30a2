//! Cached worktree view and lifecycle state derivation.
//!
//! `WorktreeService` holds the last-known enriched view of every worktree.
//! Concurrent refreshes coalesce into a single underlying cycle, a failed
//! cycle keeps the previous view, and the cache is swapped wholesale so
//! readers never observe a partially-enriched card.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Config;
use crate::git::{AddOptions, CommitSummary, GitService, StatusSnapshot, WorktreeRecord};

/// Lifecycle classification, in priority order: a merged worktree is merged
/// even when it also has local changes or an old last commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeState {
    Merged,
    Active,
    Stale,
    Idle,
}

impl fmt::Display for WorktreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Merged => "merged",
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Idle => "idle",
        })
    }
}

/// The unit held in the cache: a worktree with everything derived about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeCard {
    pub record: WorktreeRecord,
    pub status: StatusSnapshot,
    pub last_commit: CommitSummary,
    pub state: WorktreeState,
    /// Whether this is the worktree at the repository root.
    pub is_main: bool,
    /// Branch short name, or the directory name for a branchless worktree.
    pub display_name: String,
}

/// Options for creating a worktree.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub branch: String,
    /// Starting point when creating a new branch.
    pub base_branch: Option<String>,
    /// Create the branch rather than checking out an existing one.
    pub new_branch: bool,
    /// Directory name or relative path under the base directory, instead of
    /// the sanitized branch name.
    pub custom_path: Option<String>,
}

/// A resolved worktree path landed outside the configured base directory.
/// This is a caller bug, caught before any git command runs.
#[derive(Debug, thiserror::Error)]
#[error("worktree path {} escapes base directory {}", path.display(), base.display())]
pub struct PathEscapesBase {
    pub path: PathBuf,
    pub base: PathBuf,
}

type SharedRefresh = Shared<BoxFuture<'static, Arc<Vec<WorktreeCard>>>>;

/// Stateful worktree view over a [`GitService`].
#[derive(Clone)]
pub struct WorktreeService {
    inner: Arc<Inner>,
}

struct Inner {
    git: GitService,
    config: Config,
    cache: Mutex<Arc<Vec<WorktreeCard>>>,
    /// The currently running refresh, if any. Concurrent callers await this
    /// same future instead of starting duplicate subprocess work.
    in_flight: Mutex<Option<SharedRefresh>>,
    changed: broadcast::Sender<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorktreeService {
    pub fn new(git: GitService, config: Config) -> Self {
        let (changed, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                git,
                config,
                cache: Mutex::new(Arc::new(Vec::new())),
                in_flight: Mutex::new(None),
                changed,
            }),
        }
    }

    /// Current view, refreshing first when the cache is empty or `force` is
    /// set.
    pub async fn get_all(&self, force: bool) -> Arc<Vec<WorktreeCard>> {
        let cached = Arc::clone(&lock(&self.inner.cache));
        if !cached.is_empty() && !force {
            return cached;
        }
        self.refresh().await
    }

    /// Subscribe to the change signal fired once per completed refresh cycle.
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.changed.subscribe()
    }

    /// Rebuild the cached view.
    ///
    /// Concurrent callers share one underlying cycle and receive the same
    /// result. A failed cycle keeps and returns the previous view; this
    /// method never surfaces an error.
    pub async fn refresh(&self) -> Arc<Vec<WorktreeCard>> {
        let fut = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let fut = run_refresh(Arc::clone(&self.inner)).boxed().shared();
                    *in_flight = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    /// Create a worktree for `branch` under the configured base directory.
    ///
    /// The directory name is the caller-supplied relative path or a sanitized
    /// form of the branch name. The resolved path must stay within the base
    /// directory.
    pub async fn create(&self, options: &CreateOptions) -> Result<PathBuf> {
        let repo_root = self
            .inner
            .git
            .repo_root()
            .await
            .context("failed to resolve repository root")?;
        let base = match &self.inner.config.worktree_base {
            Some(base) => normalize_path(base),
            None => repo_root.parent().unwrap_or(&repo_root).to_path_buf(),
        };
        let dir_name = options
            .custom_path
            .clone()
            .unwrap_or_else(|| sanitize_branch_name(&options.branch));
        let path = normalize_path(&base.join(&dir_name));
        if !path.starts_with(&base) {
            return Err(PathEscapesBase { path, base }.into());
        }

        self.inner
            .git
            .add_worktree(
                &path,
                &options.branch,
                &AddOptions {
                    new_branch: options.new_branch,
                    base_branch: options.base_branch.clone(),
                },
            )
            .await
            .with_context(|| format!("failed to add worktree at {}", path.display()))?;

        self.refresh().await;
        Ok(path)
    }

    /// Remove the worktree at `path` and rebuild the view.
    pub async fn remove(&self, path: &Path, force: bool) -> Result<()> {
        self.inner
            .git
            .remove_worktree(path, force)
            .await
            .with_context(|| format!("failed to remove worktree at {}", path.display()))?;
        self.refresh().await;
        Ok(())
    }
}

/// One full refresh cycle, clearing the in-flight slot when done.
async fn run_refresh(inner: Arc<Inner>) -> Arc<Vec<WorktreeCard>> {
    let cards = match inner.refresh_cycle().await {
        Ok(cards) => {
            let cards = Arc::new(cards);
            *lock(&inner.cache) = Arc::clone(&cards);
            let _ = inner.changed.send(());
            cards
        }
        Err(err) => {
            warn!("worktree refresh failed, keeping previous view: {err:#}");
            Arc::clone(&lock(&inner.cache))
        }
    };
    *lock(&inner.in_flight) = None;
    cards
}

impl Inner {
    async fn refresh_cycle(&self) -> Result<Vec<WorktreeCard>> {
        let worktrees = self
            .git
            .list_worktrees()
            .await
            .context("failed to list worktrees")?;

        let repo_root = match self.git.repo_root().await {
            Ok(root) => root,
            Err(err) => {
                debug!("could not resolve repository root, using first worktree: {err}");
                worktrees
                    .first()
                    .map(|wt| wt.path.clone())
                    .unwrap_or_default()
            }
        };

        let trunk_branch = self.trunk_branch(&worktrees).await;
        let trunk_head = worktrees
            .first()
            .map(|wt| wt.head.clone())
            .unwrap_or_default();
        let merged = self
            .merged_branches(&worktrees, &trunk_branch, &trunk_head)
            .await;

        let cards = join_all(
            worktrees
                .into_iter()
                .map(|wt| self.build_card(wt, &repo_root, &merged)),
        )
        .await;

        Ok(cards)
    }

    /// The branch merge comparisons run against: the first-listed worktree's
    /// branch (the underlying tool always lists the main worktree first), or
    /// a conventional default when that worktree is branchless.
    async fn trunk_branch(&self, worktrees: &[WorktreeRecord]) -> String {
        if let Some(first) = worktrees.first()
            && first.branch.is_some()
        {
            return first.branch_short.clone();
        }

        let locals = self.git.list_local_branches().await.unwrap_or_default();
        for candidate in ["main", "master", "develop"] {
            if locals.iter().any(|b| b.name == candidate) {
                return candidate.to_string();
            }
        }
        "main".to_string()
    }

    /// Short names of branches whose work is already contained in trunk.
    ///
    /// A worktree whose head equals the trunk head is excluded: a branch
    /// freshly cut from trunk has zero divergence and would pass the ancestor
    /// check despite never having been merged. Checks run concurrently and an
    /// individual failure counts as "not merged".
    async fn merged_branches(
        &self,
        worktrees: &[WorktreeRecord],
        trunk_branch: &str,
        trunk_head: &str,
    ) -> HashSet<String> {
        let checks = worktrees
            .iter()
            .skip(1)
            .filter(|wt| wt.branch.is_some() && wt.head != trunk_head)
            .map(|wt| {
                let branch = wt.branch_short.clone();
                async move {
                    self.git
                        .is_ancestor(&branch, trunk_branch)
                        .await
                        .then_some(branch)
                }
            });

        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn build_card(
        &self,
        record: WorktreeRecord,
        repo_root: &Path,
        merged: &HashSet<String>,
    ) -> WorktreeCard {
        let (status, last_commit) = tokio::join!(
            self.git.status(&record.path),
            self.git.last_commit(&record.path),
        );
        let status = status.unwrap_or_else(|err| {
            debug!("status unavailable for {}: {err}", record.path.display());
            StatusSnapshot::default()
        });
        let last_commit = last_commit.unwrap_or_else(|err| {
            debug!(
                "last commit unavailable for {}: {err}",
                record.path.display()
            );
            CommitSummary::missing()
        });

        let state = self.classify(&record, &status, &last_commit, merged);
        let is_main = record.path == repo_root;
        let display_name = if record.branch_short.is_empty() {
            record
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            record.branch_short.clone()
        };

        WorktreeCard {
            record,
            status,
            last_commit,
            state,
            is_main,
            display_name,
        }
    }

    fn classify(
        &self,
        record: &WorktreeRecord,
        status: &StatusSnapshot,
        last_commit: &CommitSummary,
        merged: &HashSet<String>,
    ) -> WorktreeState {
        if record.branch.is_some() && merged.contains(&record.branch_short) {
            return WorktreeState::Merged;
        }
        if status.has_changes() {
            return WorktreeState::Active;
        }
        if staleness_days(&last_commit.date, self.config.stale_threshold_days).is_some() {
            return WorktreeState::Stale;
        }
        WorktreeState::Idle
    }
}

/// Days since `date` when it is older than `threshold_days`; `None` when the
/// timestamp is recent or unparseable.
pub(crate) fn staleness_days(date: &str, threshold_days: u32) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(date)
        .ok()?
        .with_timezone(&Utc);
    let now = Utc::now();
    (parsed < now - Duration::days(i64::from(threshold_days))).then(|| (now - parsed).num_days())
}

/// Replace path-hostile characters in a branch name with `-`.
pub fn sanitize_branch_name(branch: &str) -> String {
    const INVALID: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    branch
        .chars()
        .map(|c| if INVALID.contains(&c) { '-' } else { c })
        .collect()
}

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem (the target does not exist yet at creation time).
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
