//! Deletion-candidate analysis and batch removal.
//!
//! Candidates are derived from a freshly refreshed view, never from stale
//! cache data. Batch removal runs strictly sequentially: parallel removals
//! would contend on the shared repository metadata lock.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::git::GitService;
use crate::worktrees::{WorktreeCard, WorktreeService, WorktreeState, staleness_days};

/// Why a worktree is recommended for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupReason {
    Merged,
    Stale,
    Prunable,
}

impl std::fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Merged => "merged",
            Self::Stale => "stale",
            Self::Prunable => "prunable",
        })
    }
}

/// A non-main worktree recommended for removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupCandidate {
    pub worktree: WorktreeCard,
    pub reason: CleanupReason,
    pub safe_to_delete: bool,
    /// Human-readable justification.
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Per-item outcomes of a batch removal. Both lists are populated even under
/// total or partial failure; this is a result value, not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<BatchFailure>,
}

/// Recommends and executes worktree deletions.
pub struct CleanupService {
    git: GitService,
    worktrees: WorktreeService,
    config: Config,
}

impl CleanupService {
    pub fn new(git: GitService, worktrees: WorktreeService, config: Config) -> Self {
        Self {
            git,
            worktrees,
            config,
        }
    }

    /// Derive deletion candidates. Always force-refreshes first; the main
    /// worktree is never a candidate.
    pub async fn analyze(&self) -> Vec<CleanupCandidate> {
        let cards = self.worktrees.get_all(true).await;
        let mut candidates = Vec::new();

        for card in cards.iter() {
            if card.is_main {
                continue;
            }

            if card.record.is_prunable {
                // The directory is already gone; any uncommitted work in it
                // is unreachable either way.
                candidates.push(CleanupCandidate {
                    worktree: card.clone(),
                    reason: CleanupReason::Prunable,
                    safe_to_delete: true,
                    details: "Worktree directory no longer exists on disk".to_string(),
                });
                continue;
            }

            let has_changes = card.status.has_changes();
            let change_count = card.status.modified + card.status.untracked;

            if card.state == WorktreeState::Merged {
                candidates.push(CleanupCandidate {
                    worktree: card.clone(),
                    reason: CleanupReason::Merged,
                    safe_to_delete: !has_changes,
                    details: if has_changes {
                        format!("Merged but has {change_count} uncommitted changes")
                    } else {
                        "Branch has been merged".to_string()
                    },
                });
            } else if let Some(days) =
                staleness_days(&card.last_commit.date, self.config.stale_threshold_days)
            {
                candidates.push(CleanupCandidate {
                    worktree: card.clone(),
                    reason: CleanupReason::Stale,
                    safe_to_delete: !has_changes,
                    details: format!("No commits for {days} days"),
                });
            }
        }

        candidates
    }

    /// Remove each path in order, isolating failures per item.
    ///
    /// A trailing metadata prune (errors ignored) and a single forced refresh
    /// happen only when at least one removal succeeded.
    pub async fn batch_remove(&self, paths: &[PathBuf]) -> BatchResult {
        let mut result = BatchResult::default();

        for path in paths {
            match self.git.remove_worktree(path, true).await {
                Ok(()) => result.succeeded.push(path.clone()),
                Err(err) => {
                    warn!("failed to remove worktree {}: {err}", path.display());
                    result.failed.push(BatchFailure {
                        path: path.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if !result.succeeded.is_empty() {
            if let Err(err) = self.git.prune_worktrees().await {
                warn!("worktree prune after batch removal failed: {err}");
            }
            self.worktrees.refresh().await;
        }

        result
    }
}
