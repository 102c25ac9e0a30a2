use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "arbor",
    about = "Manage the worktrees of a git repository",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List worktrees with live status and lifecycle state.
    List {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Force a refresh before listing.
        #[arg(long)]
        refresh: bool,
    },

    /// Create a worktree and run the setup pipeline.
    Create {
        /// Branch to check out (created unless --existing is given).
        branch: String,

        /// Base branch for the new branch.
        #[arg(long)]
        base: Option<String>,

        /// Check out an existing branch instead of creating one.
        #[arg(long)]
        existing: bool,

        /// Directory name or relative path under the worktree base.
        #[arg(long)]
        path: Option<String>,

        /// Skip copying configured files into the new worktree.
        #[arg(long)]
        no_copy: bool,

        /// Run the configured post-create commands.
        #[arg(long)]
        install: bool,
    },

    /// Remove a worktree.
    Remove {
        path: PathBuf,

        /// Remove even with uncommitted changes.
        #[arg(long)]
        force: bool,
    },

    /// Show removal candidates, optionally deleting the safe ones.
    Cleanup {
        /// Remove every candidate judged safe to delete.
        #[arg(long)]
        apply: bool,

        /// Emit JSON instead of a report.
        #[arg(long)]
        json: bool,
    },

    /// Poll the repository and print worktree state transitions.
    Watch,
}
