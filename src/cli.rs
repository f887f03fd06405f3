//! Command-line surface (spec.md §6): `clap`-derived subcommands over the
//! `Workspace` façade.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "canary",
    version,
    about = "Discover, resolve, select, schedule, and run parameterized test cases."
)]
pub struct Cli {
    /// Workspace root; defaults to the current directory.
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the `.canary/` workspace anchor, if one doesn't already exist.
    Init,

    /// Discover test files under the given paths and register them as generators.
    Collect {
        /// Paths to scan, relative to the workspace root.
        paths: Vec<PathBuf>,
    },

    /// Regenerate the resolved spec set from previously collected generators.
    Generate,

    /// Select, schedule, and run test cases.
    Run {
        /// Pathspec patterns: a bare path narrows by file prefix, `/HEXPREFIX`
        /// narrows by spec id. Matches everything when omitted.
        patterns: Vec<String>,

        #[command(flatten)]
        select: SelectArgs,

        /// Narrow to a re-run strategy before applying the rule chain: one of
        /// `failed`, `changed`, `not_run`, `not_pass`, `all`.
        #[arg(long = "only")]
        only: Option<String>,

        /// Batch-partitioning scheme for a future `--batch` preview report; not yet
        /// wired into live dispatch.
        #[arg(long = "batch")]
        batch: Option<String>,

        /// Copy resource files into each case's directory instead of symlinking them.
        #[arg(long = "copy-all-resources")]
        copy_all_resources: bool,

        /// Global timeout override, in seconds, applied to every case this run.
        #[arg(long = "timeout")]
        timeout: Option<f64>,

        /// Stop dispatching new cases once one fails.
        #[arg(long = "fail-fast")]
        fail_fast: bool,

        /// Persist this run's mask decisions under a named selection tag.
        #[arg(long)]
        tag: Option<String>,

        /// Total CPU slots available to the resource pool.
        #[arg(long, default_value_t = 4)]
        cpus: u32,

        /// Total GPU slots available to the resource pool.
        #[arg(long, default_value_t = 0)]
        gpus: u32,

        /// Everything after `--` is passed verbatim to each test's command line.
        #[arg(last = true)]
        trailing_args: Vec<String>,
    },

    /// Re-run cases against the full spec set under a re-run strategy, skipping any
    /// spec whose upstream dependency isn't itself included.
    Rerun {
        /// One of `all`, `failed`, `not_run`, `not_pass`, `changed`.
        #[arg(long, default_value = "failed")]
        strategy: String,

        /// Total CPU slots available to the resource pool.
        #[arg(long, default_value_t = 4)]
        cpus: u32,

        /// Total GPU slots available to the resource pool.
        #[arg(long, default_value_t = 0)]
        gpus: u32,
    },

    /// Manage named selection snapshots.
    Selection {
        #[command(subcommand)]
        action: SelectionAction,
    },

    /// Print captured stdout/stderr for the most recent result of a spec.
    Log {
        /// Spec id, or a unique hex prefix of one.
        id: String,
    },

    /// Print the latest recorded status for every known spec.
    History {
        /// Optional file-path prefix to narrow the listing.
        prefix: Option<String>,
    },

    /// Refresh the on-disk `<file>.parent/<spec>` latest-result view.
    View {
        #[command(subcommand)]
        action: ViewAction,
    },

    /// Print a summary table of the latest results.
    Report,
}

#[derive(Debug, Subcommand)]
pub enum SelectionAction {
    /// Save the current full spec set's selection rules under `tag`.
    Create {
        tag: String,
        #[command(flatten)]
        select: SelectArgs,
    },
    Rm { tag: String },
    Rename { from: String, to: String },
    List,
}

#[derive(Debug, Subcommand)]
pub enum ViewAction {
    Refresh,
}

#[derive(Debug, Args, Default)]
pub struct SelectArgs {
    /// Boolean keyword expressions (`fast and not slow`); all must match.
    #[arg(long = "keyword-expr")]
    pub keywords: Vec<String>,

    /// Parameter comparison expressions (`np>=2 and mode==sync`); all must match.
    #[arg(long = "parameter-expr")]
    pub params: Vec<String>,

    /// Only include specs owned by one of these owners.
    #[arg(long = "owners")]
    pub owners: Vec<String>,

    /// Only include specs whose file path starts with this prefix.
    #[arg(long = "file-prefix")]
    pub file_prefixes: Vec<String>,

    /// Only include specs whose id starts with one of these hex prefixes.
    #[arg(long = "id")]
    pub ids: Vec<String>,
}
