use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative infrastructure orchestration with automatic rollback", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// State database (defaults to strata.db in the state directory)
    #[arg(long, global = true, env = "STRATA_DB", value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Plan the changes needed to bring a stack to a template
    Plan(PlanArgs),

    /// Apply a template or a stored change set
    Apply(ApplyArgs),

    /// Delete every resource of a stack, then the stack
    Destroy(DestroyArgs),

    /// Compare provisioned resources with what their providers report
    Drift(DriftArgs),

    /// Show all stacks, or one stack in detail
    Status(StatusArgs),

    /// Show the operation journal of a stack
    Journal(JournalArgs),

    /// Finish an interrupted run or a failed rollback
    Recover(RecoverArgs),

    /// Drop a stored change set without applying it
    Discard {
        /// Change set identifier
        change_set: String,
    },

    /// Break a stack lease left behind by a process that died
    Unlock {
        /// Stack identifier
        stack: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct PlanArgs {
    /// Stack identifier
    pub stack: String,

    /// Template file (.json or .toml)
    pub template: PathBuf,

    /// Print the change set as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
#[command(group = clap::ArgGroup::new("source").required(true).args(["template", "change_set"]))]
pub struct ApplyArgs {
    /// Stack identifier
    pub stack: String,

    /// Plan this template and apply it
    #[arg(short, long)]
    pub template: Option<PathBuf>,

    /// Apply a change set created by `plan`
    #[arg(short, long)]
    pub change_set: Option<String>,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Number of parallel provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Stack identifier
    pub stack: String,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Number of parallel provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct DriftArgs {
    /// Stack identifier
    pub stack: String,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Stack identifier (all stacks when omitted)
    pub stack: Option<String>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct JournalArgs {
    /// Stack identifier
    pub stack: String,

    /// Only entries of this run (prefix match)
    #[arg(short, long)]
    pub run: Option<String>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct RecoverArgs {
    /// Stack identifier
    pub stack: String,

    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,
}
