use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "floe",
    version,
    about = "Pack directory trees into bags for cold object storage",
    after_help = "\
Every command is a dry run unless --run is given.

Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $FLOE_CONFIG                (environment variable)
  3. ./floe.yaml                 (project)
  4. $XDG_CONFIG_HOME/floe/config.yaml or ~/.config/floe/config.yaml
  5. /etc/floe/config.yaml

Environment variables:
  FLOE_CONFIG       Path to configuration file (overrides default search)
  RUST_LOG          Log filter (overrides -v)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides FLOE_CONFIG and default search)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Perform remote and inventory changes instead of printing the plan
    #[arg(long, global = true)]
    pub run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Scan branches and upload new or changed atoms
    Mirror {
        /// Only this branch (path or name)
        #[arg(short, long)]
        branch: Option<String>,

        /// Skip branches whose scan interval has not elapsed
        #[arg(long)]
        due_only: bool,
    },

    /// Delete bags and queue their atoms for re-upload
    Reset {
        #[command(subcommand)]
        target: ResetCommand,

        /// Drop the atoms from the inventory instead of re-uploading them
        #[arg(long, global = true)]
        forget: bool,

        /// Delete bags still inside the minimum retention period
        #[arg(long, global = true)]
        allow_early_delete: bool,

        /// Skip interactive confirmation (for scripting)
        #[arg(short, long, global = true)]
        yes: bool,
    },

    /// Re-pool atoms into fresh, tightly filled bags
    Repack {
        /// Only this branch (path or name)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Delete remote bags the inventory no longer references
    Prune,

    /// Compare the inventory with the remote listing
    Audit,

    /// Search manifests for a file name
    Find {
        /// Case-insensitive substring
        term: String,
    },

    /// Thaw, download and unpack archived data
    Restore {
        #[command(subcommand)]
        command: RestoreCommand,
    },

    /// Inspect the inventory
    Show {
        #[command(subcommand)]
        command: ShowCommand,
    },

    /// Print storage cost and waste figures
    Report,

    /// Keep an atom's bags in place through mirror and repack
    Pin {
        /// Atom logical path
        atom: String,
    },

    /// Release a pinned atom
    Unpin {
        /// Atom logical path
        atom: String,
    },

    /// Remove a stale inventory lock left by a killed process
    BreakLock,

    /// Print a starter configuration file
    Config {
        /// Write the template to this path instead of stdout
        #[arg(short, long)]
        dest: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ResetCommand {
    /// Reset specific bags (e.g. 7, bag_00007)
    Bag {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Reset every bag of a branch
    Branch { branch: String },
}

#[derive(Subcommand)]
pub(crate) enum RestoreCommand {
    /// Restore a file or directory as listed in manifests
    File {
        path: String,
        #[command(flatten)]
        opts: RestoreArgs,
    },
    /// Restore whole bags
    Bag {
        #[arg(required = true)]
        ids: Vec<String>,
        #[command(flatten)]
        opts: RestoreArgs,
    },
    /// Restore every bag of a branch
    Branch {
        branch: String,
        #[command(flatten)]
        opts: RestoreArgs,
    },
    /// Restore the whole archive
    Tree {
        #[command(flatten)]
        opts: RestoreArgs,
    },
    /// List recorded restore jobs
    Status,
    /// Forget finished restore jobs
    Clear,
}

#[derive(clap::Args)]
pub(crate) struct RestoreArgs {
    /// Destination directory
    #[arg(short, long)]
    pub dest: String,

    /// Thaw tier (expedited, standard, bulk)
    #[arg(short, long)]
    pub tier: Option<String>,

    /// Days the thawed copy stays readable
    #[arg(long)]
    pub days: Option<u32>,
}

#[derive(Subcommand)]
pub(crate) enum ShowCommand {
    /// All branches with atom and bag counts
    Tree,
    /// Atoms of one branch
    Branch { branch: String },
    /// One bag
    Bag { id: String },
    /// One atom
    Atom { path: String },
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Commands::Mirror { .. } => "mirror",
            Commands::Reset { .. } => "reset",
            Commands::Repack { .. } => "repack",
            Commands::Prune => "prune",
            Commands::Audit => "audit",
            Commands::Find { .. } => "find",
            Commands::Restore { .. } => "restore",
            Commands::Show { .. } => "show",
            Commands::Report => "report",
            Commands::Pin { .. } => "pin",
            Commands::Unpin { .. } => "unpin",
            Commands::BreakLock => "break-lock",
            Commands::Config { .. } => "config",
        }
    }
}
