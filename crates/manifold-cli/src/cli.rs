use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "manifold",
    version,
    about = "Redundant, content-addressed backups across independent storage services",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $MANIFOLD_CONFIG            (environment variable)
  3. ./manifold.yaml             (project)
  4. ~/.config/manifold/config.yaml (user)
  5. /etc/manifold/config.yaml   (system)

Most commands accept --service <nickname> to address one configured
service; without it (or with --service all) they span every service."
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides MANIFOLD_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List every tracked file across services
    List {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Report which service holds the given content hashes
    Has {
        /// Content hashes, e.g. xxh64:ed496289a15cd4cf
        #[arg(required = true)]
        hashes: Vec<String>,
    },

    /// Store files; content already held anywhere is not re-uploaded
    Put {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,

        /// Files to store
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Retrieve a file by name, id, or content hash
    Get {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,

        /// Names, UUIDs, or content hashes
        #[arg(required = true)]
        identifiers: Vec<String>,

        /// Directory to download into (default: current directory)
        #[arg(short, long, default_value = ".")]
        dest: String,
    },

    /// Remove a file and its stored bytes from every service holding it
    Remove {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,

        /// Name, UUID, or content hash
        identifier: String,

        /// Skip interactive confirmation (for scripting)
        #[arg(long)]
        yes: bool,
    },

    /// Edit tags on tracked files
    Tag {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,

        /// Files to edit (name, UUID, or content hash each)
        #[arg(required = true)]
        identifiers: Vec<String>,

        /// Tags to add
        #[arg(short, long)]
        add: Vec<String>,

        /// Tags to remove
        #[arg(short, long)]
        remove: Vec<String>,

        /// Replace the whole tag set with these
        #[arg(long)]
        set: Option<Vec<String>>,
    },

    /// Search tracked files by name
    Search {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,

        query: String,

        /// Case-insensitive substring match instead of exact
        #[arg(short, long)]
        fuzzy: bool,
    },

    /// Show storage capacity per service and in aggregate
    Cap,

    /// Replicate content toward the computed target placement
    Sync {
        /// Perform the planned transfers instead of only printing them
        #[arg(long)]
        apply: bool,

        /// Skip interactive confirmation before transferring
        #[arg(long)]
        yes: bool,
    },

    /// Migrate catalogs to the current schema version and reload
    Refresh {
        /// Restrict to one service nickname
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Generate a minimal configuration file
    Config {
        /// Destination path (prints to stdout when omitted)
        #[arg(short, long)]
        dest: Option<String>,
    },
}

impl Commands {
    pub(crate) fn service(&self) -> Option<&str> {
        match self {
            Self::List { service, .. }
            | Self::Put { service, .. }
            | Self::Get { service, .. }
            | Self::Remove { service, .. }
            | Self::Tag { service, .. }
            | Self::Search { service, .. }
            | Self::Refresh { service, .. } => service.as_deref(),
            Self::Has { .. } | Self::Cap | Self::Sync { .. } | Self::Config { .. } => None,
        }
    }
}
