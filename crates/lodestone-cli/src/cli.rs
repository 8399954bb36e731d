//! Command-line surface

use clap::{Args, Parser, Subcommand, ValueEnum};
use lodestone_content::ContentType;
use lodestone_workspace::WorkspaceStrategy;
use std::path::PathBuf;

use crate::config::Overrides;

/// Parsed command line
#[derive(Debug, Parser)]
#[command(
    name = "lodestone",
    about = "Acquire game content from configured sources and build per-profile workspaces",
    version,
    long_about = "Searches catalogs, release feeds and local folders for maps, mods and patches, \
                  stores them in a content-addressable store and assembles per-profile workspaces \
                  from what has been acquired."
)]
pub struct Cli {
    /// Options accepted by every command
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "LODESTONE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for the manifest pool, store and workspaces
    #[arg(long, global = true, env = "LODESTONE_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Content store directory (defaults to <data-root>/cas)
    #[arg(long, global = true, env = "LODESTONE_CAS_ROOT")]
    pub store_root: Option<PathBuf>,

    /// Workspace directory (defaults to <data-root>/workspaces)
    #[arg(long, global = true, env = "LODESTONE_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Providers to skip, comma separated
    #[arg(
        long = "disable-provider",
        global = true,
        value_delimiter = ',',
        env = "LODESTONE_DISABLED_PROVIDERS"
    )]
    pub disabled_providers: Vec<String>,

    /// Re-hash store objects before trusting previously acquired content
    #[arg(long, global = true, env = "LODESTONE_VERIFY_EXISTING")]
    pub verify_existing: bool,

    /// Abort long operations after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(short = 'o', long, value_enum, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log format
    #[arg(long, value_enum, global = true, default_value = "text", env = "LODESTONE_LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl GlobalArgs {
    /// Configuration overrides carried by these flags
    pub fn overrides(&self, strategy: Option<WorkspaceStrategy>) -> Overrides {
        Overrides {
            data_root: self.data_root.clone(),
            store_root: self.store_root.clone(),
            workspace_root: self.workspace_root.clone(),
            strategy,
            disabled_providers: self.disabled_providers.clone(),
            verify_existing: self.verify_existing,
        }
    }
}

/// How command results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables
    Text,
    /// One JSON document per command
    Json,
}

/// How log lines are written to stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Plain text
    Text,
    /// One JSON object per line
    Json,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search every enabled provider
    Search(SearchArgs),

    /// Download, verify and register content
    Acquire {
        /// Manifest id, e.g. 1.communitymaps.map.desert-storm
        id: String,

        /// Search text used to find the id (defaults to its slug)
        #[arg(short, long)]
        query: Option<String>,
    },

    /// List acquired content
    List {
        /// Only this content type
        #[arg(short = 't', long = "type", value_parser = parse_content_type)]
        content_type: Option<ContentType>,
    },

    /// Re-check acquired content against the store
    Verify {
        /// Manifest id
        id: String,
    },

    /// Unregister acquired content; its files go at the next collection
    Remove {
        /// Manifest id
        id: String,
    },

    /// Show configured providers
    Providers,

    /// Build or refresh a profile's workspace
    Prepare {
        /// Profile name
        profile: String,

        /// Acquired manifest ids, lowest priority first
        #[arg(required = true)]
        ids: Vec<String>,

        /// How files are placed in the workspace
        #[arg(short, long, value_parser = parse_strategy)]
        strategy: Option<WorkspaceStrategy>,

        /// Rebuild even if the workspace is up to date
        #[arg(short, long)]
        force: bool,
    },

    /// Remove a profile's workspace
    Teardown {
        /// Profile name
        profile: String,
    },

    /// List profiles with a ready workspace
    Profiles,

    /// Delete unreferenced store objects
    Gc {
        /// Keep collecting every configured interval until interrupted
        #[arg(short, long)]
        watch: bool,
    },
}

/// Arguments of `search`
#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Free text matched against names, descriptions and tags
    pub term: Option<String>,

    /// Only this content type
    #[arg(short = 't', long = "type", value_parser = parse_content_type)]
    pub content_type: Option<ContentType>,

    /// Required tag; may be repeated
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Only this publisher
    #[arg(short, long)]
    pub publisher: Option<String>,

    /// Maximum number of results
    #[arg(short = 'n', long)]
    pub take: Option<usize>,
}

fn parse_content_type(value: &str) -> Result<ContentType, String> {
    ContentType::from_tag(value).ok_or_else(|| {
        let known: Vec<&str> = ContentType::ALL.iter().map(|t| t.tag()).collect();
        format!("unknown content type '{value}' (expected one of {})", known.join(", "))
    })
}

fn parse_strategy(value: &str) -> Result<WorkspaceStrategy, String> {
    value.parse().map_err(|e: lodestone_workspace::WorkspaceError| e.to_string())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search_and_prepare() {
        let cli = Cli::try_parse_from([
            "lodestone", "search", "desert", "--type", "map-pack", "--tag", "ctf", "-n", "5",
        ])
        .expect("parse search");
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.term.as_deref(), Some("desert"));
        assert_eq!(args.content_type, Some(ContentType::MapPack));
        assert_eq!(args.tags, vec!["ctf"]);
        assert_eq!(args.take, Some(5));

        let cli = Cli::try_parse_from([
            "lodestone",
            "prepare",
            "main",
            "1.acme.mod.base",
            "1.acme.mod.patch",
            "--strategy",
            "hardlink",
            "--disable-provider",
            "a,b",
        ])
        .expect("parse prepare");
        assert_eq!(cli.global.disabled_providers, vec!["a", "b"]);
        let Command::Prepare { ids, strategy, force, .. } = cli.command else {
            panic!("expected prepare");
        };
        assert_eq!(ids.len(), 2);
        assert_eq!(strategy, Some(WorkspaceStrategy::HardLink));
        assert!(!force);
    }

    #[test]
    fn test_parse_gc_watch() {
        let cli = Cli::try_parse_from(["lodestone", "gc"]).expect("parse gc");
        assert!(matches!(cli.command, Command::Gc { watch: false }));
        let cli = Cli::try_parse_from(["lodestone", "gc", "--watch"]).expect("parse gc --watch");
        assert!(matches!(cli.command, Command::Gc { watch: true }));
    }

    #[test]
    fn test_rejects_unknown_type_and_missing_ids() {
        assert!(Cli::try_parse_from(["lodestone", "list", "--type", "music"]).is_err());
        assert!(Cli::try_parse_from(["lodestone", "prepare", "main"]).is_err());
    }
}
