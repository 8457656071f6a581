use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "arbor",
    about = "Arbor content repository maintenance tool",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the record store
    #[arg(long, global = true, default_value = ".arbor")]
    pub store: PathBuf,

    /// Configuration file (defaults to <store>/arbor.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Workspace to operate on (defaults to the configured workspace)
    #[arg(short, long, global = true)]
    pub workspace: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a repository and its workspace root
    Init(InitArgs),
    /// Create a node at a path
    Add(AddArgs),
    /// Set or remove a property
    Set(SetArgs),
    /// List nodes below a path in pre-order
    Tree(TreeArgs),
    /// Split and merge children blocks to the given limits
    Optimize(OptimizeArgs),
    /// Verify every children block chain
    Check(CheckArgs),
    /// Show repository statistics
    Stats(StatsArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Repository name, hashed into every node key
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct AddArgs {
    /// Path of the new node, e.g. /docs/guide
    pub path: String,
    /// Initial property as NAME=VALUE (VALUE is JSON, or a plain string)
    #[arg(short, long = "prop")]
    pub props: Vec<String>,
}

#[derive(Args)]
pub struct SetArgs {
    /// Path of the node
    pub path: String,
    /// Property name
    pub name: String,
    /// Property value (JSON, or a plain string)
    pub value: Option<String>,
    /// Remove the property instead
    #[arg(long, conflicts_with = "value")]
    pub remove: bool,
}

#[derive(Args)]
pub struct TreeArgs {
    #[arg(default_value = "/")]
    pub path: String,
    /// Print each node's properties
    #[arg(short, long)]
    pub props: bool,
}

#[derive(Args)]
pub struct OptimizeArgs {
    /// Largest number of children per block
    #[arg(long)]
    pub max: Option<usize>,
    /// Smallest number of children per non-head block
    #[arg(long)]
    pub min: Option<usize>,
}

#[derive(Args)]
pub struct CheckArgs {}

#[derive(Args)]
pub struct StatsArgs {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::try_parse_from(["arbor", "init"]).unwrap();
        assert!(matches!(cli.command, Command::Init(_)));
        assert_eq!(cli.store, PathBuf::from(".arbor"));
    }

    #[test]
    fn parse_add_with_props() {
        let cli = Cli::try_parse_from(["arbor", "add", "/docs/guide", "-p", "title=Guide", "--prop", "rank=3"]).unwrap();
        if let Command::Add(args) = cli.command {
            assert_eq!(args.path, "/docs/guide");
            assert_eq!(args.props, vec!["title=Guide", "rank=3"]);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_set_remove() {
        let cli = Cli::try_parse_from(["arbor", "set", "/docs", "title", "--remove"]).unwrap();
        if let Command::Set(args) = cli.command {
            assert!(args.remove);
            assert!(args.value.is_none());
        } else { panic!("wrong command"); }
        assert!(Cli::try_parse_from(["arbor", "set", "/docs", "title", "x", "--remove"]).is_err());
    }

    #[test]
    fn parse_tree_defaults_to_root() {
        let cli = Cli::try_parse_from(["arbor", "tree"]).unwrap();
        if let Command::Tree(args) = cli.command {
            assert_eq!(args.path, "/");
            assert!(!args.props);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_optimize_limits() {
        let cli = Cli::try_parse_from(["arbor", "optimize", "--max", "100", "--min", "20"]).unwrap();
        if let Command::Optimize(args) = cli.command {
            assert_eq!(args.max, Some(100));
            assert_eq!(args.min, Some(20));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from([
            "arbor", "check", "--store", "/tmp/repo", "-w", "staging", "--verbose", "--format", "json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Check(_)));
        assert_eq!(cli.store, PathBuf::from("/tmp/repo"));
        assert_eq!(cli.workspace.as_deref(), Some("staging"));
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
    }
}
