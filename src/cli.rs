use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "wiz",
    about = "Wiz CLI: resolve package requests into deterministic environments",
    version,
    long_about = None
)]
pub struct Cli {
    /// Output format for machine readability.
    #[arg(long, global = true, default_value_t = OutputFormat::Text, value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve package requests and print the environment context.
    Use(UseArgs),
    /// Decode the WIZ_CONTEXT snapshot from the calling environment.
    Context(ContextArgs),
    /// List the command aliases known to the registries.
    Commands(CommandsArgs),
}

#[derive(Args, Debug)]
pub struct UseArgs {
    /// Package requests, e.g. "maya::mtoa[gpu] >=2, <3".
    #[arg(value_name = "REQUEST", required = true)]
    pub requests: Vec<String>,

    /// Registry directories to resolve against; later ones take
    /// precedence. Overrides the configured chain.
    #[arg(long = "registry", value_name = "PATH")]
    pub registries: Vec<PathBuf>,

    /// Maximum downgrade attempts before giving up.
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<usize>,

    /// Maximum variant combinations to explore.
    #[arg(long, value_name = "N")]
    pub max_combinations: Option<usize>,

    /// Skip auto-use packages.
    #[arg(long)]
    pub no_implicit: bool,
}

#[derive(Args, Debug)]
pub struct ContextArgs {
    /// Decode this value instead of reading WIZ_CONTEXT.
    #[arg(value_name = "ENCODED")]
    pub encoded: Option<String>,
}

#[derive(Args, Debug)]
pub struct CommandsArgs {
    /// Registry directories to scan; later ones take precedence.
    #[arg(long = "registry", value_name = "PATH")]
    pub registries: Vec<PathBuf>,
}
