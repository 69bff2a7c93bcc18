use clap::Parser;
use wiz::cli::Cli;
use wiz::commands::execute;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    execute(cli)
}
