//! cnnzoo command line interface.

mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands};

fn main() -> commands::CliResult<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "cnnzoo=debug" } else { "cnnzoo=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut out = std::io::stdout();
    match &cli.command {
        Commands::Inspect(args) => commands::inspect(args, &mut out),
        Commands::Run(args) => commands::run(args, &mut out),
        Commands::List => commands::list(&mut out),
    }
}
