mod cmd;
mod output;
mod sink;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, queue::QueueSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "relay",
    about = "Inspect, drain, and configure a relay durable event queue",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file
    #[arg(long, global = true, env = "RELAY_CONFIG", default_value = "relay.yaml")]
    config: PathBuf,

    /// Queue database (overrides storage.path from the config)
    #[arg(long, global = true, env = "RELAY_DB")]
    db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log at info level
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and drain queued events
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let paths = cmd::Paths {
        config: cli.config,
        db: cli.db,
    };

    let result = match cli.command {
        Commands::Queue { subcommand } => cmd::queue::run(&paths, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&paths, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
