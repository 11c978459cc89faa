use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "nudgeflow", version, about = "Nudgeflow recommendation pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Signal ingestion and window processing
    Signal {
        #[command(subcommand)]
        action: commands::signal::SignalAction,
    },
    /// Run the pipeline for one user now
    Generate(commands::generate::GenerateArgs),
    /// Recommendation lifecycle
    Rec {
        #[command(subcommand)]
        action: commands::rec::RecAction,
    },
    /// Decision trace inspection
    Trace {
        #[command(subcommand)]
        action: commands::trace::TraceAction,
    },
    /// Event classification table
    Classify {
        #[command(subcommand)]
        action: commands::classify::ClassifyAction,
    },
    /// Playbook outcome statistics
    Playbook {
        #[command(subcommand)]
        action: commands::playbook::PlaybookAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("NUDGEFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Signal { action } => commands::signal::run(action),
        Commands::Generate(args) => commands::generate::run(args),
        Commands::Rec { action } => commands::rec::run(action),
        Commands::Trace { action } => commands::trace::run(action),
        Commands::Classify { action } => commands::classify::run(action),
        Commands::Playbook { action } => commands::playbook::run(action),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
