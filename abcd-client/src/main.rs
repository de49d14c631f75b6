use clap::{Parser, Subcommand};
use tracing::Level;

mod commands;
mod report;

use commands::extract::ExtractCommands;
use commands::patch::PatchArgs;
use commands::repack::RepackArgs;

#[derive(Parser)]
#[command(
    name = "abcd",
    about = "Tool for ABCD game archives (idx/dat pairs)",
    version,
    long_about = "Extracts, rebuilds and patches the two-file ABCD game archive: a striped \
multi-channel index file paired with a block-chained data file of compressed payloads."
)]
struct Cli {
    /// Set the logging level
    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Read entries and metadata out of an existing archive
    #[command(subcommand)]
    Extract(ExtractCommands),

    /// Build a fresh archive from a directory tree or file list
    Repack(RepackArgs),

    /// Replace selected entries inside an existing archive
    Patch(PatchArgs),
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Extract(cmd) => commands::extract::handle(cmd),
        Commands::Repack(args) => commands::repack::handle(args),
        Commands::Patch(args) => commands::patch::handle(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
