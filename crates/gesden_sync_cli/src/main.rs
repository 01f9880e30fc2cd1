//! GESDEN sync CLI
//!
//! Command-line tools for the sync bridge journal.
//!
//! # Commands
//!
//! - `inspect` - Display journal statistics (pending operations, watermarks, bases)
//! - `verify` - Check that the journal will replay cleanly

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// GESDEN sync bridge maintenance tools.
#[derive(Parser)]
#[command(name = "gesden-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the operation journal
    #[arg(global = true, short, long)]
    journal: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display journal statistics and recovered state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check that every journal record parses and the file will replay
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.journal.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.journal.ok_or("Journal path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("gesden-sync {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
