//! ducksearch: serves SQL-defined reports as deterministic Parquet artifacts.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "ducksearch")]
#[command(about = "Serve SQL-defined reports as deterministic Parquet artifacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Deployment root (defaults to DUCKSEARCH_ROOT, then cwd)
        #[arg(long)]
        root: Option<String>,

        /// Bind host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Bind port
        #[arg(long, default_value = "8787")]
        port: u16,

        /// Tokio worker threads (default: 2 x logical cores)
        #[arg(long)]
        workers: Option<usize>,

        /// Enable the report-registry watcher for live reload
        #[arg(long)]
        dev: bool,
    },

    /// Validate every report under --root and report findings
    Lint {
        /// Deployment root (defaults to DUCKSEARCH_ROOT, then cwd)
        #[arg(long)]
        root: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Serve { root, host, port, workers, dev } => {
            commands::serve(root.as_deref(), &host, port, workers, dev)
        }
        Commands::Lint { root } => commands::lint(root.as_deref()),
    };

    std::process::exit(exit_code);
}
