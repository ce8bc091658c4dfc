// ABOUTME: sandflow binary entry point: argument parsing, logging setup, and dispatch
// ABOUTME: Errors are printed in red and turn into a non-zero exit status

use clap::{Parser, Subcommand};
use colored::*;
use sandflow_config::SANDFLOW_LOG;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(name = "sandflow")]
#[command(about = "Sandflow - orchestrate workflows across isolated execution units")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition file
    Run {
        /// Path to the workflow JSON file
        file: PathBuf,

        /// Provider backend (local or docker); defaults to SANDFLOW_PROVIDER or local
        #[arg(long)]
        provider: Option<String>,

        /// Docker image for new units; defaults to SANDFLOW_DOCKER_IMAGE
        #[arg(long)]
        image: Option<String>,

        /// Maximum units driven at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Whole-workflow deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Input payload as inline JSON, replacing the file's input
        #[arg(long)]
        input: Option<String>,

        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,

        /// Include the execution journal in the report
        #[arg(long)]
        events: bool,
    },
    /// Probe which provider backends are available
    Providers,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(SANDFLOW_LOG))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            file,
            provider,
            image,
            concurrency,
            deadline_secs,
            input,
            pretty,
            events,
        } => {
            cli::run::run_command(cli::run::RunArgs {
                file,
                provider,
                image,
                concurrency,
                deadline_secs,
                input,
                pretty,
                events,
            })
            .await
        }
        Commands::Providers => cli::providers::providers_command().await.map(|_| true),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}
