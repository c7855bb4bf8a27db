use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use nlquery::backend::{Backend, DialectFamily};
use nlquery::{Config, Orchestrator, TranslateRequest};

/// Translate natural-language requests into backend queries
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a query for a request, optionally running it
    Translate {
        /// The request, in plain language
        text: String,
        /// Backend id (postgres, cockroachdb, redshift, mysql, couchdb, neo4j, graphql)
        #[arg(long)]
        backend: Backend,
        /// Dialect family the caller expects the backend to speak
        #[arg(long)]
        family: Option<DialectFamily>,
        /// Profile name (defaults to the first profile for the backend)
        #[arg(long)]
        profile: Option<String>,
        /// Execute the generated query
        #[arg(long)]
        execute: bool,
    },
    /// Re-introspect a profile's schema
    Refresh {
        profile: String,
    },
    /// Drop a profile's cached schema
    Invalidate {
        profile: String,
    },
    /// List supported backends
    Backends,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    if let Command::Backends = cli.command {
        return print_json(&nlquery::backend::descriptors());
    }

    let orchestrator = Orchestrator::from_config(&config)
        .with_context(|| format!("Failed to initialize from {}", config_path.display()))?;

    let succeeded = match cli.command {
        Command::Translate {
            text,
            backend,
            family,
            profile,
            execute,
        } => {
            let request = TranslateRequest {
                text,
                dialect_family: family,
                backend,
                profile,
                execute,
            };
            let response = orchestrator.translate(request).await;
            print_json(&response)?;
            response.is_success()
        }
        Command::Refresh { profile } => {
            let response = orchestrator.refresh_schema(&profile).await;
            print_json(&response)?;
            response.success
        }
        Command::Invalidate { profile } => match orchestrator.invalidate_schema(&profile) {
            Ok(()) => true,
            Err(record) => {
                print_json(&record)?;
                false
            }
        },
        Command::Backends => true,
    };

    orchestrator.shutdown().await;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
