//! Samtale server entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use samtale::config::Config;
use samtale::store::{SqliteStore, Store};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Samtale - Real-time Voice Session Analysis
///
/// A server that transcribes streamed microphone audio and derives live
/// summaries and mind maps per session.
#[derive(Parser, Debug)]
#[command(name = "samtale")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the transcription and analysis server
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Delete all sessions and their derived data
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("samtale={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref().map(std::path::Path::new))?;

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            samtale::server::serve(config).await?;
        }

        Commands::Reset { yes } => {
            if !yes {
                eprintln!("This deletes every session, transcript, analysis and mind map.");
                eprint!("Type 'yes' to continue: ");
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                if answer.trim() != "yes" {
                    eprintln!("Aborted.");
                    return Ok(());
                }
            }

            let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.sqlite_path())?);
            let deleted = store.clear_sessions().await?;
            println!("Deleted {} sessions.", deleted);
        }
    }

    Ok(())
}
