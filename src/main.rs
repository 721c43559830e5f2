//! callctl - call session lifecycle controller
//!
//! Drives a single call session from the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use callctl::calling::{self, CallRequest, INTENT_ACTION_CALL_INCOMING, INTENT_ACTION_CALL_START};
use callctl::config::{Config, ServerLimits, CALL_TIMEOUT_LIMIT};
use callctl::console;

#[derive(Parser)]
#[command(name = "callctl")]
#[command(about = "Call session lifecycle controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ring an incoming call and wait for accept/decline
    Incoming {
        /// Topic of the caller (p2p topic name)
        #[arg(short, long)]
        topic: Option<String>,

        /// Sequence number of the call message
        #[arg(short, long)]
        seq: Option<i64>,

        /// Ring timeout in seconds (overrides the server limit)
        #[arg(long)]
        ring_timeout: Option<u64>,
    },

    /// Start an outgoing call
    Outgoing {
        /// Topic of the callee (p2p topic name)
        #[arg(short, long)]
        topic: Option<String>,

        /// Sequence number of the call message
        #[arg(short, long)]
        seq: Option<i64>,
    },

    /// Show or edit the configuration
    Config {
        /// Set a server limit, e.g. callTimeout=45
        #[arg(long = "set-limit", value_name = "NAME=SECONDS")]
        set_limit: Vec<String>,

        /// Endpoint for outbound call notes
        #[arg(long)]
        signal_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = Config::load().context("Failed to load config")?;

    match cli.command {
        Commands::Incoming {
            topic,
            seq,
            ring_timeout,
        } => {
            if let Some(secs) = ring_timeout {
                config.set_server_limit(CALL_TIMEOUT_LIMIT, secs);
            }
            let request = CallRequest::new(INTENT_ACTION_CALL_INCOMING, topic, seq);
            console::run_session(request, &config).await?;
        }
        Commands::Outgoing { topic, seq } => {
            let request = CallRequest::new(INTENT_ACTION_CALL_START, topic, seq);
            console::run_session(request, &config).await?;
        }
        Commands::Config {
            set_limit,
            signal_url,
        } => {
            let changed = !set_limit.is_empty() || signal_url.is_some();
            for assignment in &set_limit {
                config.apply_limit_assignment(assignment)?;
            }
            if signal_url.is_some() {
                config.signal_url = signal_url;
            }
            if changed {
                config.save()?;
                tracing::info!("Configuration saved");
            }

            println!("Config file: {}", Config::config_path()?.display());
            println!(
                "Signal URL:  {}",
                config.signal_url.as_deref().unwrap_or("(none, notes are logged)")
            );
            println!(
                "Ring timeout: {}s (+ grace)",
                config.server_limit(
                    CALL_TIMEOUT_LIMIT,
                    calling::controller::DEFAULT_CALL_TIMEOUT_SECS
                )
            );
            for (name, value) in &config.server_limits {
                println!("  {} = {}", name, value);
            }
        }
    }

    Ok(())
}
