//! CLI for pathcast
//!
//! Subcommands:
//! - `server`: run the WebSocket relay until SIGINT/SIGTERM
//! - `publish`: send one envelope to a topic and exit
//! - `listen`: print every envelope published on a topic, reconnecting on failure

use std::sync::Arc;

use clap::{Parser, Subcommand};
use pathcast::broker::{Registry, Topic};
use pathcast::client::{Publisher, ReconnectingClient};
use pathcast::config::{Settings, load_config};
use pathcast::transport::RelayServer;
use pathcast::utils::RelayError;
use pathcast::utils::signals::wait_for_shutdown_signal;
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "pathcast")]
struct Cli {
    /// Log level (overrides configuration)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the WebSocket relay
    Server,
    /// Publish one envelope to a topic
    Publish {
        /// Topic to publish on (defaults to the configured client topic)
        #[arg(long)]
        topic: Option<String>,
        /// Envelope `type`
        #[arg(long = "type")]
        event_type: String,
        /// Envelope `data`, as JSON
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Print envelopes published on a topic
    Listen {
        #[arg(long)]
        topic: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    pathcast::utils::logging::init(level);

    let result = match cli.command {
        Command::Server => run_server(config).await,
        Command::Publish {
            topic,
            event_type,
            data,
        } => run_publish(config, topic, event_type, &data).await,
        Command::Listen { topic } => run_listen(config, topic).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(Registry::new());
    let server = Arc::new(RelayServer::bind(config.server.clone(), registry).await?);

    let accept = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    server.shutdown().await;
    accept.await?;
    Ok(())
}

async fn run_publish(
    config: Settings,
    topic: Option<String>,
    event_type: String,
    data: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload: serde_json::Value = serde_json::from_str(data)?;
    let topic = topic.unwrap_or(config.client.topic.clone());

    let publisher = Publisher::new(&config.client.url, config.client.backoff_policy())?;
    publisher.publish(&topic, event_type, payload).await?;
    Ok(())
}

async fn run_listen(
    config: Settings,
    topic: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let topic = Topic::from_path(&topic.unwrap_or(config.client.topic.clone()));
    let url = topic.endpoint(&Url::parse(&config.client.url)?)?;

    let mut client = ReconnectingClient::new(url, config.client.backoff_policy());
    if client.connect().await.is_err() {
        client.reconnect().await.map_err(RelayError::from)?;
    }

    let given_up = client
        .listen(|envelope| match envelope.encode() {
            Ok(text) => println!("{text}"),
            Err(e) => error!("{e}"),
        })
        .await;

    Err(RelayError::from(given_up).into())
}
