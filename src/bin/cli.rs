use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use livestyle::config::SyncConfig;
use livestyle::protocol::names;
use livestyle::sync::connect;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "livestyle")]
#[command(
    about = "LiveStyle sync transport: relay server, monitor client and liveness probe",
    version
)]
struct Cli {
    /// Optional JSON config file (websocketUrl, reconnectOnClose, maxRetries)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a standalone relay server until interrupted
    Serve {
        #[arg(short, long, default_value_t = 54000)]
        port: u16,
    },

    /// Connect as an editor and print relayed messages
    Connect {
        /// Relay url; overrides the config file
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Editor id announced with editor-connect
        #[arg(long, default_value = "cli")]
        editor_id: String,
    },

    /// Probe a relay's HTTP responder and print its identification
    Status {
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config.as_deref()).await;

    match cli.command {
        Commands::Serve { port } => serve(port).await,
        Commands::Connect { url, editor_id } => {
            let url = url.unwrap_or_else(|| config.websocket_url.clone());
            monitor(&url, &editor_id, &config).await
        }
        Commands::Status { url } => {
            let url = url.unwrap_or_else(|| config.websocket_url.clone());
            status(&url).await
        }
    }
}

async fn serve(port: u16) -> Result<()> {
    let server = livestyle::server::start(port).await?;
    let addr = server
        .local_addr()
        .await
        .ok_or_else(|| anyhow::anyhow!("relay did not report a bound address"))?;
    println!(
        "{} Relay running at {}",
        "✓".green(),
        format!("ws://{}/livestyle", addr).bright_blue()
    );

    tokio::signal::ctrl_c().await?;
    println!("{} Shutting down", "✓".green());
    server.destroy().await;
    Ok(())
}

async fn monitor(url: &str, editor_id: &str, config: &SyncConfig) -> Result<()> {
    let session = connect(url, config.connect_options()).await?;
    if session.is_self_hosted() {
        println!("{} No relay found, hosting one locally", "✓".yellow());
    }
    println!(
        "{} Connected to {} as editor {}",
        "✓".green(),
        url.bright_blue(),
        editor_id.bright_yellow()
    );

    let mut incoming = session.subscribe();
    session
        .send(names::EDITOR_CONNECT, json!({ "id": editor_id }))
        .await?;

    loop {
        tokio::select! {
            received = incoming.recv() => {
                match received {
                    Ok(env) => {
                        let data = env
                            .data
                            .map(|d| d.to_string())
                            .unwrap_or_default();
                        println!("{} {}", env.name.bright_white(), data.dimmed());
                    }
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.destroy().await;
    Ok(())
}

async fn status(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url)?;
    let host = parsed.host_str().unwrap_or("127.0.0.1");
    let port = parsed.port().unwrap_or(54000);
    let probe = format!("http://{}:{}/", host, port);

    match reqwest::get(&probe).await {
        Ok(response) => {
            let body = response.text().await?;
            println!("{} {}", "✓".green(), body);
            Ok(())
        }
        Err(e) => {
            println!("{} No relay at {}: {}", "✗".red(), probe.bright_blue(), e);
            std::process::exit(1);
        }
    }
}
