//! talelive-relay - keeps upstream credentials off the client.

#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tracing::info;

use talelive::relay::{vertex_upstream_url, CommandToken, Relay, RelayConfig, StaticToken, TokenProvider};
use talelive::session::DEFAULT_MODEL;
use talelive::SessionConfig;

/// Authenticating WebSocket relay for the Live API
#[derive(Parser, Debug)]
#[command(name = "talelive-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Full upstream URL; derived from --location when unset
    #[arg(long, env = "RELAY_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Project for the startup model hint; does not change forwarding
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,

    #[arg(long, env = "GOOGLE_CLOUD_LOCATION", default_value = "us-central1")]
    location: String,

    /// Model named in the startup hint; clients still choose their own in setup
    #[arg(long, env = "LIVE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Fixed bearer token for the upstream
    #[arg(long, env = "RELAY_BEARER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Command that prints a bearer token; defaults to gcloud
    #[arg(long, env = "RELAY_TOKEN_COMMAND")]
    token_command: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let tokens: Arc<dyn TokenProvider> = match (&cli.token, &cli.token_command) {
        (Some(_), Some(_)) => bail!("--token and --token-command are mutually exclusive"),
        (Some(token), None) => Arc::new(StaticToken::new(token.clone())),
        (None, Some(command)) => Arc::new(CommandToken::new(command)?),
        (None, None) => Arc::new(CommandToken::gcloud()),
    };

    let upstream_url = cli
        .upstream_url
        .clone()
        .unwrap_or_else(|| vertex_upstream_url(&cli.location));
    if let Some(project) = &cli.project {
        info!(
            "Clients should request model {}",
            SessionConfig::vertex_model(project, &cli.location, &cli.model)
        );
    }

    let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    Relay::serve(RelayConfig::new(listen, upstream_url), tokens).await?;
    Ok(())
}
