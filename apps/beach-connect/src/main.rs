use std::sync::Arc;

use anyhow::{Context, Result, bail};
use beach_connect::config::RegistryConfig;
use beach_connect::credentials::ReqwestCredentialApi;
use beach_connect::registry::{ConnectionRegistry, ConnectionSnapshot};
use beach_connect::session::{ConnectParams, CredentialOverride};
use beach_connect::transport::websocket::WebSocketConnector;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

const DEFAULT_SESSION_SERVER: &str = "https://api.beach.sh";

#[derive(Parser, Debug)]
#[command(name = "beach-connect", version, about = "Watch live beach sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a session and print every snapshot until interrupted
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Session id or session URL
    target: String,

    /// Private beach the session is attached to
    #[arg(long = "private-beach", default_value = "default")]
    private_beach: String,

    #[arg(long)]
    passcode: Option<String>,

    #[arg(long)]
    viewer_token: Option<String>,

    /// Viewport height in rows
    #[arg(long)]
    rows: Option<usize>,

    #[arg(long)]
    label: Option<String>,

    #[arg(long, env = "BEACH_MANAGER_URL")]
    manager_url: Option<Url>,

    #[arg(long, env = "BEACH_SESSION_SERVER", default_value = DEFAULT_SESSION_SERVER)]
    session_server: String,

    #[arg(long, env = "BEACH_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Watch(args) => watch(args).await,
    }
}

async fn watch(args: WatchArgs) -> Result<()> {
    let (session_id, base) = interpret_session_target(&args.target)?;
    let session_server = base.unwrap_or(args.session_server);

    let mut config = RegistryConfig::from_env().context("invalid BEACH_CONNECT_* setting")?;
    if let Some(rows) = args.rows {
        if rows == 0 {
            bail!("--rows must be greater than zero");
        }
        config.viewport_rows = rows;
    }

    let connector = WebSocketConnector::new(&session_server)
        .with_context(|| format!("invalid session server {session_server}"))?;
    let api = ReqwestCredentialApi::new().context("failed to build manager client")?;
    let registry = ConnectionRegistry::new(config, Arc::new(api), Arc::new(connector));

    let mut params = ConnectParams::new(args.private_beach, session_id).with_overrides(CredentialOverride {
        passcode: args.passcode,
        viewer_token: args.viewer_token,
    });
    if let Some(manager_url) = args.manager_url {
        params = params.with_backend(manager_url, args.auth_token);
    }
    if let Some(label) = args.label {
        params = params.with_label(label);
    }

    let key = params.session_key();
    info!(key = %key, session_server = %session_server, "watching session");
    let subscription = registry.acquire(key, params, |snapshot: &ConnectionSnapshot| {
        println!("{snapshot}");
        for row in snapshot.grid.visible_rows().filter(|row| row.is_loaded()) {
            println!("{:>6} | {}", row.absolute_index, row.text);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    subscription.release();
    registry.shutdown();
    Ok(())
}

/// Accept either a bare session id or a session URL such as
/// `https://host/sessions/<id>/join`; URLs also yield the server base.
fn interpret_session_target(target: &str) -> Result<(String, Option<String>)> {
    let target = target.trim();
    if let Ok(id) = Uuid::parse_str(target) {
        return Ok((id.to_string(), None));
    }

    let url = Url::parse(target).with_context(|| format!("invalid session target '{target}'"))?;
    let mut segments: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if segments.last().is_some_and(|segment| segment == "join") {
        segments.pop();
    }
    let Some(session_id) = segments.pop().filter(|id| Uuid::parse_str(id).is_ok()) else {
        bail!("invalid session target '{target}'");
    };
    if segments.last().is_some_and(|segment| segment == "sessions") {
        segments.pop();
    }

    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);
    let mut path = String::from("/");
    for segment in &segments {
        path.push_str(segment);
        path.push('/');
    }
    base.set_path(&path);
    Ok((session_id, Some(base.to_string())))
}
