use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use scanwatch::config::WatchConfig;
use scanwatch::notifications::Notification;
use scanwatch::ports::load_ports_from_path;
use scanwatch::server;
use scanwatch::session::AppSession;
use scanwatch::tracker::TrackingHandle;

/// scanwatch: start scan sessions on remote nodes and follow them live.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scanwatch",
    version,
    about = "Start scan sessions on remote nodes and follow their progress live.",
    long_about = None
)]
struct Cli {
    /// JSON config file (defaults to $SCANWATCH_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// REST base URL, e.g. https://dash.example/api.
    #[arg(long = "api-url")]
    api_url: Option<String>,

    /// Push channel URL, e.g. wss://dash.example/ws.
    #[arg(long = "ws-url")]
    ws_url: Option<String>,

    /// Bearer token for REST and the push channel.
    #[arg(long)]
    token: Option<String>,

    /// Accept self-signed TLS certificates.
    #[arg(long = "insecure", default_value_t = false)]
    insecure: bool,

    /// Node to start a scan session on. Without it no scan is started.
    #[arg(long)]
    node: Option<String>,

    /// Comma-separated scanners (defaults to the last selection used on the node).
    #[arg(long, value_delimiter = ',')]
    scanners: Vec<String>,

    /// Port expression, e.g. "22,80,8000-8010".
    #[arg(long, conflicts_with = "ports_file")]
    ports: Option<String>,

    /// File with one port or range per line.
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Serve the dashboard UI and API until Ctrl+C.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Address for --serve-ui.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scanwatch=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    println!("scanwatch configuration:");
    println!("  api_url      : {}", config.api_url);
    println!("  ws_url       : {}", config.ws_url);
    println!(
        "  token        : {}",
        if config.token.is_some() { "<set>" } else { "<none>" }
    );
    println!("  node         : {}", cli.node.as_deref().unwrap_or("<none>"));
    println!("  serve_ui     : {}", cli.serve_ui);

    let session = Arc::new(
        AppSession::from_config(&config).context("invalid REST API configuration")?,
    );
    if let Err(e) = session.connect().await {
        if e.is_definitive() {
            bail!("push channel unusable: {e}");
        }
        warn!(error = %e, "push channel unavailable; relying on polling until it reconnects");
    }

    let shutdown = CancellationToken::new();
    if cli.serve_ui {
        let bind = cli.bind.clone();
        let app = session.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, app, stop).await {
                eprintln!("HTTP UI server error: {e:#}");
            }
        });
        println!("UI server starting at http://{} (Ctrl+C to stop)", cli.bind);
    }

    if let Some(node) = cli.node.as_deref() {
        let ports = match cli.ports_file.as_deref() {
            Some(path) => Some(load_ports_from_path(path)?),
            None => cli.ports.clone(),
        };
        let scanners = if cli.scanners.is_empty() {
            session.remembered_scanners(node).await.unwrap_or_default()
        } else {
            cli.scanners.clone()
        };
        match session.start_scan(node, scanners, ports.as_deref()).await {
            Ok(handle) => watch_session(&session, &handle).await,
            Err(e) => eprintln!("Failed to start scan: {}", e.user_message()),
        }
    }

    if cli.serve_ui {
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
    }

    shutdown.cancel();
    session.tracker().stop_all();
    session.connection().disconnect().await;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<WatchConfig> {
    let mut config = WatchConfig::load(cli.config.as_deref())?;
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    if let Some(url) = &cli.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    config.accept_invalid_certs |= cli.insecure;
    Ok(config)
}

/// Print the session's progress notice as it changes, then its outcome.
async fn watch_session(session: &AppSession, handle: &TrackingHandle) {
    let store = session.notifications().clone();
    let mut revisions = store.subscribe();
    let mut last = String::new();
    println!("\nTracking scan session {}", handle.session_id());

    loop {
        tokio::select! {
            _ = handle.finished() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = store
            .notice_for_session(handle.session_id())
            .and_then(|id| store.get(id));
        if let Some(notice) = current {
            let line = render(&notice);
            if line != last {
                println!("{line}");
                last = line;
            }
        }
    }

    for notice in store.snapshot() {
        let is_outcome = notice
            .scan_session_status
            .as_ref()
            .is_some_and(|s| s.session_id == handle.session_id() && s.is_terminal());
        if is_outcome {
            println!("{}", render(&notice));
        }
    }
}

fn render(notice: &Notification) -> String {
    let kind = format!("{:?}", notice.kind).to_lowercase();
    match notice.message.as_deref() {
        Some(message) => format!("[{kind}] {}: {message}", notice.title),
        None => format!("[{kind}] {}", notice.title),
    }
}
