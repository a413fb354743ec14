use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_session::{ClientConfig, ENDPOINT_ENV, Session};
use tether_web::{AppState, build_cors, router};

#[derive(Debug, Parser)]
#[command(name = "tether-web", about = "HTTP bridge to a tether assistant backend")]
struct Args {
    /// Address to serve HTTP on
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,

    /// Backend endpoint: unix:/path, tcp://host:port or a socket path
    #[arg(long)]
    endpoint: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/tether/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Allowed CORS origin, or * for any (repeatable)
    #[arg(long = "allow-origin", default_value = "http://localhost:3000")]
    allow_origins: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_web=info,tether_session=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(args.config.as_deref())?;
    let env_endpoint = std::env::var(ENDPOINT_ENV).ok();
    let endpoint = config.resolve_endpoint(args.endpoint.as_deref(), env_endpoint.as_deref())?;

    let session = Session::connect(&endpoint, config.session)
        .await
        .with_context(|| format!("failed to connect to backend at {endpoint}"))?;
    tracing::info!(%endpoint, "connected to backend");

    let watcher = {
        let session = session.clone();
        tokio::spawn(async move {
            session.closed().await;
            tracing::warn!("backend connection lost; requests will fail with 502");
        })
    };

    let cors = build_cors(&args.allow_origins)?;
    let state = Arc::new(AppState {
        session: session.clone(),
    });
    let app = router(state, cors);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind web listener on {}", args.listen))?;

    tracing::info!("tether-web listening on http://{}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    watcher.abort();
    session.close().await;
    Ok(())
}
