mod auth;
mod chat;
mod config;
mod db;
mod error;
mod models;
mod routes;
mod service;
mod sync;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::chat::{ChatClient, GoogleChatClient};
use crate::config::Config;
use crate::service::QueryService;
use crate::sync::{Cadence, PollEngine, PollHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    init_tracing(debug_logging);

    let config = Config::load()?;
    let store = db::MessageStore::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    store
        .run_migrations()
        .await
        .context("Failed to initialize database schema")?;
    let storage = auth::SqliteTokenStorage::new(store.clone());

    // Handle token reset
    if std::env::args().any(|arg| arg == "--reset-token") {
        storage.clear_token().await?;
        println!("Token cleared. Run with --login to re-authenticate.");
        return Ok(());
    }

    let secret = auth::Authenticator::load_secret(&config.credentials_path).await?;

    if std::env::args().any(|arg| arg == "--login") {
        let authenticator = auth::Authenticator::authenticate(
            secret,
            storage.clone(),
            auth::Consent::Interactive,
        )
        .await?;
        authenticator
            .token(auth::SCOPES)
            .await
            .context("OAuth flow failed")?;
        println!("Authenticated. Tokens stored in {}", config.database_url);
        return Ok(());
    }

    if config.space_id.is_empty() {
        anyhow::bail!("GOOGLE_CHAT_SPACE_ID must be set (or space_id in settings.toml)");
    }

    let authenticator =
        auth::Authenticator::authenticate(secret, storage.clone(), auth::Consent::Refuse).await?;
    let client: Arc<dyn ChatClient> = Arc::new(GoogleChatClient::new(
        authenticator,
        storage,
        config.space_id.clone(),
    )?);

    match tokio::time::timeout(config.poll.read_timeout(), client.get_space()).await {
        Ok(Ok(space)) => info!(
            space = %space.id,
            name = space.display_name.as_deref().unwrap_or(""),
            "connected to space"
        ),
        Ok(Err(e)) => warn!(error = %e, "could not load space details"),
        Err(_) => warn!("timed out loading space details"),
    }

    let persisted = store.load_poll_state().await?;
    let poll = PollHandle::restore(&persisted);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = PollEngine::new(
        store.clone(),
        client.clone(),
        poll.clone(),
        Cadence::from(&config.poll),
    )
    .spawn(shutdown_rx);

    let service = QueryService::new(store.clone(), client, poll, config.space_id.clone())
        .with_send_timeout(config.poll.send_timeout())
        .with_status_counts_as_activity(config.status_counts_as_activity);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!(space = %config.space_id, "listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, routes::router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = engine.await {
        warn!(error = %e, "poll engine ended abnormally");
    }
    store.close().await;
    Ok(())
}

fn init_tracing(debug_logging: bool) {
    let default = if debug_logging {
        "debug"
    } else {
        "info,chat_sidecar=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let term = async {
        if let Ok(mut s) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            s.recv().await;
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = term => {} }
    info!("shutdown requested");
}
