mod api;
mod auth;
mod chat;
mod commands;
mod config;
mod content;
mod hub;
mod models;
mod routes;
mod state;
mod storage;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use auth::{AuthConfig, AuthService};
use config::{bind_addr, Config};
use hub::Hub;
use state::AppState;
use storage::Storage;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    // CLI mode: invite through the running admin listener and exit.
    if let Some(username) = config.add_user.clone() {
        if let Err(e) = commands::add_user(&username, &config).await {
            eprintln!("{e}");
            std::process::exit(1);
        }
        return Ok(());
    }

    config.validate(false)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "besedka_server=info".parse().unwrap()),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "besedka server starting");

    let storage = Arc::new(Storage::open(&config.db_file)?);
    let auth = Arc::new(AuthService::new(
        AuthConfig {
            secret: config.auth_secret.clone(),
            token_expiry: config.token_expiry,
            ..AuthConfig::default()
        },
        storage.clone(),
    )?);
    let hub = Hub::new(auth.clone(), storage.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = auth.spawn_sweeper(config.sweep_interval, shutdown_rx.clone());

    let app_state = AppState {
        auth,
        hub,
        base_url: config.base_url.clone(),
        admin_user: config.admin_user.clone(),
        admin_password: config.admin_password.clone(),
        shutdown: shutdown_rx.clone(),
    };

    let api_router = routes::build_api_router(app_state.clone());
    let admin_router = routes::build_admin_router(app_state);

    let api_listener = TcpListener::bind(bind_addr(&config.api_addr)).await?;
    let admin_listener = TcpListener::bind(bind_addr(&config.admin_addr)).await?;
    tracing::info!(addr = %config.api_addr, "api listener started");
    tracing::info!(addr = %config.admin_addr, "admin listener started");

    let api_task = tokio::spawn(serve(api_listener, api_router, shutdown_rx.clone()));
    let admin_task = tokio::spawn(serve(admin_listener, admin_router, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = api_task.await;
        let _ = admin_task.await;
    })
    .await
    .is_err()
    {
        tracing::warn!("graceful shutdown deadline exceeded, aborting");
    }
    let _ = sweeper.await;

    storage.flush()?;
    tracing::info!("bye");
    Ok(())
}

async fn serve(listener: TcpListener, router: axum::Router, mut shutdown: watch::Receiver<bool>) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "listener failed");
    }
}
