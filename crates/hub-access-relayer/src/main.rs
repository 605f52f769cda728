#![warn(clippy::all, clippy::pedantic)]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use config::RelayConfig;
use tokio::net::TcpListener;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

mod config;
mod dispatcher;
mod http;
mod registry;
mod state_machine;
mod store;
mod verifier;
mod ws;

#[derive(Clone)]
pub struct AppState {
    pub config: RelayConfig,
    pub store: Arc<store::SqliteStore>,
    pub registry: Arc<registry::ConnectionRegistry>,
    pub dispatcher: Arc<dispatcher::RelayDispatcher>,
}

impl AppState {
    #[must_use]
    pub fn new(config: RelayConfig, store: Arc<store::SqliteStore>) -> Self {
        let registry = Arc::new(registry::ConnectionRegistry::new());
        let dispatcher = Arc::new(dispatcher::RelayDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn store::AccessRequestStore>,
        ));

        Self {
            config,
            store,
            registry,
            dispatcher,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = RelayConfig::from_env()?;
    config.validate()?;

    let store = Arc::new(store::SqliteStore::new(&config.database_path)?);
    let app_state = AppState::new(config.clone(), Arc::clone(&store));

    spawn_janitor(app_state.clone());

    let app = http::router(app_state);

    info!(
        bind = %config.bind_addr,
        db = %config.database_path.display(),
        tls = config.tls.is_some(),
        "starting hub access relayer"
    );

    if let Some(tls) = &config.tls {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .context("failed to load rustls cert/key")?;

        axum_server::bind_rustls(config.bind_addr, tls_config)
            .serve(app.into_make_service())
            .await
            .context("axum tls server failed")?;
    } else {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(listener, app)
            .await
            .context("axum server failed")?;
    }

    Ok(())
}

fn spawn_janitor(app_state: AppState) {
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_millis(app_state.config.janitor_interval_ms)).await;

            let prune_before = now_ms().saturating_sub(app_state.config.event_retention_ms);
            match app_state.store.prune_events(prune_before) {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "pruned old relay events");
                    }
                }
                Err(error) => {
                    warn!("janitor failed to prune events: {error}");
                }
            }
        }
    });
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
