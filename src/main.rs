use anyhow::{Context, Result};
use credvault::api::{create_api_router, ApiAppState, CredentialApi};
use credvault::config::load_config;
use credvault::credentials::CredentialStore;
use credvault::oauth::{run_flow_cleanup, FlowManager, FlowSettings, HttpTokenExchanger, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credvault=info".into()),
        )
        .init();

    info!("Credvault starting...");

    let config_path =
        std::env::var("CREDVAULT_CONFIG").unwrap_or_else(|_| "credvault.toml".to_string());
    let mut config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path))?;
    config.apply_env_overrides();

    let key = config.store.resolve_encryption_key()?;
    let store = Arc::new(CredentialStore::new(&config.store.db_path, &key)?);
    info!(db_path = %config.store.db_path.display(), "Credential store opened");

    let providers = ProviderRegistry::from_settings(&config.providers);
    let exchanger = HttpTokenExchanger::new(
        config.oauth.exchange_timeout(),
        config.oauth.retry_backoff(),
    )?;
    let flows = FlowManager::new(
        store,
        providers,
        Arc::new(exchanger),
        FlowSettings::from(&config.oauth),
    );

    tokio::spawn(run_flow_cleanup(
        flows.clone(),
        Duration::from_secs(config.oauth.cleanup_interval_seconds.max(1)),
    ));

    let mut app = create_api_router(ApiAppState {
        api: CredentialApi::new(flows),
    });
    if config.api.cors_permissive {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind_addr))?;
    info!(addr = %config.api.bind_addr, "Credential API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
