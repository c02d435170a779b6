use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use watchpost::config::Config;
use watchpost::engine::{
    ConnectionPool, DeliveryDispatcher, EngineConnector, ReconnectSupervisor, WatcherRegistry,
};
use watchpost::server::{AppState, app_router};
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Config::from_optional_toml();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.basic.webhook_timeout_secs))
        .connect_timeout(Duration::from_secs(cfg.basic.connect_timeout_secs))
        .build()?;
    let connector = Arc::new(EngineConnector::new(Duration::from_secs(
        cfg.basic.connect_timeout_secs,
    )));

    if cfg.standalone.enabled {
        info!(
            mongo_url = %cfg.standalone.mongo_url,
            collections = cfg.standalone.collections.len(),
            reconnect_interval_ms = cfg.standalone.reconnect_interval_ms,
            "starting in standalone relay mode"
        );
        let dispatcher = DeliveryDispatcher::new(client, None);
        let supervisor = match ReconnectSupervisor::new(cfg.standalone, connector, dispatcher) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "invalid standalone configuration");
                std::process::exit(1);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
        supervisor.run(shutdown_rx).await;
        info!("standalone relay stopped");
        return Ok(());
    }

    info!(
        database_url = %cfg.basic.database_url,
        listen_addr = %cfg.basic.listen_addr,
        listen_port = cfg.basic.listen_port,
        loglevel = %cfg.basic.loglevel,
        "starting watchpost server"
    );

    let store = watchpost::store::spawn(&cfg.basic.database_url).await?;
    let dispatcher = DeliveryDispatcher::new(client, Some(store.clone()));
    let pool = ConnectionPool::new(connector);
    let registry = WatcherRegistry::new(store.clone(), dispatcher.clone(), pool);
    registry.start_all().await?;

    let state = AppState::new(store, registry.clone(), dispatcher);
    let app = app_router(state);

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
