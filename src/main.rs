use std::sync::Arc;

use anyhow::Context;
use cardfold::config::Config;
use cardfold::http::{AppState, router};
use cardfold::{AggregateStore, CardCatalog, EventBackend, FileBackend, MemoryBackend, StoreLayout};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILTER: &str = "info,cardfold=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let identities = config
        .load_identities()
        .context("failed to load identities")?;

    let backend: Arc<dyn EventBackend> = match &config.data_dir {
        Some(dir) => {
            let layout = StoreLayout::new(dir);
            let backend = FileBackend::open(&layout)
                .await
                .with_context(|| format!("failed to open event log in {}", dir.display()))?;
            info!(path = %backend.path().display(), "using file-backed event log");
            Arc::new(backend)
        }
        None => {
            info!("no data directory configured, events are kept in memory");
            Arc::new(MemoryBackend::new())
        }
    };

    let mut builder = AggregateStore::builder(backend)
        .projection::<CardCatalog>()
        .idle_timeout(config.idle_timeout)
        .retry_policy(config.retry);
    if let Some(dir) = &config.data_dir {
        builder = builder.base_dir(dir);
    }
    let store = builder.open().context("failed to open aggregate store")?;

    let app = router(AppState::new(store.clone(), Arc::new(identities)));
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!(addr = %config.addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining aggregate actors");
    store.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
