//! Conspire server binary.
//!
//! A multi-tenant HTTP gateway in front of a single S3 bucket. Hostnames get
//! their own index page and favicon, authenticated clients upload files whose
//! extension is derived from the sniffed content, and anyone may download
//! them with headers taken from the stored object metadata.

mod app;
mod assets;
mod auth;
mod config;
mod error;
mod fetch;
mod files;
mod http;
mod logging;
mod preview;
mod sniff;
mod store;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::app::{AppState, build_router};
use crate::assets::AssetCatalog;
use crate::auth::AuthConfig;
use crate::config::{Args, GatewayConfig, SHUTDOWN_GRACE_SECS};
use crate::fetch::PublicFetcher;
use crate::store::ObjectStoreClient;

shadow!(build);

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let config = Arc::new(
        GatewayConfig::from_args(args).map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?,
    );

    let (store, auth, catalog) = tokio::try_join!(
        connect_store(&config),
        AuthConfig::load(&config.users_file),
        load_catalog(&config),
    )?;
    if auth.is_empty() {
        warn!("no upload credentials configured, uploads will be rejected");
    }

    let fetcher = config
        .public_fetch_url
        .clone()
        .map(|base| {
            info!(url = %base, "downloads are proxied through public url");
            PublicFetcher::new(base, config.storage_timeout, config.forbidden_is_404)
                .map(Arc::new)
                .map_err(io::Error::other)
        })
        .transpose()?;

    let app = build_router(AppState {
        config: config.clone(),
        store: Arc::new(store),
        auth: Arc::new(auth),
        catalog: Arc::new(catalog),
        fetcher,
    });

    let addr = SocketAddr::new(config.bind, config.port);
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!(bucket = %config.bucket, endpoint = %config.s3_endpoint, "🚀 Starting HTTP server at {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("server stopped");
    Ok(())
}

/// 连接对象存储并检查一次，配置错误时在监听之前失败。
async fn connect_store(config: &GatewayConfig) -> io::Result<ObjectStoreClient> {
    let store = ObjectStoreClient::connect(config).map_err(io::Error::other)?;
    store.check_access().await.map_err(|err| {
        io::Error::other(format!(
            "object store check failed for bucket {}: {err}",
            config.bucket
        ))
    })?;
    info!(bucket = store.bucket(), "object store reachable");
    Ok(store)
}

async fn load_catalog(config: &GatewayConfig) -> io::Result<AssetCatalog> {
    let catalog = match &config.static_dir {
        Some(dir) => AssetCatalog::from_dir(dir).await?,
        None => AssetCatalog::embedded(),
    };
    info!(hostnames = catalog.hostnames().len(), "asset catalog loaded");
    Ok(catalog)
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
