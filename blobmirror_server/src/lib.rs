use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, routing};
use blobmirror_cache::Cache;
use blobmirror_core::BoxError;
use tokio::signal;
use tokio_util::sync::CancellationToken;

pub mod config;
mod handler;

pub use handler::AppState;

use crate::config::Settings;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the mirror's route table around a shared [`AppState`].
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(handler::get_root))
        .route("/robots.txt", routing::get(handler::robots))
        .route("/reload", routing::post(handler::reload))
        .route("/{*path}", routing::get(handler::get_blob))
        .with_state(state)
}

pub struct ServerBuilder {
    app_name: String,
    app_version: String,
    addr: String,
    cache: Option<Arc<Cache>>,
    settings: Option<Arc<Settings>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Creates a new ServerBuilder with default values.
    pub fn new() -> Self {
        ServerBuilder {
            app_name: APP_NAME.to_string(),
            app_version: APP_VERSION.to_string(),
            addr: "127.0.0.1:8080".to_string(),
            cache: None,
            settings: None,
        }
    }

    pub fn with_app_name(mut self, app_name: String) -> Self {
        self.app_name = app_name;
        self
    }

    pub fn with_app_version(mut self, app_version: String) -> Self {
        self.app_version = app_version;
        self
    }

    pub fn with_addr(mut self, addr: String) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_settings(mut self, settings: Arc<Settings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub async fn serve(
        self,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), BoxError> {
        let cache = self.cache.ok_or("no cache configured")?;
        let settings = self.settings.ok_or("no settings configured")?;

        let app = build_router(AppState { cache, settings });

        let addr: SocketAddr = self.addr.parse()?;
        let listener = create_reuse_port_listener(addr).await?;
        log::warn!(
            "{}@{} listening on {:?}",
            self.app_name,
            self.app_version,
            addr
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        Ok(())
    }
}

pub async fn shutdown_signal(cancel_token: CancellationToken, wait_duration: Duration) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("received termination signal, starting graceful shutdown");
    cancel_token.cancel();
    tokio::time::sleep(wait_duration).await;
}

pub async fn create_reuse_port_listener(
    addr: SocketAddr,
) -> Result<tokio::net::TcpListener, BoxError> {
    let socket = match &addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };

    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    Ok(listener)
}
