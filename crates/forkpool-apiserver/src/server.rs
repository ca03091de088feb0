use crate::handlers::*;
use crate::AppState;
use axum::routing::{get, post, put};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// API server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to listen on
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
        }
    }
}

/// API server
pub struct ApiServer {
    config: Config,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: Config, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    fn build_router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    ///
    /// In-flight promotions and destroys run on their own tasks and finish
    /// even when the connection that started them is dropped.
    pub async fn run<F>(self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.build_router();

        info!("Starting API server on {}", self.config.listen_addr);

        let listener = TcpListener::bind(self.config.listen_addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Routes of the cache/branch API
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        // Caches
        .route("/caches", get(list_caches).post(create_cache))
        .route("/caches/{name}", get(get_cache).delete(delete_cache))
        // Branches
        .route(
            "/caches/{name}/branches",
            get(list_branches).post(create_branch),
        )
        .route(
            "/caches/{name}/branches/{sha}",
            get(get_branch).delete(delete_branch),
        )
        .route(
            "/caches/{name}/branches/{sha}/promote",
            post(promote_branch),
        )
        .route(
            "/caches/{name}/branches/{sha}/promote/resume",
            post(resume_promotion),
        )
        .route("/caches/{name}/branches/{sha}/export", put(set_export))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn healthz() -> &'static str {
    "ok"
}
