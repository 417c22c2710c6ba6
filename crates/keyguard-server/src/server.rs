use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    handlers::{health, whoami},
    keys::KeyStore,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keys_file: Option<PathBuf>,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("KEYGUARD_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("KEYGUARD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            keys_file: std::env::var("KEYGUARD_KEYS_FILE").ok().map(PathBuf::from),
            cors_origins: std::env::var("KEYGUARD_CORS_ORIGINS").ok(),
        }
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let Some(keys_file) = cfg.keys_file else {
        anyhow::bail!("no keys file configured (set KEYGUARD_KEYS_FILE or --keys-file)");
    };

    let keys = KeyStore::load(&keys_file).context("load keys")?;
    if keys.is_empty() {
        warn!(path = %keys_file.display(), "keys file is empty; every guarded request will be rejected");
    } else {
        info!(count = keys.len(), path = %keys_file.display(), "loaded api keys");
    }

    let app = router(AppState { keys }, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "keyguard server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

/// Public routes plus the routes guarded by [`require_api_key`].
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::HEAD, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
