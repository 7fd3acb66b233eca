mod config;
mod handlers;
mod models;
mod routes;
mod session;
mod storage;
mod ws;

use axum::http::HeaderValue;
use std::panic;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use routes::create_routes;
use session::registry::{RegistrySettings, SessionRegistry};
use storage::{RemoteStore, StorageClient};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "syncroom=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Wire the storage client: remote-backed when an endpoint is configured,
    // local-only otherwise.
    let remote = match &config.storage_endpoint {
        Some(endpoint) => {
            info!("Remote blob store configured at {}", endpoint);
            Some(RemoteStore::new(
                endpoint.clone(),
                config.storage_token.clone(),
                config.request_timeout(),
            ))
        }
        None => {
            warn!("No storage endpoint configured - running in local-only mode");
            None
        }
    };
    let storage = Arc::new(StorageClient::new(
        &config.workspace_root,
        remote,
        config.archive_scope(),
    ));

    // Session registry and the idle sweep backstop
    let registry = Arc::new(SessionRegistry::new(
        storage,
        RegistrySettings::from(&config),
    ));
    let sweeper = registry.spawn_sweeper();

    let cors = match &config.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    let app = create_routes(registry.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket available at ws://{}/ws", config.server_address());

    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, refusing new joins");
            shutdown_registry.close();
        })
        .await
        .expect("Server failed to start");

    // Listener is closed; persist and evict every live session before exit.
    sweeper.abort();
    registry.drain().await;
    info!("Shutdown complete");
}
