mod config;
mod derive;
mod error;
mod miden;
mod relay_miden;
mod relay_zcash;
mod routes;
mod store;
#[cfg(test)]
mod testing;
mod wire;
mod zcash;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::miden::MidenBridge;
use crate::relay_miden::MidenRelayer;
use crate::relay_zcash::ZcashRelayer;
use crate::routes::AppState;
use crate::store::SqliteStore;
use crate::zcash::ZcashRpcClient;

#[tokio::main]
async fn main() {
    // Initialize tracing (env-filter: RUST_LOG=zec_miden_bridge=debug,info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zec_miden_bridge=info,tower_http=info".into()),
        )
        .init();

    // Load and validate config
    let config = match BridgeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[zec-miden-bridge] configuration error: {e}");
            std::process::exit(1);
        }
    };

    // CORS: require explicit origins in release builds
    if config.allowed_origins.is_empty() {
        if cfg!(debug_assertions) {
            warn!("BRIDGE_ALLOWED_ORIGINS not set — using permissive CORS (dev mode only)");
        } else {
            eprintln!(
                "[zec-miden-bridge] FATAL: BRIDGE_ALLOWED_ORIGINS must be set in production builds"
            );
            std::process::exit(1);
        }
    }

    info!(
        host = %config.host,
        port = config.port,
        pool_address = %config.pool_address,
        faucet = %config.faucet_id,
        bridge_account = %config.bridge_account_id,
        exit_tag = config.exit_tag,
        "starting bridge engine"
    );

    // Durable state: a corrupt store is fatal, the supervisor restarts us.
    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("[zec-miden-bridge] store error: {e}");
            std::process::exit(1);
        }
    };

    let zcash = match ZcashRpcClient::new(
        config.zcash_rpc_url.clone(),
        config.zcash_rpc_user.clone(),
        config.zcash_rpc_password.clone(),
        config.pool_address.clone(),
        config.zcash_min_confirmations,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("[zec-miden-bridge] zcash client error: {e}");
            std::process::exit(1);
        }
    };

    let miden = match MidenBridge::connect(&config).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("[zec-miden-bridge] miden client error: {e}");
            std::process::exit(1);
        }
    };

    // Relayer tasks Z and M. Shutdown is delivered at tick boundaries
    // so in-flight submissions always reach their store.mark_* step.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relayer_z = ZcashRelayer::new(
        zcash.clone(),
        miden.clone(),
        store.clone(),
        Duration::from_secs(config.zcash_relayer_interval_secs),
        config.max_mint_attempts,
        config.dust_threshold_base,
    );
    let z_handle = tokio::spawn(relayer_z.run(shutdown_rx.clone()));

    let relayer_m = MidenRelayer::new(
        zcash.clone(),
        miden.clone(),
        store.clone(),
        Duration::from_secs(config.miden_relayer_interval_secs),
    );
    let m_handle = tokio::spawn(relayer_m.run(shutdown_rx.clone()));

    // Build CORS layer
    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    let state = Arc::new(AppState {
        store,
        miden,
        config: config.clone(),
    });

    let app = Router::new()
        .route("/health", axum::routing::get(routes::health))
        .route("/status", axum::routing::get(routes::status))
        .route("/deposit/hash", axum::routing::get(routes::deposit_hash))
        .route("/account/balance", axum::routing::post(routes::account_balance))
        .route("/pool/balance", axum::routing::post(routes::pool_balance))
        .route(
            "/withdrawal/create",
            axum::routing::post(routes::withdrawal_create),
        )
        .route("/note/consume", axum::routing::post(routes::note_consume))
        .route("/account/create", axum::routing::post(routes::account_create))
        .layer(RequestBodyLimitLayer::new(64 * 1024)) // 64KB
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            "Referrer-Policy".parse::<header::HeaderName>().unwrap(),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid listen address");

    info!(addr = %addr, "bridge facade listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop the relayers at their next tick boundary and wait for
    // in-flight work to finish its store writes.
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = z_handle.await;
        let _ = m_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("relayers did not stop within the shutdown deadline");
    }

    info!("bridge engine shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
