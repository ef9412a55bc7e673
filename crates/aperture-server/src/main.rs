//! `apertured` — the aperture image service binary.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aperture_server::{config::Config, http, init_logging, spawn_cache_sweeper, AppState};
use axum::http::HeaderValue;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg.log_level);

    let clock = Arc::new(aperture_core::clock::SystemClock);
    let state = AppState::from_config(&cfg, clock)?;
    spawn_cache_sweeper(state.cache.clone(), Duration::from_secs(60));

    let app = http::router(state)
        .layer(TimeoutLayer::new(Duration::from_secs(cfg.request_timeout)))
        .layer(cors_layer(&cfg.cors_allowed_origins)?);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;

    match (&cfg.cert_file, &cfg.cert_key_file) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("loading TLS certificate")?;
            info!(%addr, environment = %cfg.environment, "listening (tls)");
            let handle = axum_server::Handle::new();
            tokio::spawn(shutdown_signal(handle.clone()));
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(%addr, environment = %cfg.environment, "listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_signal())
                .await?;
        }
    }
    Ok(())
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins: Vec<&String> = origins.iter().filter(|o| !o.is_empty()).collect();
    if origins.iter().any(|o| o.as_str() == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    let values: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.parse().with_context(|| format!("invalid CORS origin `{o}`")))
        .collect::<anyhow::Result<_>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(values))
        .allow_methods(Any)
        .allow_headers(Any))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

async fn shutdown_signal<A: axum_server::Address>(handle: axum_server::Handle<A>) {
    wait_for_signal().await;
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
