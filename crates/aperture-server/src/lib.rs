//! HTTP surface for the aperture image service.
//!
//! Thin adapter over the core crates: routes requests to the blob
//! store, signer, and pipeline, and maps their errors to status codes.
//! Everything stateful lives in [`AppState`]; `main` only wires config,
//! logging, and the listener.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod http;

pub use config::Config;
pub use http::router;

use std::sync::Arc;
use std::time::Duration;

use aperture_core::clock::Clock;
use blob_store::BlobStore;
use pipeline::{Pipeline, PipelineConfig};
use result_cache::ResultCache;
use signer::Signer;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Shared handles behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Blob storage.
    pub store: BlobStore,
    /// URL signer / access gate.
    pub signer: Signer,
    /// Transformation pipeline.
    pub pipeline: Pipeline,
    /// Result cache (held for background sweeping).
    pub cache: ResultCache,
    /// Precomputed `Cache-Control` value for serve responses.
    pub cache_control: String,
    /// Page size when a list request does not pass `limit`.
    pub default_page_limit: usize,
}

impl AppState {
    /// Build all components from configuration.
    pub fn from_config(cfg: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let store = BlobStore::open(blob_store::Config {
            upload_path: cfg.upload_path.clone(),
            index_path: cfg.index_path.clone(),
            max_size: cfg.max_upload_size,
            require_unlink: cfg.require_unlink,
            allowed_types: None,
        })?;
        let cache = ResultCache::new(
            cfg.cache_path.clone(),
            Duration::from_secs(cfg.serve_result_cache_ttl),
            clock.clone(),
        )?;
        let signer = Signer::new(&cfg.secret_key, &cfg.signature_secret_key, clock);
        let allowed_sources: Vec<String> = cfg
            .serve_allowed_http_sources
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let pipeline = Pipeline::new(
            PipelineConfig {
                allow_unsafe: cfg.unsafe_mode(),
                auto_webp: cfg.serve_auto_webp,
                auto_avif: cfg.serve_auto_avif,
                allowed_sources,
                deny_private_networks: true,
                max_source_size: cfg.max_upload_size,
                concurrency: cfg.serve_concurrency,
                queue_size: cfg.serve_queue_size,
                load_timeout: Duration::from_secs(cfg.serve_load_timeout),
                process_timeout: Duration::from_secs(cfg.serve_process_timeout),
                save_timeout: Duration::from_secs(cfg.serve_save_timeout),
            },
            store.clone(),
            cache.clone(),
            signer.clone(),
        )?;
        Ok(Self {
            store,
            signer,
            pipeline,
            cache,
            cache_control: format!(
                "public, max-age={}, stale-while-revalidate={}",
                cfg.serve_cache_control_ttl, cfg.serve_cache_control_swr
            ),
            default_page_limit: 100,
        })
    }
}

/// Initialize structured logging (JSON) with env filter; `level` is
/// the fallback when RUST_LOG is unset.
pub fn init_logging(level: &str) {
    let fmt_layer = fmt::layer().json().with_current_span(true);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Periodically drop expired result-cache entries.
pub fn spawn_cache_sweeper(cache: ResultCache, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let cache = cache.clone();
            match tokio::task::spawn_blocking(move || cache.sweep()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "cache sweep failed"),
                Err(e) => warn!(error = %e, "cache sweep worker died"),
            }
        }
    });
}
