//! Image transformation pipeline.
//!
//! A serve request carries a signature segment, an operation path, and
//! a source. The pipeline verifies the signature, parses the grammar,
//! consults the result cache, loads source bytes from the blob store
//! or an allow-listed origin, runs the codec work under a bounded
//! concurrency budget, and caches what it encoded.

#![deny(unsafe_code)]

pub mod filters;
pub mod params;

mod engine;
mod processor;
mod source;

pub use filters::{Filter, FocalRegion, OutputFormat};
pub use params::{CropSpec, Dim, HAlign, PadSpec, Params, ParseError, Source, VAlign};

use std::time::Duration;

use engine::Engine;
use result_cache::ResultCache;
use serde::Serialize;
use signer::Signer;
use tracing::{debug, instrument};

/// Errors emitted by the pipeline; the HTTP adapter maps each to a
/// status code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed operation path or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Signature rejected or source not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Source missing or unresolvable.
    #[error("not found")]
    NotFound,
    /// Source exceeds the size cap.
    #[error("payload too large")]
    PayloadTooLarge,
    /// Source is not a decodable image type.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    /// A phase exceeded its deadline.
    #[error("timed out in {phase} phase")]
    Timeout {
        /// Which phase hit the deadline: load, process, or save.
        phase: &'static str,
    },
    /// Transform queue is full.
    #[error("transform queue full")]
    Overloaded,
    /// Codec failure on decodable input.
    #[error("codec: {0}")]
    Codec(String),
    /// Everything else.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<blob_store::Error> for Error {
    fn from(e: blob_store::Error) -> Self {
        use blob_store::Error as B;
        match e {
            B::NotFound | B::EmptyKey => Self::NotFound,
            B::PayloadTooLarge => Self::PayloadTooLarge,
            B::UnsupportedMediaType { detected } => Self::UnsupportedMediaType(detected),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<result_cache::Error> for Error {
    fn from(e: result_cache::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Pipeline tuning and policy.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Accept the literal `unsafe` signature segment.
    pub allow_unsafe: bool,
    /// Emit WebP when the client accepts it.
    pub auto_webp: bool,
    /// Emit AVIF when the client accepts it (wins over WebP).
    pub auto_avif: bool,
    /// Host globs allowed for `url/` sources; empty denies all.
    pub allowed_sources: Vec<String>,
    /// Refuse loopback/private/link-local url targets.
    pub deny_private_networks: bool,
    /// Cap on fetched source bodies.
    pub max_source_size: u64,
    /// Simultaneous transforms.
    pub concurrency: usize,
    /// Transforms allowed to wait beyond the running ones.
    pub queue_size: usize,
    /// Deadline for resolving source bytes.
    pub load_timeout: Duration,
    /// Deadline for queueing plus codec work.
    pub process_timeout: Duration,
    /// Deadline for persisting to the result cache.
    pub save_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allow_unsafe: false,
            auto_webp: false,
            auto_avif: false,
            allowed_sources: Vec::new(),
            deny_private_networks: true,
            max_source_size: blob_store::DEFAULT_MAX_SIZE,
            concurrency: 20,
            queue_size: 100,
            load_timeout: Duration::from_secs(10),
            process_timeout: Duration::from_secs(20),
            save_timeout: Duration::from_secs(10),
        }
    }
}

/// A finished serve response.
#[derive(Clone, Debug)]
pub struct ServeOutput {
    /// Response media type.
    pub content_type: String,
    /// Encoded body.
    pub body: Vec<u8>,
}

/// JSON payload of the `meta` endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct MetaInfo {
    /// Final pixel width.
    pub width: u32,
    /// Final pixel height.
    pub height: u32,
    /// Output format name.
    pub format: String,
    /// `landscape`, `portrait`, or `square`.
    pub orientation: String,
}

/// The transformation pipeline and its collaborators.
#[derive(Clone)]
pub struct Pipeline {
    cfg: PipelineConfig,
    blobs: blob_store::BlobStore,
    cache: ResultCache,
    signer: Signer,
    engine: Engine,
    http: reqwest::Client,
}

impl Pipeline {
    /// Wire the pipeline to its stores and signer.
    pub fn new(
        cfg: PipelineConfig,
        blobs: blob_store::BlobStore,
        cache: ResultCache,
        signer: Signer,
    ) -> Result<Self, Error> {
        let engine = Engine::new(cfg.concurrency, cfg.queue_size, cfg.process_timeout);
        let http = reqwest::Client::builder()
            .timeout(cfg.load_timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { cfg, blobs, cache, signer, engine, http })
    }

    /// Serve one operation path (everything after `/serve/`), returning
    /// encoded image bytes or, for `meta` paths, a JSON description.
    #[instrument(skip(self, accept))]
    pub async fn serve(&self, ops_path: &str, accept: Option<&str>) -> Result<ServeOutput, Error> {
        let ops = self
            .signer
            .verify_serve_path(ops_path, self.cfg.allow_unsafe)
            .map_err(|e| Error::Forbidden(e.to_string()))?;
        let params = Params::parse(ops)?;
        if params.meta {
            return self.serve_meta(&params).await;
        }

        let prefer = self.negotiate(accept);
        let tag = prefer.map_or("source", OutputFormat::name);
        let digest = ResultCache::digest(&format!("{tag}@{}", params.to_path()));
        if let Some(hit) = self.cache.get(&digest).await? {
            debug!(%digest, "result cache hit");
            return Ok(ServeOutput { content_type: hit.content_type, body: hit.body });
        }

        let loaded = self.load(&params.source).await?;
        let processed = {
            let params = params.clone();
            let bytes = loaded.bytes;
            self.engine.run(move || processor::process(&params, &bytes, prefer)).await?
        };
        let content_type = processed.format.mime().to_string();
        match tokio::time::timeout(
            self.cfg.save_timeout,
            self.cache.put(&digest, &content_type, &processed.body),
        )
        .await
        {
            Ok(saved) => saved?,
            Err(_) => return Err(Error::Timeout { phase: "save" }),
        }
        Ok(ServeOutput { content_type, body: processed.body })
    }

    async fn serve_meta(&self, params: &Params) -> Result<ServeOutput, Error> {
        let loaded = self.load(&params.source).await?;
        let processed = {
            let params = params.clone();
            let bytes = loaded.bytes;
            self.engine.run(move || processor::process(&params, &bytes, None)).await?
        };
        let meta = MetaInfo {
            width: processed.width,
            height: processed.height,
            format: processed.format.name().to_string(),
            orientation: orientation(processed.width, processed.height).to_string(),
        };
        let body = serde_json::to_vec(&meta).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(ServeOutput { content_type: "application/json".to_string(), body })
    }

    async fn load(&self, src: &Source) -> Result<source::SourceBytes, Error> {
        let fut = async {
            match src {
                Source::Blob(key) => source::load_blob(&self.blobs, key).await,
                Source::Url(encoded) => source::fetch_url(&self.http, &self.cfg, encoded).await,
            }
        };
        match tokio::time::timeout(self.cfg.load_timeout, fut).await {
            Ok(loaded) => loaded,
            Err(_) => Err(Error::Timeout { phase: "load" }),
        }
    }

    fn negotiate(&self, accept: Option<&str>) -> Option<OutputFormat> {
        let accept = accept.unwrap_or("");
        if self.cfg.auto_avif && accept.contains("image/avif") {
            return Some(OutputFormat::Avif);
        }
        if self.cfg.auto_webp && accept.contains("image/webp") {
            return Some(OutputFormat::Webp);
        }
        None
    }
}

fn orientation(width: u32, height: u32) -> &'static str {
    match width.cmp(&height) {
        std::cmp::Ordering::Greater => "landscape",
        std::cmp::Ordering::Less => "portrait",
        std::cmp::Ordering::Equal => "square",
    }
}
