//! Environment-driven configuration, loaded once at startup.

use clap::Parser;
use std::path::PathBuf;

/// All recognized options. Every field binds an environment variable;
/// flags exist mostly for local development.
#[derive(Parser, Clone, Debug)]
#[command(name = "apertured", version, about = "Self-hosted image storage and transformation service")]
pub struct Config {
    /// Listen address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Listen port.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
    /// TLS certificate chain (PEM); enables TLS together with the key.
    #[arg(long, env = "CERT_FILE")]
    pub cert_file: Option<PathBuf>,
    /// TLS private key (PEM).
    #[arg(long, env = "CERT_KEY_FILE")]
    pub cert_key_file: Option<PathBuf>,
    /// Upload size cap in bytes.
    #[arg(long, env = "MAX_UPLOAD_SIZE", default_value_t = blob_store::DEFAULT_MAX_SIZE)]
    pub max_upload_size: u64,
    /// Root directory for blob files.
    #[arg(long, env = "UPLOAD_PATH", default_value = "data/uploads")]
    pub upload_path: PathBuf,
    /// Directory for the ordered index (env name kept for
    /// compatibility with earlier deployments).
    #[arg(long = "index-path", env = "LEVELDB_PATH", default_value = "data/index")]
    pub index_path: PathBuf,
    /// Root directory for the result cache.
    #[arg(long, env = "CACHE_PATH", default_value = "data/cache")]
    pub cache_path: PathBuf,
    /// Shared API key checked on `x-api-key`.
    #[arg(long, env = "SECRET_KEY")]
    pub secret_key: String,
    /// HMAC secret behind signed URLs.
    #[arg(long, env = "SIGNATURE_SECRET_KEY")]
    pub signature_secret_key: String,
    /// Comma-separated host globs allowed as `url/` sources.
    #[arg(long, env = "SERVE_ALLOWED_HTTP_SOURCES", value_delimiter = ',')]
    pub serve_allowed_http_sources: Vec<String>,
    /// Emit WebP when the client accepts it.
    #[arg(long, env = "SERVE_AUTO_WEBP")]
    pub serve_auto_webp: bool,
    /// Emit AVIF when the client accepts it.
    #[arg(long, env = "SERVE_AUTO_AVIF")]
    pub serve_auto_avif: bool,
    /// Simultaneous transforms.
    #[arg(long, env = "SERVE_CONCURRENCY", default_value_t = 20)]
    pub serve_concurrency: usize,
    /// Transforms allowed to queue beyond the running ones.
    #[arg(long, env = "SERVE_QUEUE_SIZE", default_value_t = 100)]
    pub serve_queue_size: usize,
    /// Result cache TTL, seconds.
    #[arg(long, env = "SERVE_RESULT_CACHE_TTL", default_value_t = 24 * 60 * 60)]
    pub serve_result_cache_ttl: u64,
    /// `max-age` for serve responses, seconds.
    #[arg(long, env = "SERVE_CACHE_CONTROL_TTL", default_value_t = 365 * 24 * 60 * 60)]
    pub serve_cache_control_ttl: u64,
    /// `stale-while-revalidate` for serve responses, seconds.
    #[arg(long, env = "SERVE_CACHE_CONTROL_SWR", default_value_t = 24 * 60 * 60)]
    pub serve_cache_control_swr: u64,
    /// Whole-request deadline, seconds.
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,
    /// Source-load deadline, seconds.
    #[arg(long, env = "SERVE_LOAD_TIMEOUT", default_value_t = 10)]
    pub serve_load_timeout: u64,
    /// Queue-plus-codec deadline, seconds.
    #[arg(long, env = "SERVE_PROCESS_TIMEOUT", default_value_t = 20)]
    pub serve_process_timeout: u64,
    /// Cache-write deadline, seconds.
    #[arg(long, env = "SERVE_SAVE_TIMEOUT", default_value_t = 10)]
    pub serve_save_timeout: u64,
    /// Comma-separated CORS origins; `*` allows any.
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub cors_allowed_origins: Vec<String>,
    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    /// `development` enables the `unsafe` serve segment.
    #[arg(long, env = "ENVIRONMENT", default_value = "production")]
    pub environment: String,
    /// Require `unlink=true` before live keys can be hard-deleted.
    #[arg(long, env = "REQUIRE_UNLINK")]
    pub require_unlink: bool,
}

impl Config {
    /// Whether the literal `unsafe` signature segment is accepted.
    pub fn unsafe_mode(&self) -> bool {
        matches!(self.environment.as_str(), "development" | "dev")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_only_secrets() {
        let cfg = Config::try_parse_from([
            "apertured",
            "--secret-key",
            "pw",
            "--signature-secret-key",
            "sk",
        ])
        .unwrap();
        assert_eq!(cfg.port, 3000);
        assert!(!cfg.unsafe_mode());
        assert!(cfg.serve_allowed_http_sources.is_empty());
    }

    #[test]
    fn dev_environment_enables_unsafe() {
        let cfg = Config::try_parse_from([
            "apertured",
            "--secret-key",
            "pw",
            "--signature-secret-key",
            "sk",
            "--environment",
            "development",
        ])
        .unwrap();
        assert!(cfg.unsafe_mode());
    }
}
