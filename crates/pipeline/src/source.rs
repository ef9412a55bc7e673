//! Source resolution: blob store keys and allow-listed remote URLs.

use percent_encoding::percent_decode_str;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::net::IpAddr;
use tokio::io::AsyncReadExt;
use tracing::debug;
use url::Url;

use crate::{Error, PipelineConfig};

/// Loaded source bytes plus the upstream's claimed type, if any.
pub struct SourceBytes {
    /// Raw body.
    pub bytes: Vec<u8>,
    /// Content type reported by the origin (url sources only).
    pub content_type: Option<String>,
}

/// Read a blob-store source into memory.
pub async fn load_blob(store: &blob_store::BlobStore, key: &str) -> Result<SourceBytes, Error> {
    let mut got = store.get(key.as_bytes()).await?;
    let mut bytes = Vec::with_capacity(got.size as usize);
    got.file.read_to_end(&mut bytes).await.map_err(|e| Error::Internal(e.to_string()))?;
    Ok(SourceBytes { bytes, content_type: Some(got.content_type) })
}

/// Fetch a percent-encoded remote URL, enforcing the host allow-list,
/// the private-network policy, and the size cap.
pub async fn fetch_url(
    client: &reqwest::Client,
    cfg: &PipelineConfig,
    encoded: &str,
) -> Result<SourceBytes, Error> {
    let decoded = percent_decode_str(encoded)
        .decode_utf8()
        .map_err(|_| Error::BadRequest("url source is not valid UTF-8".to_string()))?;
    let url = Url::parse(&decoded)
        .map_err(|e| Error::BadRequest(format!("url source: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Forbidden(format!("scheme `{}` not allowed", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::BadRequest("url source has no host".to_string()))?;
    if !host_allowed(host, &cfg.allowed_sources) {
        return Err(Error::Forbidden(format!("host `{host}` not in allow-list")));
    }
    if cfg.deny_private_networks && is_private_host(host) {
        return Err(Error::Forbidden(format!("host `{host}` resolves to a private network")));
    }

    debug!(%url, "fetching remote source");
    let resp = client
        .get(url)
        .header(ACCEPT, "image/*")
        .send()
        .await
        .map_err(fetch_error)?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::NotFound);
    }
    if !resp.status().is_success() {
        return Err(Error::NotFound);
    }
    if let Some(len) = resp.content_length() {
        if len > cfg.max_source_size {
            return Err(Error::PayloadTooLarge);
        }
    }
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
    if let Some(ct) = &content_type {
        if !ct.starts_with("image/") {
            return Err(Error::UnsupportedMediaType(ct.clone()));
        }
    }

    let mut resp = resp;
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = resp.chunk().await.map_err(fetch_error)? {
        if bytes.len() as u64 + chunk.len() as u64 > cfg.max_source_size {
            return Err(Error::PayloadTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(SourceBytes { bytes, content_type })
}

fn fetch_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout { phase: "load" }
    } else {
        // connect/dns/protocol failures read as an unresolved source
        Error::NotFound
    }
}

/// Case-insensitive host match against comma-split glob patterns
/// (`*` matches any run of characters). An empty list denies all.
pub fn host_allowed(host: &str, patterns: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    patterns.iter().any(|p| glob_match(&p.to_ascii_lowercase(), &host))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Loopback, private, and link-local targets by IP literal or the
/// `localhost` name.
pub fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    match literal.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Ok(IpAddr::V6(ip)) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}
