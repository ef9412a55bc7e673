//! Digest-addressed on-disk cache of transformed outputs.
//!
//! Entries are plain files under a two-level fanout: one header line
//! carrying the content type, then the encoded body. The filesystem
//! hierarchy is the index; freshness comes from file modification
//! time checked against the TTL on every read. Writes use the same
//! temp-file-then-rename discipline as the blob store.

#![deny(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use aperture_core::clock::Clock;
use sha2::{Digest as _, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors emitted by the result cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying IO failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A cache hit: content type plus encoded body.
#[derive(Clone, Debug)]
pub struct CachedResult {
    /// Media type recorded at store time.
    pub content_type: String,
    /// Encoded output bytes.
    pub body: Vec<u8>,
}

/// TTL'd cache of transformation outputs keyed by params digest.
#[derive(Clone)]
pub struct ResultCache {
    root: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    /// Create the cache root if needed.
    pub fn new(root: PathBuf, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, ttl, clock })
    }

    /// SHA-256 hex digest of a normalized operation path.
    pub fn digest(normalized_path: &str) -> String {
        let mut h = Sha256::new();
        h.update(normalized_path.as_bytes());
        hex::encode(h.finalize())
    }

    /// Entry path for `digest` (two-level fanout on the digest prefix).
    pub fn entry_path(&self, digest: &str) -> PathBuf {
        let (a, b) = (&digest[0..2], &digest[2..4]);
        self.root.join(a).join(b).join(digest)
    }

    /// Look up `digest`. Expired or unreadable entries are removed and
    /// reported as a miss.
    pub async fn get(&self, digest: &str) -> Result<Option<CachedResult>, Error> {
        let path = self.entry_path(digest);
        let meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.is_expired(&meta) {
            debug!(digest, "cache entry expired");
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        let raw = fs::read(&path).await?;
        match parse_entry(&raw) {
            Some(hit) => Ok(Some(hit)),
            None => {
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Store an encoded result under `digest`.
    pub async fn put(&self, digest: &str, content_type: &str, body: &[u8]) -> Result<(), Error> {
        let path = self.entry_path(digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = path.with_extension("incomplete");
        {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(content_type.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.write_all(body).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    /// Walk the cache and drop expired entries and incomplete
    /// artifacts; returns the number removed.
    pub fn sweep(&self) -> Result<usize, Error> {
        fn walk(cache: &ResultCache, dir: &Path, removed: &mut usize) -> io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    let _ = walk(cache, &path, removed);
                    continue;
                }
                let incomplete =
                    path.extension().map(|e| e == "incomplete").unwrap_or(false);
                let expired =
                    entry.metadata().map(|m| cache.is_expired(&m)).unwrap_or(false);
                if incomplete || expired {
                    std::fs::remove_file(&path)?;
                    *removed += 1;
                }
            }
            Ok(())
        }
        let mut removed = 0usize;
        let _ = walk(self, &self.root, &mut removed);
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
        Ok(removed)
    }

    fn is_expired(&self, meta: &std::fs::Metadata) -> bool {
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let age_ms = self.clock.now_ms().saturating_sub(modified_ms);
        age_ms > self.ttl.as_millis() as u64
    }
}

fn parse_entry(raw: &[u8]) -> Option<CachedResult> {
    let split = raw.iter().position(|b| *b == b'\n')?;
    let content_type = std::str::from_utf8(&raw[..split]).ok()?.to_string();
    Some(CachedResult { content_type, body: raw[split + 1..].to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_hex_sha256() {
        let d = ResultCache::digest("100x100/blob/a.jpg");
        assert_eq!(d.len(), 64);
        assert!(d.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(d, ResultCache::digest("100x100/blob/a.jpg"));
        assert_ne!(d, ResultCache::digest("101x100/blob/a.jpg"));
    }

    #[test]
    fn entry_parsing() {
        let hit = parse_entry(b"image/png\nBODY").unwrap();
        assert_eq!(hit.content_type, "image/png");
        assert_eq!(hit.body, b"BODY");
        assert!(parse_entry(b"no-newline").is_none());
    }
}
