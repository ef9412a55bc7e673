//! Durable key→bytes blob store.
//!
//! Overview
//! - Keys are opaque client-chosen byte strings; bodies live as plain
//!   files under a two-level fanout derived from MD5(key).
//! - An ordered index (sled) holds one record per key: tombstone state
//!   plus the MD5 of the last successfully written body.
//! - Atomicity & durability: bodies stream into a uniquely named temp
//!   file in the shard directory, `fsync`, atomic rename, then the
//!   index record is flushed before the operation reports success.
//! - Writers hold a per-key in-memory lock; contention fails fast with
//!   `Conflict` rather than queuing. Reads never lock.
//! - Fail-closed: any error (or a dropped in-flight put) rolls the key
//!   back to its pre-put state and removes the temp file.

#![deny(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aperture_core::hash::{fanout_rel_path, ContentHash};
use aperture_core::record::{Record, RecordError};
use dashmap::DashSet;
use md5::{Digest as _, Md5};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

const CHUNK_SIZE: usize = 64 * 1024;
const SNIFF_LEN: usize = 512;

/// Hard cap on keys returned (or scanned unbounded) by one list call.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Default body size cap (bytes).
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Errors emitted by blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The empty key is not a valid key.
    #[error("empty key")]
    EmptyKey,
    /// Another writer currently holds this key.
    #[error("concurrent write on key")]
    Conflict,
    /// Put requires a non-zero declared content length.
    #[error("content length required")]
    LengthRequired,
    /// Declared or streamed body exceeds the size cap, or a list scan
    /// exceeds [`MAX_QUERY_LIMIT`].
    #[error("payload too large")]
    PayloadTooLarge,
    /// Sniffed media type is not in the configured allow-list.
    #[error("unsupported media type: {detected}")]
    UnsupportedMediaType {
        /// The type the sniffer reported.
        detected: String,
    },
    /// Key absent, soft-deleted, or blob file missing.
    #[error("not found")]
    NotFound,
    /// Soft-delete policy requires `unlink=true` for live keys.
    #[error("live keys require unlink")]
    SoftDeleteRequired,
    /// Record codec failure.
    #[error("record: {0}")]
    Record(#[from] RecordError),
    /// Index failure.
    #[error("index: {0}")]
    Index(#[from] sled::Error),
    /// Underlying IO failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob store configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory for blob files (fanout shards live below it).
    pub upload_path: PathBuf,
    /// Directory for the ordered index. Holds the single-process lock.
    pub index_path: PathBuf,
    /// Maximum accepted body size in bytes.
    pub max_size: u64,
    /// When set, hard-deleting a live key is refused; clients must
    /// soft-delete (`unlink=true`) first.
    pub require_unlink: bool,
    /// Sniffed-type allow-list. `None` accepts anything.
    pub allowed_types: Option<Vec<String>>,
}

impl Config {
    /// Config with defaults: 10 MiB cap, hard deletes allowed, any type.
    pub fn new(upload_path: PathBuf, index_path: PathBuf) -> Self {
        Self {
            upload_path,
            index_path,
            max_size: DEFAULT_MAX_SIZE,
            require_unlink: false,
            allowed_types: None,
        }
    }
}

/// In-memory set of keys with a writer in flight.
#[derive(Clone, Default)]
struct LockSet {
    keys: Arc<DashSet<Vec<u8>>>,
}

impl LockSet {
    /// Claim `key`; `None` if another writer holds it.
    fn acquire(&self, key: &[u8]) -> Option<KeyLock> {
        if self.keys.insert(key.to_vec()) {
            Some(KeyLock { keys: Arc::clone(&self.keys), key: key.to_vec() })
        } else {
            None
        }
    }
}

/// RAII guard; releases the key on every exit path.
struct KeyLock {
    keys: Arc<DashSet<Vec<u8>>>,
    key: Vec<u8>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

/// Undoes a partially applied put when dropped before `disarm`.
#[derive(Default)]
struct WriteRollback {
    file: Option<PathBuf>,
    reservation: Option<(sled::Db, Vec<u8>)>,
}

impl WriteRollback {
    fn disarm(&mut self) {
        self.file = None;
        self.reservation = None;
    }
}

impl Drop for WriteRollback {
    fn drop(&mut self) {
        if let Some(path) = self.file.take() {
            let _ = std::fs::remove_file(path);
        }
        if let Some((db, key)) = self.reservation.take() {
            let _ = db.remove(&key);
        }
    }
}

/// Receipt for a completed put.
#[derive(Clone, Debug)]
pub struct PutReceipt {
    /// MD5 of the stored bytes.
    pub hash: ContentHash,
    /// Stored byte count.
    pub size: u64,
    /// Sniffed media type.
    pub content_type: String,
}

/// Metadata for a live blob.
#[derive(Clone, Debug)]
pub struct BlobStat {
    /// Stored byte count.
    pub size: u64,
    /// MD5 of the stored bytes.
    pub hash: ContentHash,
    /// Media type sniffed from the stored prefix.
    pub content_type: String,
}

/// An open live blob: file handle positioned at the start plus metadata.
pub struct BlobGet {
    /// Readable handle on the blob file.
    pub file: fs::File,
    /// Stored byte count.
    pub size: u64,
    /// MD5 of the stored bytes.
    pub hash: ContentHash,
    /// Media type sniffed from the stored prefix.
    pub content_type: String,
}

/// Parameters for one list call.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    /// Only keys with this prefix are returned.
    pub prefix: Vec<u8>,
    /// Inclusive lower bound; ignored when below the prefix.
    pub starting_at: Option<Vec<u8>>,
    /// Maximum keys to return. `0` scans unbounded (up to the cap).
    pub limit: usize,
    /// `true` lists soft-deleted keys instead of live ones.
    pub unlinked: bool,
}

/// One page of keys in ascending order.
#[derive(Clone, Debug)]
pub struct ListPage {
    /// Matching keys, ascending.
    pub keys: Vec<Vec<u8>>,
    /// Whether further matching keys exist past this page.
    pub has_more: bool,
    /// First unreturned matching key, usable as the next `starting_at`.
    pub next_starting_at: Option<Vec<u8>>,
}

/// Blob store over a local filesystem and an ordered index.
#[derive(Clone)]
pub struct BlobStore {
    cfg: Config,
    index: sled::Db,
    locks: LockSet,
}

impl BlobStore {
    /// Open the index (taking its exclusive file lock) and ensure the
    /// upload root exists.
    pub fn open(cfg: Config) -> Result<Self, Error> {
        std::fs::create_dir_all(&cfg.upload_path)?;
        let index = sled::open(&cfg.index_path)?;
        Ok(Self { cfg, index, locks: LockSet::default() })
    }

    /// Absolute path of the blob file for `key`.
    pub fn blob_path(&self, key: &[u8]) -> PathBuf {
        self.cfg.upload_path.join(fanout_rel_path(key))
    }

    /// Store `body` under `key`. Overwrites a live key in place; the
    /// prior bytes survive until the atomic rename lands.
    #[instrument(skip_all, fields(key = %String::from_utf8_lossy(key)))]
    pub async fn put<R>(
        &self,
        key: &[u8],
        mut body: R,
        declared_len: u64,
    ) -> Result<PutReceipt, Error>
    where
        R: AsyncRead + Unpin,
    {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if declared_len == 0 {
            return Err(Error::LengthRequired);
        }
        if declared_len > self.cfg.max_size {
            return Err(Error::PayloadTooLarge);
        }
        let _lock = self.locks.acquire(key).ok_or(Error::Conflict)?;

        let prior = self.read_record(key)?;
        let mut rollback = WriteRollback::default();
        if matches!(prior, Record::Absent) {
            // Reserve the key so a crash mid-put leaves a visible tombstone.
            self.write_record(key, &Record::Tombstoned { hash: None }).await?;
            rollback.reservation = Some((self.index.clone(), key.to_vec()));
        }

        let final_path = self.blob_path(key);
        if let Some(shard) = final_path.parent() {
            fs::create_dir_all(shard).await?;
        }
        let (temp_path, mut file) = create_temp(&final_path).await?;
        rollback.file = Some(temp_path.clone());

        let mut hasher = Md5::new();
        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut checked_type: Option<String> = None;
        let mut written: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > self.cfg.max_size {
                return Err(Error::PayloadTooLarge);
            }
            hasher.update(&buf[..n]);
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(n);
                head.extend_from_slice(&buf[..take]);
            }
            file.write_all(&buf[..n]).await?;
            if checked_type.is_none() && head.len() >= SNIFF_LEN {
                checked_type = Some(self.check_media_type(&head)?);
            }
        }
        let content_type = match checked_type {
            Some(t) => t,
            None => self.check_media_type(&head)?,
        };

        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await?;
        // From here a failed index write must not strand a fresh blob file.
        rollback.file = if matches!(prior, Record::Absent) { Some(final_path) } else { None };

        let hash = ContentHash(hasher.finalize().into());
        self.write_record(key, &Record::Live { hash: Some(hash) }).await?;
        rollback.disarm();
        debug!(size = written, hash = %hash.to_hex(), "put complete");
        Ok(PutReceipt { hash, size: written, content_type })
    }

    /// Open the live blob under `key` for reading.
    pub async fn get(&self, key: &[u8]) -> Result<BlobGet, Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let hash = match self.read_record(key)? {
            Record::Live { hash: Some(hash) } => hash,
            _ => return Err(Error::NotFound),
        };
        let path = self.blob_path(key);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let mut head = vec![0u8; SNIFF_LEN.min(size as usize)];
        file.read_exact(&mut head).await?;
        file.seek(io::SeekFrom::Start(0)).await?;
        Ok(BlobGet { file, size, hash, content_type: sniff(&head) })
    }

    /// Metadata for the live blob under `key`, without the body.
    pub async fn head(&self, key: &[u8]) -> Result<BlobStat, Error> {
        let got = self.get(key).await?;
        Ok(BlobStat { size: got.size, hash: got.hash, content_type: got.content_type })
    }

    /// Delete `key`. `unlink=false` removes the record and blob file;
    /// `unlink=true` writes a tombstone (retained for listing) and
    /// removes the blob file.
    #[instrument(skip_all, fields(key = %String::from_utf8_lossy(key), unlink))]
    pub async fn delete(&self, key: &[u8], unlink: bool) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let _lock = self.locks.acquire(key).ok_or(Error::Conflict)?;
        let record = self.read_record(key)?;
        if matches!(record, Record::Absent) {
            return Err(Error::NotFound);
        }
        if unlink {
            remove_if_present(&self.blob_path(key)).await?;
            self.write_record(key, &Record::Tombstoned { hash: record.hash() }).await?;
        } else {
            if self.cfg.require_unlink && record.is_live() {
                return Err(Error::SoftDeleteRequired);
            }
            remove_if_present(&self.blob_path(key)).await?;
            self.index.remove(key)?;
            self.index.flush_async().await?;
        }
        debug!("delete complete");
        Ok(())
    }

    /// List keys in ascending order, filtered by prefix and tombstone
    /// state. See [`ListQuery`] and [`MAX_QUERY_LIMIT`].
    pub fn list(&self, q: &ListQuery) -> Result<ListPage, Error> {
        if q.limit > MAX_QUERY_LIMIT {
            return Err(Error::PayloadTooLarge);
        }
        let unbounded = q.limit == 0;
        let cap = if unbounded { MAX_QUERY_LIMIT } else { q.limit };
        let start = match &q.starting_at {
            Some(s) if s.as_slice() > q.prefix.as_slice() => s.clone(),
            _ => q.prefix.clone(),
        };
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut has_more = false;
        let mut next_starting_at = None;
        for item in self.index.range(start..) {
            let (k, v) = item?;
            if !k.starts_with(&q.prefix) {
                break;
            }
            let rec = Record::decode(&v);
            let wanted = if q.unlinked { rec.is_tombstoned() } else { rec.is_live() };
            if !wanted {
                continue;
            }
            if keys.len() == cap {
                if unbounded {
                    return Err(Error::PayloadTooLarge);
                }
                has_more = true;
                next_starting_at = Some(k.to_vec());
                break;
            }
            keys.push(k.to_vec());
        }
        Ok(ListPage { keys, has_more, next_starting_at })
    }

    fn read_record(&self, key: &[u8]) -> Result<Record, Error> {
        Ok(match self.index.get(key)? {
            Some(v) => Record::decode(&v),
            None => Record::Absent,
        })
    }

    async fn write_record(&self, key: &[u8], rec: &Record) -> Result<(), Error> {
        self.index.insert(key, rec.encode()?)?;
        self.index.flush_async().await?;
        Ok(())
    }

    fn check_media_type(&self, head: &[u8]) -> Result<String, Error> {
        let detected = sniff(head);
        match &self.cfg.allowed_types {
            Some(allow) if !allow.iter().any(|a| a == &detected) => {
                Err(Error::UnsupportedMediaType { detected })
            }
            _ => Ok(detected),
        }
    }
}

/// Sniff a media type from a body prefix.
pub fn sniff(head: &[u8]) -> String {
    infer::get(head)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

async fn create_temp(final_path: &Path) -> io::Result<(PathBuf, fs::File)> {
    let mut i = 0u64;
    loop {
        let candidate = final_path.with_extension(format!("{i}.incomplete"));
        match fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(f) => return Ok((candidate, f)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                i = i.wrapping_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_falls_back_to_octet_stream() {
        assert_eq!(sniff(b"hello world!"), "application/octet-stream");
    }

    #[test]
    fn sniff_detects_png() {
        let png_magic = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
        assert_eq!(sniff(png_magic), "image/png");
    }

    #[test]
    fn lock_set_is_exclusive_per_key() {
        let locks = LockSet::default();
        let a = locks.acquire(b"k");
        assert!(a.is_some());
        assert!(locks.acquire(b"k").is_none());
        assert!(locks.acquire(b"other").is_some());
        drop(a);
        assert!(locks.acquire(b"k").is_some());
    }
}
