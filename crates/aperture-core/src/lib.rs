//! Aperture core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the aperture core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod clock {
    //! Clock abstraction so expiry and TTL checks are testable.

    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Source of "now" in milliseconds since UNIX epoch.
    pub trait Clock: Send + Sync {
        fn now_ms(&self) -> u64;
    }

    /// System (production) clock. Wraps SystemTime.
    #[derive(Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now_ms(&self) -> u64 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default()
        }
    }

    /// Virtual clock with manual control, for tests.
    pub struct VirtualClock {
        inner: Mutex<u64>,
    }

    impl VirtualClock {
        /// Create a new virtual clock seeded at `start_ms`.
        pub fn new(start_ms: u64) -> Self {
            Self { inner: Mutex::new(start_ms) }
        }

        /// Advance the virtual clock by `delta_ms`.
        pub fn advance_ms(&self, delta_ms: u64) {
            let mut now = self.inner.lock().expect("clock poisoned");
            *now = now.saturating_add(delta_ms);
        }

        /// Set the virtual clock to an absolute ms value.
        pub fn set_ms(&self, value: u64) {
            *self.inner.lock().expect("clock poisoned") = value;
        }
    }

    impl Clock for VirtualClock {
        fn now_ms(&self) -> u64 {
            *self.inner.lock().expect("clock poisoned")
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn virtual_clock_is_deterministic() {
            let clk = VirtualClock::new(1_000);
            assert_eq!(clk.now_ms(), 1_000);
            clk.advance_ms(5);
            assert_eq!(clk.now_ms(), 1_005);
            clk.set_ms(42);
            assert_eq!(clk.now_ms(), 42);
        }

        #[test]
        fn system_clock_is_past_2020() {
            let clk = SystemClock;
            assert!(clk.now_ms() > 1_577_836_800_000);
        }
    }
}

pub mod hash {
    //! MD5 content hashes and the two-level fanout path scheme.

    use md5::{Digest as _, Md5};
    use std::path::PathBuf;

    /// 16-byte MD5 digest of a blob body.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct ContentHash(pub [u8; 16]);

    impl ContentHash {
        /// Hex-encoded lowercase string (32 chars).
        pub fn to_hex(&self) -> String {
            hex::encode(self.0)
        }

        /// Parse a 32-char lowercase hex digest. Strict.
        pub fn parse_hex(s: &[u8]) -> Option<Self> {
            if s.len() != 32 {
                return None;
            }
            let mut out = [0u8; 16];
            hex::decode_to_slice(s, &mut out).ok()?;
            Some(Self(out))
        }

        /// Compute the hash of `bytes` in one shot.
        pub fn of(bytes: &[u8]) -> Self {
            let mut h = Md5::new();
            h.update(bytes);
            Self(h.finalize().into())
        }
    }

    /// Relative path of a blob file under the upload root:
    /// `<b0>/<b1>/<hex(key)>`, where `b0`/`b1` are the first two bytes
    /// of MD5(key) as two-hex-digit directory names. 65,536 shards.
    pub fn fanout_rel_path(key: &[u8]) -> PathBuf {
        let digest = ContentHash::of(key).0;
        let mut p = PathBuf::from(format!("{:02x}", digest[0]));
        p.push(format!("{:02x}", digest[1]));
        p.push(hex::encode(key));
        p
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn known_digest() {
            // md5("hello world!") per RFC 1321 reference implementation
            let h = ContentHash::of(b"hello world!");
            assert_eq!(h.to_hex(), "fc3ff98e8c6a0d3087d515c0473f8677");
        }

        #[test]
        fn hex_round_trip() {
            let h = ContentHash::of(b"abc");
            let parsed = ContentHash::parse_hex(h.to_hex().as_bytes()).unwrap();
            assert_eq!(parsed, h);
        }

        #[test]
        fn parse_rejects_bad_input() {
            assert!(ContentHash::parse_hex(b"").is_none());
            assert!(ContentHash::parse_hex(b"zz3ff98e8c6a0d3087d515c0473f8677").is_none());
            assert!(ContentHash::parse_hex(b"fc3ff98e").is_none());
        }

        #[test]
        fn fanout_shape() {
            let p = fanout_rel_path(b"a/b.jpg");
            let parts: Vec<_> = p.iter().map(|c| c.to_string_lossy().into_owned()).collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0].len(), 2);
            assert_eq!(parts[1].len(), 2);
            assert_eq!(parts[2], hex::encode(b"a/b.jpg"));
        }

        #[test]
        fn fanout_is_stable() {
            assert_eq!(fanout_rel_path(b"k"), fanout_rel_path(b"k"));
        }
    }
}

pub mod record {
    //! Wire codec for the per-key index record.
    //!
    //! A record is `DELETED`-prefixed iff the key is soft-deleted,
    //! followed by `HASH` plus 32 lowercase hex chars iff a body was
    //! ever successfully written. The empty byte string is a live
    //! record with no hash.

    use super::hash::ContentHash;
    use thiserror::Error;

    const DELETED_PREFIX: &[u8] = b"DELETED";
    const HASH_PREFIX: &[u8] = b"HASH";

    /// Errors emitted by the record codec.
    #[derive(Debug, Error)]
    pub enum RecordError {
        /// The absent state has no wire form.
        #[error("absent record has no encoding")]
        InvariantViolation,
    }

    /// State of one key in the index.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Record {
        /// No record present for the key.
        Absent,
        /// The key is live; a blob file exists when `hash` is set.
        Live {
            /// MD5 of the last successfully written body, if any.
            hash: Option<ContentHash>,
        },
        /// The key is soft-deleted; the record is retained for listing.
        Tombstoned {
            /// Hash carried over from the last live state, if any.
            hash: Option<ContentHash>,
        },
    }

    impl Record {
        /// Serialize to the index value bytes. `Absent` cannot be encoded.
        pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
            let (deleted, hash) = match self {
                Self::Absent => return Err(RecordError::InvariantViolation),
                Self::Live { hash } => (false, hash),
                Self::Tombstoned { hash } => (true, hash),
            };
            let mut out = Vec::with_capacity(DELETED_PREFIX.len() + HASH_PREFIX.len() + 32);
            if deleted {
                out.extend_from_slice(DELETED_PREFIX);
            }
            if let Some(h) = hash {
                out.extend_from_slice(HASH_PREFIX);
                out.extend_from_slice(h.to_hex().as_bytes());
            }
            Ok(out)
        }

        /// Parse index value bytes. Tolerant: anything malformed decodes
        /// as a live record with no hash rather than failing the read path.
        pub fn decode(bytes: &[u8]) -> Self {
            let (tombstoned, rest) = match bytes.strip_prefix(DELETED_PREFIX) {
                Some(rest) => (true, rest),
                None => (false, bytes),
            };
            let hash = if rest.is_empty() {
                None
            } else {
                match rest.strip_prefix(HASH_PREFIX).and_then(ContentHash::parse_hex) {
                    Some(h) => Some(h),
                    None => return Self::Live { hash: None },
                }
            };
            if tombstoned {
                Self::Tombstoned { hash }
            } else {
                Self::Live { hash }
            }
        }

        /// Content hash, for either present state.
        pub fn hash(&self) -> Option<ContentHash> {
            match self {
                Self::Absent => None,
                Self::Live { hash } | Self::Tombstoned { hash } => *hash,
            }
        }

        /// True for `Live`.
        pub fn is_live(&self) -> bool {
            matches!(self, Self::Live { .. })
        }

        /// True for `Tombstoned`.
        pub fn is_tombstoned(&self) -> bool {
            matches!(self, Self::Tombstoned { .. })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use proptest::prelude::*;

        #[test]
        fn encode_shapes() {
            let h = ContentHash::of(b"x");
            assert_eq!(Record::Live { hash: None }.encode().unwrap(), b"");
            assert_eq!(
                Record::Tombstoned { hash: None }.encode().unwrap(),
                b"DELETED"
            );
            let live = Record::Live { hash: Some(h) }.encode().unwrap();
            assert_eq!(&live[..4], b"HASH");
            assert_eq!(live.len(), 4 + 32);
            let tomb = Record::Tombstoned { hash: Some(h) }.encode().unwrap();
            assert!(tomb.starts_with(b"DELETEDHASH"));
        }

        #[test]
        fn absent_has_no_encoding() {
            assert!(matches!(
                Record::Absent.encode(),
                Err(RecordError::InvariantViolation)
            ));
        }

        #[test]
        fn tolerant_decode() {
            assert_eq!(Record::decode(b"garbage"), Record::Live { hash: None });
            assert_eq!(Record::decode(b"HASHnothex"), Record::Live { hash: None });
            assert_eq!(Record::decode(b"HASHfc3f"), Record::Live { hash: None });
            assert_eq!(
                Record::decode(b"DELETEDHASHzz3ff98e8c6a0d3087d515c0473f8677"),
                Record::Live { hash: None }
            );
            assert_eq!(Record::decode(b""), Record::Live { hash: None });
            assert_eq!(Record::decode(b"DELETED"), Record::Tombstoned { hash: None });
        }

        fn legal_records() -> impl Strategy<Value = Record> {
            let hash = proptest::option::of(
                proptest::array::uniform16(any::<u8>()).prop_map(ContentHash),
            );
            prop_oneof![
                hash.clone().prop_map(|hash| Record::Live { hash }),
                hash.prop_map(|hash| Record::Tombstoned { hash }),
            ]
        }

        proptest! {
            #[test]
            fn round_trip(rec in legal_records()) {
                let encoded = rec.encode().unwrap();
                prop_assert_eq!(Record::decode(&encoded), rec);
            }
        }
    }
}
