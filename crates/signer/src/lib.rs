//! HMAC-signed URL minting and constant-time access checks.
//!
//! Two secrets, loaded once at startup: the shared API key checked on
//! the `x-api-key` header, and the signing secret behind HMAC-SHA256
//! URL signatures. `/files` signatures carry a millisecond expiry;
//! `/serve` signatures commit to the transform path alone and ride in
//! the first path segment. All comparisons are constant-time.

#![deny(unsafe_code)]

use std::sync::Arc;

use aperture_core::clock::Clock;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a signed `/files` URL.
pub const URL_TTL_MS: u64 = 60 * 60 * 1000;

/// Query parameter carrying the signature.
pub const SIGNATURE_PARAM: &str = "x-signature";
/// Query parameter carrying the millisecond expiry.
pub const EXPIRE_PARAM: &str = "x-expire";

/// Errors emitted by signing and verification.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signature or API key did not verify.
    #[error("unauthorized")]
    Unauthorized,
    /// The signature verified but its expiry has passed.
    #[error("signature expired")]
    Expired,
    /// The sign target is not a signable path.
    #[error("invalid sign path")]
    InvalidPath,
}

/// Stateless signer/verifier around the two shared secrets.
#[derive(Clone)]
pub struct Signer {
    api_secret: String,
    sign_secret: String,
    clock: Arc<dyn Clock>,
}

impl Signer {
    /// Build a signer from the two secrets and a clock.
    pub fn new(
        api_secret: impl Into<String>,
        sign_secret: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { api_secret: api_secret.into(), sign_secret: sign_secret.into(), clock }
    }

    /// URL-safe base64 (no padding) of HMAC-SHA256 over `message`.
    /// One leading `/` is stripped so `/a/b` and `a/b` sign alike.
    pub fn sign(&self, message: &str) -> String {
        let message = message.strip_prefix('/').unwrap_or(message);
        let mut mac = HmacSha256::new_from_slice(self.sign_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Mint a signed URL for the path beneath `/sign`.
    ///
    /// `/sign/files/...` gains `x-expire` (now + [`URL_TTL_MS`]) and
    /// `x-signature` query parameters; `/sign/serve/...` gains the
    /// signature as its first operation segment. Existing query
    /// parameters are preserved.
    pub fn sign_url(&self, input: &str) -> Result<String, Error> {
        let (path, query) = match input.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (input, None),
        };
        let target = path.strip_prefix("/sign").ok_or(Error::InvalidPath)?;
        if target.starts_with("/files") {
            let expire = self.clock.now_ms() + URL_TTL_MS;
            let signature = self.sign(&format!("{target}:{expire}"));
            let mut out = String::from(target);
            out.push('?');
            if let Some(q) = query {
                out.push_str(q);
                out.push('&');
            }
            out.push_str(&format!("{EXPIRE_PARAM}={expire}&{SIGNATURE_PARAM}={signature}"));
            Ok(out)
        } else if let Some(ops) = target.strip_prefix("/serve") {
            let signature = self.sign(ops);
            let mut out = format!("/serve/{signature}{ops}");
            if let Some(q) = query {
                out.push('?');
                out.push_str(q);
            }
            Ok(out)
        } else {
            Err(Error::InvalidPath)
        }
    }

    /// Constant-time check of the shared API key.
    pub fn verify_api_key(&self, presented: &str) -> bool {
        ct_eq(presented.as_bytes(), self.api_secret.as_bytes())
    }

    /// Verify a signed `/files` request: both query parameters present,
    /// not expired (`now > expire` is expired), and the signature over
    /// `<path>:<expire>` matches.
    pub fn verify_files_request(
        &self,
        path: &str,
        expire: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), Error> {
        let (expire, signature) = match (expire, signature) {
            (Some(e), Some(s)) => (e, s),
            _ => return Err(Error::Unauthorized),
        };
        let expire_ms: u64 = expire.parse().map_err(|_| Error::Unauthorized)?;
        if self.clock.now_ms() > expire_ms {
            return Err(Error::Expired);
        }
        let expected = self.sign(&format!("{path}:{expire_ms}"));
        if ct_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    /// Verify the leading signature segment of a `/serve` operation
    /// path. `unsafe` passes only when `allow_unsafe` is set. Returns
    /// the path after the signature segment.
    pub fn verify_serve_path<'a>(
        &self,
        ops_path: &'a str,
        allow_unsafe: bool,
    ) -> Result<&'a str, Error> {
        let trimmed = ops_path.strip_prefix('/').unwrap_or(ops_path);
        let (first, rest) = trimmed.split_once('/').ok_or(Error::Unauthorized)?;
        if first == "unsafe" {
            return if allow_unsafe { Ok(rest) } else { Err(Error::Unauthorized) };
        }
        let expected = self.sign(rest);
        if ct_eq(first.as_bytes(), expected.as_bytes()) {
            Ok(rest)
        } else {
            Err(Error::Unauthorized)
        }
    }
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
