//! Verification of signed request envelopes.
//!
//! This is the receiving half of [`signer`](crate::signer): it parses the
//! authentication headers, checks that the claimed persona pkh is the hash
//! of the presented public key, and verifies the signature over the
//! canonical message. [`ReplayGuard`] adds freshness and nonce-reuse checks
//! on top.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use http::header::{HeaderMap, HeaderName};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::keyring::{self, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::persona::Pkh;
use crate::signer::{
    HEADER_NONCE, HEADER_PERSONA_PKH, HEADER_PUBKEY, HEADER_SENT_AT, HEADER_SIG, PayloadMode,
    canonical_message,
};

/// Default accepted clock skew: five minutes.
pub const DEFAULT_MAX_SKEW_MS: u64 = 5 * 60 * 1000;

/// Default number of remembered nonces.
pub const DEFAULT_NONCE_CAPACITY: usize = 10_000;

/// Verifier settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Largest accepted distance between `x-sent-at` and the local clock.
    pub max_skew_ms: u64,
    /// Nonces remembered for replay detection.
    pub nonce_capacity: usize,
    /// Payload handling; must match the signer.
    pub payload_mode: PayloadMode,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_skew_ms: DEFAULT_MAX_SKEW_MS,
            nonce_capacity: DEFAULT_NONCE_CAPACITY,
            payload_mode: PayloadMode::default(),
        }
    }
}

/// The authentication headers of one request, as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    /// Claimed persona (`persona-pkh`).
    pub pkh: String,
    /// `x-sent-at`.
    pub sent_at: String,
    /// `x-nonce`.
    pub nonce: String,
    /// `x-pubkey`, hex or byte-list encoded.
    pub pubkey: String,
    /// `x-sig`, hex or byte-list encoded.
    pub sig: String,
}

impl AuthHeaders {
    /// Extract the authentication headers from a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verification`] if a header is missing or not text.
    pub fn from_header_map(headers: &HeaderMap) -> Result<Self> {
        Ok(Self {
            pkh: header(headers, &HEADER_PERSONA_PKH)?,
            sent_at: header(headers, &HEADER_SENT_AT)?,
            nonce: header(headers, &HEADER_NONCE)?,
            pubkey: header(headers, &HEADER_PUBKEY)?,
            sig: header(headers, &HEADER_SIG)?,
        })
    }
}

fn header(headers: &HeaderMap, name: &HeaderName) -> Result<String> {
    let value = headers
        .get(name)
        .ok_or_else(|| Error::verification(format!("missing required auth header {name}")))?;
    value
        .to_str()
        .map(str::to_owned)
        .map_err(|_| Error::verification(format!("auth header {name} is not text")))
}

/// Decode a public key or signature sent as `0x` hex, bare hex or a
/// comma-separated byte list.
///
/// # Errors
///
/// Returns [`Error::Verification`] if the text is malformed or does not
/// decode to `expected_len` bytes.
pub fn decode_key_material(text: &str, expected_len: usize) -> Result<Vec<u8>> {
    let text = text.trim();
    let bytes = if let Some(digits) = text.strip_prefix("0x") {
        hex::decode(digits).map_err(|e| Error::verification(format!("invalid hex: {e}")))?
    } else if text.contains(',') || text.len() != 2 * expected_len {
        text.split(',')
            .map(|part| u8::from_str(part.trim()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::verification(format!("invalid byte list: {e}")))?
    } else {
        hex::decode(text).map_err(|e| Error::verification(format!("invalid hex: {e}")))?
    };

    if bytes.len() != expected_len {
        return Err(Error::verification(format!(
            "expected {expected_len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// A request whose envelope verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRequest {
    /// Persona the request acts as.
    pub pkh: Pkh,
    /// Send time in epoch milliseconds.
    pub sent_at_ms: u64,
    /// Nonce carried by the request.
    pub nonce: String,
}

/// Verify the envelope in `headers` against the request `body`.
///
/// # Errors
///
/// Returns [`Error::Verification`] if the pkh does not belong to the public
/// key, the timestamp is not decimal, or the signature does not match.
pub fn verify_headers(headers: &AuthHeaders, body: &[u8], mode: PayloadMode) -> Result<VerifiedRequest> {
    let claimed: Pkh = headers.pkh.parse()?;
    let public_key = decode_key_material(&headers.pubkey, PUBLIC_KEY_LEN)?;
    let signature = decode_key_material(&headers.sig, SIGNATURE_LEN)?;

    if Pkh::from_public_key(&public_key) != claimed {
        debug!(pkh = %claimed, "pkh / pubkey mismatch");
        return Err(Error::verification("pkh does not match public key"));
    }

    if headers.sent_at.is_empty() || !headers.sent_at.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::verification("x-sent-at is not a decimal timestamp"));
    }
    let sent_at_ms: u64 = headers
        .sent_at
        .parse()
        .map_err(|_| Error::verification("x-sent-at out of range"))?;

    let message = canonical_message(&headers.sent_at, &headers.nonce, body, mode);
    keyring::verify_signature(&public_key, &message, &signature)?;

    Ok(VerifiedRequest {
        pkh: claimed,
        sent_at_ms,
        nonce: headers.nonce.clone(),
    })
}

/// Remembered nonces and the `sent_at` each was signed with.
struct NonceWindow {
    seen: HashMap<(Pkh, String), u64>,
}

impl NonceWindow {
    /// Forget nonces whose timestamp can no longer pass the skew check.
    fn expire(&mut self, now_ms: u64, max_skew_ms: u64) {
        let before = self.seen.len();
        self.seen
            .retain(|_, sent_at| sent_at.saturating_add(max_skew_ms) >= now_ms);
        let expired = before - self.seen.len();
        if expired > 0 {
            debug!(expired, "expired remembered nonces");
        }
    }
}

/// Rejects stale timestamps and reused nonces.
///
/// Nonces are scoped per persona and remembered until their timestamp falls
/// outside the skew window, so a nonce is never forgotten while its envelope
/// could still be accepted. When `nonce_capacity` live nonces are held, new
/// requests are refused until some expire.
pub struct ReplayGuard {
    config: VerifierConfig,
    window: Mutex<NonceWindow>,
}

impl ReplayGuard {
    /// Create a guard with the given settings.
    #[must_use]
    pub fn new(config: VerifierConfig) -> Self {
        let capacity = config.nonce_capacity.max(1);
        Self {
            config: VerifierConfig {
                nonce_capacity: capacity,
                ..config
            },
            window: Mutex::new(NonceWindow {
                seen: HashMap::with_capacity(capacity),
            }),
        }
    }

    /// Verify `headers` and `body`, then apply the freshness and replay
    /// checks at time `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verification`] if the envelope is invalid, outside
    /// the skew window, or its nonce was already used by the same persona.
    pub fn verify(&self, headers: &AuthHeaders, body: &[u8], now_ms: u64) -> Result<VerifiedRequest> {
        let verified = verify_headers(headers, body, self.config.payload_mode)?;
        self.check(&verified, now_ms)?;
        Ok(verified)
    }

    /// Apply the freshness and replay checks to an already verified request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verification`] if the request is outside the skew
    /// window, replays a nonce, or arrives while the nonce window is full.
    pub fn check(&self, request: &VerifiedRequest, now_ms: u64) -> Result<()> {
        if request.sent_at_ms.abs_diff(now_ms) > self.config.max_skew_ms {
            return Err(Error::verification(format!(
                "x-sent-at {} is outside the accepted window",
                request.sent_at_ms
            )));
        }

        let key = (request.pkh.clone(), request.nonce.clone());
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        if window.seen.contains_key(&key) {
            debug!(pkh = %request.pkh, "replayed nonce");
            return Err(Error::verification(format!(
                "nonce already used by persona {}",
                request.pkh
            )));
        }

        if window.seen.len() >= self.config.nonce_capacity {
            window.expire(now_ms, self.config.max_skew_ms);
            if window.seen.len() >= self.config.nonce_capacity {
                warn!(pkh = %request.pkh, capacity = self.config.nonce_capacity, "nonce window full");
                return Err(Error::verification(
                    "too many live nonces, request refused until older ones expire",
                ));
            }
        }

        window.seen.insert(key, request.sent_at_ms);
        Ok(())
    }

    /// Number of remembered nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    /// Returns `true` if no nonce is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(VerifierConfig::default())
    }
}

impl std::fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("config", &self.config)
            .field("remembered", &self.len())
            .finish()
    }
}
