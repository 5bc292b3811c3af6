//! Request signing.
//!
//! Every outbound request carries a fresh envelope proving control of the
//! persona key:
//!
//! 1. `sent_at`: wall-clock milliseconds since the epoch, as decimal text
//! 2. `nonce`: 16 random bytes, `0x`-prefixed hex
//! 3. the canonical message `sent_at + "." + nonce + "." + payload`
//! 4. an sr25519 signature over that message by the persona keypair
//!
//! The result travels in the `x-sent-at`, `x-nonce`, `x-pubkey` and `x-sig`
//! headers. Envelopes are single use: a retried request is signed again.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::keyring::{self, KeyringCache, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::persona::PersonaKey;

/// Header carrying the send timestamp.
pub const HEADER_SENT_AT: HeaderName = HeaderName::from_static("x-sent-at");
/// Header carrying the nonce.
pub const HEADER_NONCE: HeaderName = HeaderName::from_static("x-nonce");
/// Header carrying the signer public key.
pub const HEADER_PUBKEY: HeaderName = HeaderName::from_static("x-pubkey");
/// Header carrying the signature.
pub const HEADER_SIG: HeaderName = HeaderName::from_static("x-sig");
/// Header naming the persona a request acts as.
pub const HEADER_PERSONA_PKH: HeaderName = HeaderName::from_static("persona-pkh");
/// Header carrying the client version.
pub const HEADER_FRONTEND_VERSION: HeaderName = HeaderName::from_static("frontend-version");

/// Random bytes per nonce.
pub const NONCE_LEN: usize = 16;

/// Wire encoding for `x-pubkey` and `x-sig`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyEncoding {
    /// `0x`-prefixed lowercase hex.
    #[default]
    Hex,
    /// Comma-separated decimal bytes, e.g. `12,250,3`.
    ByteList,
}

impl KeyEncoding {
    /// Encode key material for a header.
    #[must_use]
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => format!("0x{}", hex::encode(bytes)),
            Self::ByteList => bytes
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// What the signature covers in the payload position of the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadMode {
    /// The exact request body.
    #[default]
    #[serde(rename = "raw")]
    Raw,
    /// `0x` + hex blake2b-256 of the request body.
    #[serde(rename = "blake2b-256")]
    Blake2b256,
}

/// Signer settings. Both sides of a deployment must agree on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Encoding of `x-pubkey` and `x-sig`.
    pub key_encoding: KeyEncoding,
    /// Payload handling in the canonical message.
    pub payload_mode: PayloadMode,
}

/// Build the canonical message `sent_at.nonce.payload`.
#[must_use]
pub fn canonical_message(sent_at: &str, nonce: &str, payload: &[u8], mode: PayloadMode) -> Vec<u8> {
    let digest;
    let payload = match mode {
        PayloadMode::Raw => payload,
        PayloadMode::Blake2b256 => {
            digest = format!("0x{}", hex::encode(keyring::blake2b_256(payload)));
            digest.as_bytes()
        }
    };

    let mut message = Vec::with_capacity(sent_at.len() + nonce.len() + payload.len() + 2);
    message.extend_from_slice(sent_at.as_bytes());
    message.push(b'.');
    message.extend_from_slice(nonce.as_bytes());
    message.push(b'.');
    message.extend_from_slice(payload);
    message
}

/// Draw a fresh `0x`-prefixed nonce from the OS random source.
///
/// # Errors
///
/// Returns [`Error::SigningUnavailable`] if the random source fails.
pub fn generate_nonce() -> Result<String> {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::signing_unavailable(format!("nonce generation failed: {e}")))?;
    Ok(format!("0x{}", hex::encode(bytes)))
}

fn now_millis() -> Result<u64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::signing_unavailable(format!("system clock before epoch: {e}")))?;
    u64::try_from(elapsed.as_millis())
        .map_err(|_| Error::signing_unavailable("system clock out of range"))
}

/// A signed request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// Send time in epoch milliseconds, as decimal text.
    pub sent_at: String,
    /// `0x`-prefixed hex nonce.
    pub nonce: String,
    /// Signer public key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// sr25519 signature over the canonical message.
    pub signature: [u8; SIGNATURE_LEN],
    encoding: KeyEncoding,
}

impl SignedEnvelope {
    /// The four authentication headers as name/value pairs.
    #[must_use]
    pub fn header_pairs(&self) -> [(HeaderName, String); 4] {
        [
            (HEADER_SENT_AT, self.sent_at.clone()),
            (HEADER_NONCE, self.nonce.clone()),
            (HEADER_PUBKEY, self.encoding.encode(&self.public_key)),
            (HEADER_SIG, self.encoding.encode(&self.signature)),
        ]
    }

    /// Insert the authentication headers, replacing any previous values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningUnavailable`] if a value is not a valid header.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        for (name, value) in self.header_pairs() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::signing_unavailable(format!("invalid {name} header: {e}")))?;
            headers.insert(name, value);
        }
        Ok(())
    }
}

/// Signs payloads as a persona, using the shared keyring cache.
#[derive(Debug)]
pub struct RequestSigner {
    cache: Arc<KeyringCache>,
    config: SignerConfig,
}

impl RequestSigner {
    /// Create a signer over `cache`.
    #[must_use]
    pub const fn new(cache: Arc<KeyringCache>, config: SignerConfig) -> Self {
        Self { cache, config }
    }

    /// Signer settings.
    #[must_use]
    pub const fn config(&self) -> &SignerConfig {
        &self.config
    }

    /// Sign `payload` as `persona` with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningUnavailable`] if no keyring can be resolved
    /// for the persona. The request must not be sent in that case.
    pub fn sign(&self, persona: &PersonaKey, payload: &[u8]) -> Result<SignedEnvelope> {
        self.sign_at(persona, payload, now_millis()?)
    }

    /// Sign `payload` as `persona` with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningUnavailable`] if no keyring can be resolved
    /// for the persona or the nonce cannot be generated.
    pub fn sign_at(&self, persona: &PersonaKey, payload: &[u8], sent_at_ms: u64) -> Result<SignedEnvelope> {
        let sent_at = sent_at_ms.to_string();
        let nonce = generate_nonce()?;

        let keyring = self
            .cache
            .get_or_create(&persona.derivation_uri())
            .map_err(|e| {
                warn!(pkh = %persona.pkh, error = %e, "no keyring for persona");
                Error::signing_unavailable(format!("no keyring for persona {}: {e}", persona.pkh))
            })?;

        if keyring.pkh() != persona.pkh {
            warn!(pkh = %persona.pkh, derived = %keyring.pkh(), "persona pkh does not match its keyring");
            return Err(Error::signing_unavailable(format!(
                "keyring for persona {} derives a different pkh",
                persona.pkh
            )));
        }

        let message = canonical_message(&sent_at, &nonce, payload, self.config.payload_mode);
        let signature = keyring.sign(&message);
        debug!(pkh = %persona.pkh, sent_at = %sent_at, len = payload.len(), "signed request");

        Ok(SignedEnvelope {
            sent_at,
            nonce,
            public_key: keyring.public_key(),
            signature,
            encoding: self.config.key_encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::keyring::verify_signature;
    use crate::persona::{Pkh, derive_key_at};

    const DEV_PHRASE: &str =
        "bottom drive obey lake curtain smoke basket hold race lonely fit walk";

    fn signer(config: SignerConfig) -> RequestSigner {
        RequestSigner::new(Arc::new(KeyringCache::default()), config)
    }

    #[test]
    fn test_canonical_message() {
        let message = canonical_message("1700000000000", "0xab", b"{\"q\":1}", PayloadMode::Raw);
        assert_eq!(message, b"1700000000000.0xab.{\"q\":1}");

        let hashed = canonical_message("1", "0x00", b"", PayloadMode::Blake2b256);
        assert_eq!(
            String::from_utf8(hashed).unwrap(),
            "1.0x00.0x0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn test_key_encoding() {
        assert_eq!(KeyEncoding::Hex.encode(&[1, 171]), "0x01ab");
        assert_eq!(KeyEncoding::ByteList.encode(&[1, 171, 0]), "1,171,0");
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce().unwrap();
        assert_eq!(nonce.len(), 2 + 2 * NONCE_LEN);
        assert!(nonce.starts_with("0x"));
    }

    #[test]
    fn test_nonces_are_unique_across_signatures() {
        let signer = signer(SignerConfig::default());
        let persona = derive_key_at(DEV_PHRASE, 0).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let envelope = signer.sign(&persona, b"{}").unwrap();
            assert!(seen.insert(envelope.nonce));
        }
    }

    #[test]
    fn test_signature_round_trip_and_tampering() {
        let signer = signer(SignerConfig::default());
        let persona = derive_key_at(DEV_PHRASE, 0).unwrap();
        let payload = br#"{"query":"{ me { name } }"}"#;

        let envelope = signer.sign_at(&persona, payload, 1_700_000_000_000).unwrap();
        assert_eq!(envelope.sent_at, "1700000000000");
        assert_eq!(Pkh::from_public_key(&envelope.public_key), persona.pkh);

        let message = canonical_message(&envelope.sent_at, &envelope.nonce, payload, PayloadMode::Raw);
        verify_signature(&envelope.public_key, &message, &envelope.signature).unwrap();

        let tampered = [
            canonical_message("1700000000001", &envelope.nonce, payload, PayloadMode::Raw),
            canonical_message(&envelope.sent_at, &generate_nonce().unwrap(), payload, PayloadMode::Raw),
            canonical_message(&envelope.sent_at, &envelope.nonce, b"{}", PayloadMode::Raw),
        ];
        for message in tampered {
            assert!(verify_signature(&envelope.public_key, &message, &envelope.signature).is_err());
        }
    }

    #[test]
    fn test_prehash_mode_signs_digest() {
        let signer = signer(SignerConfig {
            payload_mode: PayloadMode::Blake2b256,
            ..SignerConfig::default()
        });
        let persona = derive_key_at(DEV_PHRASE, 0).unwrap();
        let envelope = signer.sign(&persona, b"body").unwrap();

        let hashed = canonical_message(&envelope.sent_at, &envelope.nonce, b"body", PayloadMode::Blake2b256);
        verify_signature(&envelope.public_key, &hashed, &envelope.signature).unwrap();
        let raw = canonical_message(&envelope.sent_at, &envelope.nonce, b"body", PayloadMode::Raw);
        assert!(verify_signature(&envelope.public_key, &raw, &envelope.signature).is_err());
    }

    #[test]
    fn test_apply_headers() {
        let signer = signer(SignerConfig {
            key_encoding: KeyEncoding::ByteList,
            ..SignerConfig::default()
        });
        let persona = derive_key_at(DEV_PHRASE, 0).unwrap();
        let envelope = signer.sign(&persona, b"{}").unwrap();

        let mut headers = HeaderMap::new();
        envelope.apply(&mut headers).unwrap();
        assert_eq!(headers[&HEADER_SENT_AT], envelope.sent_at.as_str());
        assert_eq!(headers[&HEADER_NONCE], envelope.nonce.as_str());
        let pubkey = headers[&HEADER_PUBKEY].to_str().unwrap();
        assert_eq!(pubkey.split(',').count(), PUBLIC_KEY_LEN);
        let sig = headers[&HEADER_SIG].to_str().unwrap();
        assert_eq!(sig.split(',').count(), SIGNATURE_LEN);
    }

    #[test]
    fn test_unresolvable_persona_cannot_sign() {
        let signer = signer(SignerConfig::default());
        let broken = PersonaKey::new(0, Pkh::from_digest(&[0; 32]), "x".repeat(40), true);
        assert!(matches!(
            signer.sign(&broken, b"{}"),
            Err(Error::SigningUnavailable(_))
        ));

        let mismatched = PersonaKey::new(0, Pkh::from_digest(&[0; 32]), DEV_PHRASE, true);
        assert!(matches!(
            signer.sign(&mismatched, b"{}"),
            Err(Error::SigningUnavailable(_))
        ));
    }

    #[test]
    fn test_config_serde_names() {
        let config: SignerConfig =
            serde_json::from_str(r#"{"key_encoding":"byte-list","payload_mode":"blake2b-256"}"#).unwrap();
        assert_eq!(config.key_encoding, KeyEncoding::ByteList);
        assert_eq!(config.payload_mode, PayloadMode::Blake2b256);

        let default: SignerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(default, SignerConfig::default());
    }
}
