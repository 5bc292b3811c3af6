//! Persona key derivation.
//!
//! Each persona is a hard-derived child of the seed phrase at
//! `"<phrase>//<index>"` and is identified by its [`Pkh`]. Derivation is
//! deterministic: the same phrase and index give the same pkh on every run
//! and platform, so any change here is a breaking migration gated by
//! [`PERSONA_KEY_FORMAT`](crate::store::PERSONA_KEY_FORMAT).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};
use crate::keyring::{self, Keyring};

/// Highest persona index accepted for derivation.
pub const MAX_PERSONA_INDEX: u32 = (1 << 31) - 1;

/// Public key hash: `"0x"` followed by 64 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pkh(String);

impl Pkh {
    /// Wrap a 32-byte blake2b digest.
    #[must_use]
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(digest)))
    }

    /// Hash a public key.
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        keyring::public_key_hash(public_key)
    }

    /// The `0x`-prefixed hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pkh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Pkh {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| Error::verification(format!("pkh '{s}' is missing the 0x prefix")))?;
        if digits.len() != 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::verification(format!("pkh '{s}' is not 32 hex-encoded bytes")));
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }
}

impl AsRef<str> for Pkh {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One derived persona identity.
///
/// `hdkey` is the seed phrase the keypair was derived from. It is kept so the
/// signer can rebuild the keyring from `"<hdkey>//<path>"`, is zeroized on
/// drop and never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaKey {
    /// Derivation index.
    pub path: u32,
    /// Public key hash of the derived keypair.
    pub pkh: Pkh,
    hdkey: String,
    /// Whether this entry is the live identity.
    pub active: bool,
}

impl PersonaKey {
    /// Assemble a persona entry.
    #[must_use]
    pub fn new(path: u32, pkh: Pkh, hdkey: impl Into<String>, active: bool) -> Self {
        Self {
            path,
            pkh,
            hdkey: hdkey.into(),
            active,
        }
    }

    /// The seed phrase backing this persona.
    #[must_use]
    pub fn hdkey(&self) -> &str {
        &self.hdkey
    }

    /// Derivation URI used to rebuild this persona's keyring.
    #[must_use]
    pub fn derivation_uri(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{}//{}", self.hdkey, self.path))
    }

    /// Copy of this entry marked inactive.
    #[must_use]
    pub fn deactivated(&self) -> Self {
        let mut key = self.clone();
        key.active = false;
        key
    }
}

impl fmt::Debug for PersonaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersonaKey")
            .field("path", &self.path)
            .field("pkh", &self.pkh)
            .field("hdkey", &"<redacted>")
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for PersonaKey {
    fn drop(&mut self) {
        self.hdkey.zeroize();
    }
}

/// Build the derivation URI `"<phrase>//<index>"`.
///
/// # Errors
///
/// Returns [`Error::InvalidDerivationInput`] if the phrase is empty, already
/// contains a derivation path, or the index is above [`MAX_PERSONA_INDEX`].
pub fn derivation_uri(phrase: &str, index: u32) -> Result<Zeroizing<String>> {
    check_phrase(phrase)?;
    check_index(index)?;
    Ok(Zeroizing::new(format!("{phrase}//{index}")))
}

/// Derive the persona keypair at `index` and describe it as an active
/// [`PersonaKey`].
///
/// # Errors
///
/// Returns [`Error::InvalidDerivationInput`] for a malformed phrase or an
/// out-of-range index.
pub fn derive_key_at(phrase: &str, index: u32) -> Result<PersonaKey> {
    let uri = derivation_uri(phrase, index)?;
    let keyring = Keyring::from_uri(&uri)?;
    let pkh = keyring.pkh();
    debug!(path = index, pkh = %pkh, "derived persona key");
    Ok(PersonaKey::new(index, pkh, phrase, true))
}

pub(crate) fn check_phrase(phrase: &str) -> Result<()> {
    if phrase.trim().is_empty() {
        return Err(Error::invalid_derivation("seed phrase is empty"));
    }
    if phrase.contains('/') {
        return Err(Error::invalid_derivation(
            "seed phrase must not contain a derivation path",
        ));
    }
    Ok(())
}

pub(crate) fn check_index(index: u32) -> Result<()> {
    if index > MAX_PERSONA_INDEX {
        return Err(Error::invalid_derivation(format!(
            "persona index {index} exceeds {MAX_PERSONA_INDEX}"
        )));
    }
    Ok(())
}
