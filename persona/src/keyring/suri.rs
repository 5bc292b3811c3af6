//! Secret URI parsing and junction encoding.
//!
//! A secret URI is `phrase` followed by derivation junctions and an optional
//! password:
//!
//! ```text
//! <phrase>[//hard|/soft]*[///password]
//! ```
//!
//! The phrase resolves to a 32-byte mini secret key:
//!
//! - `0x` followed by 64 hex digits is used as-is.
//! - 12, 15, 18, 21 or 24 space-separated words are a BIP-39 English
//!   mnemonic. Its *entropy* (not the BIP-39 seed) goes through
//!   PBKDF2-HMAC-SHA512 with salt `"mnemonic" + password`, 2048 rounds,
//!   and the first 32 bytes are kept.
//! - Anything else is a raw seed of at most 32 bytes, right-padded with
//!   spaces. Account identifiers returned by external sign-in land here.
//!
//! This matches the Substrate keyring, so identities derived here agree with
//! the ones the backend verifier recomputes.

use std::sync::LazyLock;

use bip39::{Language, Mnemonic};
use blake2::Blake2b;
use blake2::digest::Digest;
use blake2::digest::consts::U32;
use hmac::Hmac;
use regex::Regex;
use sha2::Sha512;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

/// Byte length of a junction chain code.
pub const JUNCTION_ID_LEN: usize = 32;

/// Byte length of a mini secret key.
pub const MINI_SECRET_LEN: usize = 32;

/// Mnemonic word counts accepted as a BIP-39 phrase.
const MNEMONIC_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// PBKDF2 rounds for mnemonic entropy stretching.
const PBKDF2_ROUNDS: u32 = 2048;

static SECRET_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<phrase>[A-Za-z0-9_ ]+)?(?P<path>(//?[^/]+)*)(///(?P<password>.*))?$")
        .expect("secret URI pattern is valid")
});

static JUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//?[^/]+").expect("junction pattern is valid"));

type Blake2b256 = Blake2b<U32>;

/// One step of a derivation path.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Junction {
    /// Hard derivation (`//`): the child cannot be linked to the parent
    /// public key.
    Hard([u8; JUNCTION_ID_LEN]),
    /// Soft derivation (`/`).
    Soft([u8; JUNCTION_ID_LEN]),
}

impl Junction {
    /// Hard junction for a numeric index, as produced by `//<index>`.
    #[must_use]
    pub fn hard_index(index: u64) -> Self {
        Self::Hard(chain_code(&index.to_le_bytes()))
    }

    /// Parse the text of a junction (without its leading slashes).
    ///
    /// Decimal text is encoded as a little-endian `u64`, `0x` hex as raw
    /// bytes and any other text as a length-prefixed string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] for empty text, decimal
    /// text that overflows `u64`, or malformed hex.
    pub fn parse(code: &str, hard: bool) -> Result<Self> {
        if code.is_empty() {
            return Err(Error::invalid_derivation("empty derivation junction"));
        }

        let bytes = if code.bytes().all(|b| b.is_ascii_digit()) {
            let n: u64 = code
                .parse()
                .map_err(|_| Error::invalid_derivation(format!("junction index '{code}' out of range")))?;
            n.to_le_bytes().to_vec()
        } else if let Some(hex_part) = code.strip_prefix("0x") {
            hex::decode(hex_part)
                .map_err(|e| Error::invalid_derivation(format!("invalid hex junction: {e}")))?
        } else {
            scale_string(code)?
        };

        let cc = chain_code(&bytes);
        Ok(if hard { Self::Hard(cc) } else { Self::Soft(cc) })
    }

    /// Returns `true` for a hard junction.
    #[must_use]
    pub const fn is_hard(&self) -> bool {
        matches!(self, Self::Hard(_))
    }

    /// The 32-byte chain code of this junction.
    #[must_use]
    pub const fn chain_code(&self) -> &[u8; JUNCTION_ID_LEN] {
        match self {
            Self::Hard(cc) | Self::Soft(cc) => cc,
        }
    }
}

impl std::fmt::Debug for Junction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_hard() { "Hard" } else { "Soft" };
        write!(f, "{kind}(0x{})", hex::encode(self.chain_code()))
    }
}

/// A parsed secret URI.
///
/// The phrase and password are zeroized on drop.
pub struct SecretUri {
    phrase: Zeroizing<String>,
    junctions: Vec<Junction>,
    password: Option<Zeroizing<String>>,
}

impl SecretUri {
    /// Parse a secret URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] when the text does not match
    /// the secret URI grammar, the phrase is missing, or a junction is
    /// malformed.
    pub fn parse(uri: &str) -> Result<Self> {
        let caps = SECRET_URI
            .captures(uri)
            .ok_or_else(|| Error::invalid_derivation("unable to match value to a secret URI"))?;

        let phrase = caps
            .name("phrase")
            .map(|m| m.as_str())
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::invalid_derivation("secret URI has no phrase"))?;

        let junctions = caps
            .name("path")
            .map(|m| {
                JUNCTION
                    .find_iter(m.as_str())
                    .map(|j| {
                        let text = j.as_str();
                        match text.strip_prefix("//") {
                            Some(code) => Junction::parse(code, true),
                            None => Junction::parse(&text[1..], false),
                        }
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let password = caps
            .name("password")
            .map(|m| Zeroizing::new(m.as_str().to_owned()));

        Ok(Self {
            phrase: Zeroizing::new(phrase.to_owned()),
            junctions,
            password,
        })
    }

    /// The derivation junctions, outermost first.
    #[must_use]
    pub fn junctions(&self) -> &[Junction] {
        &self.junctions
    }

    /// Resolve the phrase to a mini secret key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] for an invalid mnemonic, a
    /// raw seed longer than 32 bytes, or a PBKDF2 failure.
    pub fn mini_secret(&self) -> Result<Zeroizing<[u8; MINI_SECRET_LEN]>> {
        let phrase = self.phrase.as_str();

        if let Some(hex_part) = phrase.strip_prefix("0x") {
            if hex_part.len() == 2 * MINI_SECRET_LEN {
                let mut seed = Zeroizing::new([0u8; MINI_SECRET_LEN]);
                hex::decode_to_slice(hex_part, seed.as_mut_slice())
                    .map_err(|e| Error::invalid_derivation(format!("invalid hex seed: {e}")))?;
                return Ok(seed);
            }
        }

        let word_count = phrase.split(' ').count();
        if MNEMONIC_WORD_COUNTS.contains(&word_count) {
            let password = self.password.as_ref().map_or("", |p| p.as_str());
            return mnemonic_mini_secret(phrase, password);
        }

        raw_seed(phrase)
    }
}

impl std::fmt::Debug for SecretUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretUri")
            .field("phrase", &"<redacted>")
            .field("junctions", &self.junctions)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Stretch the entropy of a BIP-39 mnemonic into a mini secret key.
fn mnemonic_mini_secret(phrase: &str, password: &str) -> Result<Zeroizing<[u8; MINI_SECRET_LEN]>> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| Error::invalid_derivation(format!("invalid bip39 mnemonic: {e}")))?;
    let entropy = Zeroizing::new(mnemonic.to_entropy());

    let mut salt = Vec::with_capacity(8 + password.len());
    salt.extend_from_slice(b"mnemonic");
    salt.extend_from_slice(password.as_bytes());

    let mut output = Zeroizing::new([0u8; 64]);
    pbkdf2::pbkdf2::<Hmac<Sha512>>(&entropy, &salt, PBKDF2_ROUNDS, output.as_mut_slice())
        .map_err(|e| Error::invalid_derivation(format!("PBKDF2-HMAC-SHA512 failed: {e}")))?;
    salt.zeroize();

    let mut seed = Zeroizing::new([0u8; MINI_SECRET_LEN]);
    seed.copy_from_slice(&output[..MINI_SECRET_LEN]);
    Ok(seed)
}

/// Use a short phrase directly as seed bytes, padded with spaces.
fn raw_seed(phrase: &str) -> Result<Zeroizing<[u8; MINI_SECRET_LEN]>> {
    let bytes = phrase.as_bytes();
    if bytes.len() > MINI_SECRET_LEN {
        return Err(Error::invalid_derivation(
            "phrase is not a valid mnemonic and is too long to be a raw seed (> 32 bytes)",
        ));
    }

    let mut seed = Zeroizing::new([b' '; MINI_SECRET_LEN]);
    seed[..bytes.len()].copy_from_slice(bytes);
    Ok(seed)
}

/// Fit junction bytes into a chain code: hash when too long, else zero-pad.
fn chain_code(bytes: &[u8]) -> [u8; JUNCTION_ID_LEN] {
    let mut cc = [0u8; JUNCTION_ID_LEN];
    if bytes.len() > JUNCTION_ID_LEN {
        cc.copy_from_slice(&Blake2b256::digest(bytes));
    } else {
        cc[..bytes.len()].copy_from_slice(bytes);
    }
    cc
}

/// SCALE encoding of a string: compact length prefix followed by UTF-8.
#[allow(clippy::cast_possible_truncation)]
fn scale_string(s: &str) -> Result<Vec<u8>> {
    let len = s.len();
    let mut out = Vec::with_capacity(len + 4);

    match u32::try_from(len) {
        Ok(n) if n < 1 << 6 => out.push((n << 2) as u8),
        Ok(n) if n < 1 << 14 => out.extend_from_slice(&(((n << 2) | 0b01) as u16).to_le_bytes()),
        Ok(n) if n < 1 << 30 => out.extend_from_slice(&((n << 2) | 0b10).to_le_bytes()),
        _ => return Err(Error::invalid_derivation("derivation junction too long")),
    }

    out.extend_from_slice(s.as_bytes());
    Ok(out)
}
