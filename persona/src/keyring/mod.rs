//! sr25519 keyring primitive.
//!
//! A [`Keyring`] is an sr25519 keypair reconstructed from a secret URI with
//! the same rules as the Substrate keyring: the phrase becomes a mini secret
//! key, which is expanded in Ed25519 mode and then walked along the
//! derivation junctions. Signatures use the `substrate` signing context, so
//! they verify on any Substrate-compatible backend.
//!
//! Public keys are identified by their [`Pkh`], the blake2b-256 hash of the
//! 32-byte public key.

pub mod cache;
pub mod suri;

use std::sync::OnceLock;

use blake2::Blake2b;
use blake2::digest::Digest;
use blake2::digest::consts::U32;
use schnorrkel::derive::{ChainCode, Derivation};
use schnorrkel::{ExpansionMode, Keypair, MiniSecretKey, PublicKey, SecretKey, Signature};
use tracing::{debug, error};

pub use cache::{CacheConfig, CacheStats, CacheStatsSnapshot, KeyringCache};
pub use suri::{Junction, SecretUri};

use crate::error::{Error, Result};
use crate::persona::Pkh;

/// Signing context shared with Substrate-compatible verifiers.
pub const SIGNING_CONTEXT: &[u8] = b"substrate";

/// Byte length of an sr25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Byte length of an sr25519 signature.
pub const SIGNATURE_LEN: usize = 64;

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 digest of `data`.
#[must_use]
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    Blake2b256::digest(data).into()
}

/// Public key hash: `"0x"` followed by the hex blake2b-256 digest.
#[must_use]
pub fn public_key_hash(public_key: &[u8]) -> Pkh {
    Pkh::from_digest(&blake2b_256(public_key))
}

/// Proof that the signing primitives passed their self-test.
///
/// Obtained from [`crypto_ready`]. Operations that derive or sign keys take
/// this token so they cannot run before the crypto subsystem is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoReady {
    _private: (),
}

static SELF_TEST: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Run the sr25519 self-test once and return a readiness token.
///
/// # Errors
///
/// Returns [`Error::SigningUnavailable`] if a freshly derived keypair cannot
/// verify its own signature.
pub fn crypto_ready() -> Result<CryptoReady> {
    SELF_TEST
        .get_or_init(|| {
            let keyring = Keyring::from_mini_secret(&[7u8; 32])
                .map_err(|e| e.to_string())?
                .derive(&[Junction::hard_index(0)]);
            let message = b"persona self-test";
            let signature = keyring.sign(message);
            verify_signature(&keyring.public_key(), message, &signature).map_err(|e| e.to_string())?;
            debug!("sr25519 self-test passed");
            Ok(())
        })
        .clone()
        .map(|()| CryptoReady { _private: () })
        .map_err(|e| {
            error!(error = %e, "sr25519 self-test failed");
            Error::signing_unavailable(format!("crypto self-test failed: {e}"))
        })
}

/// An sr25519 keypair.
#[derive(Clone)]
pub struct Keyring {
    keypair: Keypair,
}

impl Keyring {
    /// Reconstruct a keypair from a secret URI such as `"<phrase>//0"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] if the URI or its phrase is
    /// malformed.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let suri = SecretUri::parse(uri)?;
        let mini = suri.mini_secret()?;
        Ok(Self::from_mini_secret(&mini)?.derive(suri.junctions()))
    }

    /// Build the root keypair for a 32-byte mini secret key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] if the bytes are rejected.
    pub fn from_mini_secret(seed: &[u8; 32]) -> Result<Self> {
        let mini = MiniSecretKey::from_bytes(seed)
            .map_err(|e| Error::invalid_derivation(format!("invalid mini secret key: {e}")))?;
        Ok(Self {
            keypair: mini.expand_to_keypair(ExpansionMode::Ed25519),
        })
    }

    /// Derive a child keypair along `junctions`.
    #[must_use]
    pub fn derive(&self, junctions: &[Junction]) -> Self {
        let secret = junctions
            .iter()
            .fold(self.keypair.secret.clone(), |acc, junction| match junction {
                Junction::Soft(cc) => acc.derived_key_simple(ChainCode(*cc), b"").0,
                Junction::Hard(cc) => hard_derive(&acc, cc),
            });
        Self {
            keypair: secret.to_keypair(),
        }
    }

    /// The 32-byte public key.
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.keypair.public.to_bytes()
    }

    /// Public key hash of this keypair.
    #[must_use]
    pub fn pkh(&self) -> Pkh {
        public_key_hash(&self.public_key())
    }

    /// Sign `message` under the `substrate` context.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.keypair
            .sign_simple(SIGNING_CONTEXT, message)
            .to_bytes()
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

fn hard_derive(secret: &SecretKey, cc: &[u8; 32]) -> SecretKey {
    secret
        .hard_derive_mini_secret_key(Some(ChainCode(*cc)), b"")
        .0
        .expand(ExpansionMode::Ed25519)
}

/// Verify an sr25519 `signature` over `message` by `public_key`.
///
/// # Errors
///
/// Returns [`Error::Verification`] if the key or signature is malformed or
/// the signature does not match.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let public = PublicKey::from_bytes(public_key)
        .map_err(|e| Error::verification(format!("invalid public key: {e}")))?;
    let signature = Signature::from_bytes(signature)
        .map_err(|e| Error::verification(format!("invalid signature encoding: {e}")))?;
    public
        .verify_simple(SIGNING_CONTEXT, message, &signature)
        .map_err(|_| Error::verification("signature does not match"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_PHRASE: &str =
        "bottom drive obey lake curtain smoke basket hold race lonely fit walk";

    #[test]
    fn test_blake2b_empty_input() {
        assert_eq!(
            hex::encode(blake2b_256(b"")),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn test_dev_root_public_key() {
        let keyring = Keyring::from_uri(DEV_PHRASE).unwrap();
        assert_eq!(
            hex::encode(keyring.public_key()),
            "46ebddef8cd9bb167dc30878d7113b7e168e6f0646beffd77d69d39bad76b47a"
        );
        assert_eq!(
            keyring.pkh().as_str(),
            "0xbbeb502559223ffc799159e813f2da5ab83aa1c5cb124ee8bdfc442475f140a5"
        );
    }

    #[test]
    fn test_dev_alice_public_key() {
        let keyring = Keyring::from_uri(&format!("{DEV_PHRASE}//Alice")).unwrap();
        assert_eq!(
            hex::encode(keyring.public_key()),
            "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d"
        );
        assert_eq!(
            keyring.pkh().as_str(),
            "0x2e3fb4c297a84c5cebc0e78257d213d0927ccc7596044c6ba013dd05522aacba"
        );
    }

    #[test]
    fn test_derive_matches_uri() {
        let root = Keyring::from_uri(DEV_PHRASE).unwrap();
        let child = root.derive(&[Junction::hard_index(0)]);
        let direct = Keyring::from_uri(&format!("{DEV_PHRASE}//0")).unwrap();
        assert_eq!(child.public_key(), direct.public_key());
        assert_ne!(child.public_key(), root.public_key());
    }

    #[test]
    fn test_soft_and_hard_differ() {
        let hard = Keyring::from_uri(&format!("{DEV_PHRASE}//1")).unwrap();
        let soft = Keyring::from_uri(&format!("{DEV_PHRASE}/1")).unwrap();
        assert_ne!(hard.public_key(), soft.public_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let keyring = Keyring::from_uri(&format!("{DEV_PHRASE}//0")).unwrap();
        let signature = keyring.sign(b"hello");
        verify_signature(&keyring.public_key(), b"hello", &signature).unwrap();

        let err = verify_signature(&keyring.public_key(), b"hellO", &signature).unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        assert!(verify_signature(&[0u8; 5], b"m", &[0u8; 64]).is_err());
        let keyring = Keyring::from_uri(DEV_PHRASE).unwrap();
        assert!(verify_signature(&keyring.public_key(), b"m", &[0u8; 10]).is_err());
    }

    #[test]
    fn test_crypto_ready_is_stable() {
        let first = crypto_ready().unwrap();
        let second = crypto_ready().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_debug_shows_only_public_key() {
        let keyring = Keyring::from_uri(DEV_PHRASE).unwrap();
        let rendered = format!("{keyring:?}");
        assert!(rendered.contains("46ebddef"));
        assert!(!rendered.contains("bottom"));
    }
}
