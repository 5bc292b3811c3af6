//! Mnemonic seed and master key management.
//!
//! The seed phrase is the root of every persona identity. It is stored under
//! [`SEED_STORAGE_KEY`] as `{"format": 2, "phrase": "..."}`. Older installs
//! stored a bare string or a `{"seed": ...}` wrapper; those shapes are
//! rewritten to the current one the first time they are loaded.
//!
//! # Example
//!
//! ```rust,ignore
//! use persona::seed::SeedManager;
//!
//! let seeds = SeedManager::new(storage);
//! let loaded = seeds.load_or_init_seed().await?;
//! let master = SeedManager::derive_master_key(&ready, &loaded.seed)?;
//! println!("master pkh: {}", master.pkh());
//! ```

use std::fmt;
use std::sync::Arc;

use bip39::{Language, Mnemonic};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};
use crate::keyring::{CryptoReady, Junction, Keyring, SecretUri};
use crate::persona::{self, PersonaKey, Pkh};
use crate::storage::KeyValueStore;

/// Storage key for the seed record.
pub const SEED_STORAGE_KEY: &str = "hdkey_seed";

/// Current seed record format.
pub const CURRENT_SEED_FORMAT: u32 = 2;

/// Bytes of entropy for a generated mnemonic (24 words).
const SEED_ENTROPY_BYTES: usize = 32;

/// Nesting limit for legacy `{"seed": ...}` wrappers.
const MAX_LEGACY_DEPTH: usize = 4;

/// The persisted seed phrase.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SeedRecord {
    /// Record format version.
    pub format: u32,
    /// Mnemonic or account identifier used as the seed.
    pub phrase: String,
}

impl SeedRecord {
    /// A current-format record for `phrase`.
    #[must_use]
    pub fn new(phrase: impl Into<String>) -> Self {
        Self {
            format: CURRENT_SEED_FORMAT,
            phrase: phrase.into(),
        }
    }
}

impl fmt::Debug for SeedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedRecord")
            .field("format", &self.format)
            .field("phrase", &"<redacted>")
            .finish()
    }
}

/// Result of interpreting a stored seed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredSeed {
    /// Already in the current shape.
    Current(SeedRecord),
    /// A legacy shape, converted to the current one.
    Legacy(SeedRecord),
    /// Not a usable seed.
    Corrupt(String),
}

/// Interpret a stored seed value, upgrading legacy shapes.
#[must_use]
pub fn parse_stored_seed(value: &Value) -> StoredSeed {
    parse_stored_seed_at(value, 0)
}

fn parse_stored_seed_at(value: &Value, depth: usize) -> StoredSeed {
    if depth > MAX_LEGACY_DEPTH {
        return StoredSeed::Corrupt("legacy seed nested too deeply".into());
    }

    match value {
        Value::String(phrase) => match non_empty(phrase) {
            Some(phrase) => StoredSeed::Legacy(SeedRecord::new(phrase)),
            None => StoredSeed::Corrupt("empty seed string".into()),
        },
        Value::Object(map) => {
            if let Some(phrase) = map.get("phrase") {
                let Some(phrase) = phrase.as_str().and_then(non_empty) else {
                    return StoredSeed::Corrupt("seed phrase is empty or not a string".into());
                };
                let record = SeedRecord::new(phrase);
                let format = map.get("format").and_then(Value::as_u64);
                return if format == Some(u64::from(CURRENT_SEED_FORMAT)) {
                    StoredSeed::Current(record)
                } else {
                    StoredSeed::Legacy(record)
                };
            }

            match map.get("seed").map(|inner| parse_stored_seed_at(inner, depth + 1)) {
                Some(StoredSeed::Current(record) | StoredSeed::Legacy(record)) => {
                    StoredSeed::Legacy(record)
                }
                Some(corrupt @ StoredSeed::Corrupt(_)) => corrupt,
                None => StoredSeed::Corrupt("seed record has neither 'phrase' nor 'seed'".into()),
            }
        }
        other => StoredSeed::Corrupt(format!("unexpected seed value type: {}", json_type(other))),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Generate a 24-word English mnemonic from 256 bits of OS randomness.
///
/// # Errors
///
/// Returns [`Error::SeedUnavailable`] if the secure random source fails.
pub fn generate_seed_phrase() -> Result<Zeroizing<String>> {
    let mut entropy = Zeroizing::new([0u8; SEED_ENTROPY_BYTES]);
    OsRng
        .try_fill_bytes(entropy.as_mut_slice())
        .map_err(|e| Error::seed_unavailable(format!("secure random source failed: {e}")))?;

    let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy.as_slice())
        .map_err(|e| Error::seed_unavailable(format!("mnemonic generation failed: {e}")))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Where a loaded seed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOrigin {
    /// Read from storage in the current shape.
    Loaded,
    /// Read from storage in a legacy shape and rewritten.
    Migrated,
    /// Nothing was stored, so a new seed was generated.
    Generated,
    /// The stored value was unusable, so a new seed was generated.
    Regenerated,
    /// Supplied explicitly through a re-seed.
    Replaced,
}

/// Outcome of loading or replacing the seed.
#[derive(Debug)]
pub struct SeedLoad {
    /// The seed now in effect.
    pub seed: SeedRecord,
    /// How it was obtained.
    pub origin: SeedOrigin,
    /// Set when the seed could not be written back. The in-memory seed stays
    /// authoritative for this session.
    pub persist_error: Option<Error>,
}

/// The master keypair derived from the seed phrase with no junctions.
///
/// Never persisted.
pub struct MasterKey {
    phrase: Zeroizing<String>,
    keyring: Keyring,
    pkh: Pkh,
}

impl MasterKey {
    /// Public key hash of the master key; the persona store fingerprint.
    #[must_use]
    pub const fn pkh(&self) -> &Pkh {
        &self.pkh
    }

    /// Master public key.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.keyring.public_key()
    }

    /// Seed phrase the master key was derived from.
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Derive the persona at `index` by hard-deriving from the master key.
    ///
    /// Equivalent to [`persona::derive_key_at`] without reparsing the phrase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] if `index` is out of range.
    pub fn derive_child(&self, index: u32) -> Result<PersonaKey> {
        persona::check_index(index)?;
        let child = self.keyring.derive(&[Junction::hard_index(u64::from(index))]);
        Ok(PersonaKey::new(index, child.pkh(), self.phrase.as_str(), true))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("pkh", &self.pkh)
            .finish_non_exhaustive()
    }
}

/// Loads, generates, migrates and replaces the persisted seed.
pub struct SeedManager {
    storage: Arc<dyn KeyValueStore>,
}

impl SeedManager {
    /// Create a manager over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    /// Load the stored seed, creating or migrating it as needed.
    ///
    /// Absent or corrupt seeds are replaced by a freshly generated mnemonic.
    /// Legacy shapes are rewritten in the current shape. A failed write is
    /// reported in [`SeedLoad::persist_error`] and does not fail the load.
    ///
    /// Read failures are split by cause. A stored value that is not valid
    /// JSON counts as corrupt and is regenerated. Any other backend read
    /// error is not recovered here: it fails the load and nothing is written,
    /// because the seed may still exist behind a transient fault and a
    /// regenerated one would replace the identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SeedUnavailable`] if no seed can be generated, or if
    /// the storage backend cannot be read for a reason other than malformed
    /// JSON.
    pub async fn load_or_init_seed(&self) -> Result<SeedLoad> {
        let stored = match self.storage.get(SEED_STORAGE_KEY).await {
            Ok(value) => value.map(|v| parse_stored_seed(&v)),
            Err(Error::Json(e)) => Some(StoredSeed::Corrupt(format!("unparseable JSON: {e}"))),
            Err(e) => {
                return Err(Error::seed_unavailable(format!(
                    "cannot read stored seed from {}: {e}",
                    self.storage.backend()
                )));
            }
        };

        let (seed, origin) = match stored {
            Some(StoredSeed::Current(seed)) => {
                debug!("loaded seed");
                return Ok(SeedLoad {
                    seed,
                    origin: SeedOrigin::Loaded,
                    persist_error: None,
                });
            }
            Some(StoredSeed::Legacy(seed)) => {
                info!(format = CURRENT_SEED_FORMAT, "migrating legacy seed record");
                (seed, SeedOrigin::Migrated)
            }
            Some(StoredSeed::Corrupt(reason)) => {
                warn!(reason = %reason, "stored seed is unusable, generating a new one");
                (SeedRecord::new(generate_seed_phrase()?.as_str()), SeedOrigin::Regenerated)
            }
            None => {
                info!("no stored seed, generating a new one");
                (SeedRecord::new(generate_seed_phrase()?.as_str()), SeedOrigin::Generated)
            }
        };

        let persist_error = self.persist(&seed).await.err();
        Ok(SeedLoad {
            seed,
            origin,
            persist_error,
        })
    }

    /// Replace the seed with a user-supplied phrase.
    ///
    /// The phrase is trimmed and must be derivable before it is stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] for an empty or malformed
    /// phrase.
    pub async fn replace_seed(&self, phrase: &str) -> Result<SeedLoad> {
        let phrase = phrase.trim();
        persona::check_phrase(phrase)?;
        SecretUri::parse(phrase)?.mini_secret()?;

        let seed = SeedRecord::new(phrase);
        let persist_error = self.persist(&seed).await.err();
        info!(persisted = persist_error.is_none(), "seed replaced");

        Ok(SeedLoad {
            seed,
            origin: SeedOrigin::Replaced,
            persist_error,
        })
    }

    /// Derive the master key for `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] if the phrase is malformed.
    pub fn derive_master_key(_ready: &CryptoReady, seed: &SeedRecord) -> Result<MasterKey> {
        persona::check_phrase(&seed.phrase)?;
        let keyring = Keyring::from_uri(&seed.phrase)?;
        let pkh = keyring.pkh();
        debug!(pkh = %pkh, "derived master key");
        Ok(MasterKey {
            phrase: Zeroizing::new(seed.phrase.clone()),
            keyring,
            pkh,
        })
    }

    async fn persist(&self, seed: &SeedRecord) -> Result<()> {
        let value = serde_json::to_value(seed)?;
        self.storage
            .set(SEED_STORAGE_KEY, &value)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to persist seed");
                Error::persistence(SEED_STORAGE_KEY, e.to_string())
            })
    }
}

impl fmt::Debug for SeedManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedManager")
            .field("backend", &self.storage.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::keyring::crypto_ready;
    use crate::storage::MemoryStore;

    const DEV_PHRASE: &str =
        "bottom drive obey lake curtain smoke basket hold race lonely fit walk";

    /// Store whose reads work but whose writes always fail.
    #[derive(Debug, Default)]
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl KeyValueStore for ReadOnlyStore {
        fn backend(&self) -> &'static str {
            "read-only"
        }

        async fn get(&self, key: &str) -> Result<Option<Value>> {
            self.0.get(key).await
        }

        async fn set(&self, _key: &str, _value: &Value) -> Result<()> {
            Err(Error::storage("read-only", "writes disabled"))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::storage("read-only", "writes disabled"))
        }
    }

    /// Store whose reads always fail.
    #[derive(Debug, Default)]
    struct UnreadableStore(MemoryStore);

    #[async_trait]
    impl KeyValueStore for UnreadableStore {
        fn backend(&self) -> &'static str {
            "unreadable"
        }

        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            Err(Error::Io(std::io::Error::other("disk unavailable")))
        }

        async fn set(&self, key: &str, value: &Value) -> Result<()> {
            self.0.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }
    }

    #[test]
    fn test_parse_current_shape() {
        let parsed = parse_stored_seed(&json!({"format": 2, "phrase": DEV_PHRASE}));
        assert_eq!(parsed, StoredSeed::Current(SeedRecord::new(DEV_PHRASE)));
    }

    #[test]
    fn test_parse_legacy_shapes() {
        let expected = StoredSeed::Legacy(SeedRecord::new(DEV_PHRASE));
        assert_eq!(parse_stored_seed(&json!(DEV_PHRASE)), expected);
        assert_eq!(parse_stored_seed(&json!({"seed": DEV_PHRASE})), expected);
        assert_eq!(
            parse_stored_seed(&json!({"seed": {"format": 2, "phrase": DEV_PHRASE}})),
            expected
        );
        assert_eq!(
            parse_stored_seed(&json!({"format": 1, "phrase": DEV_PHRASE})),
            expected
        );
    }

    #[test]
    fn test_parse_corrupt_shapes() {
        for value in [
            json!(""),
            json!(42),
            json!([]),
            json!({}),
            json!({"phrase": ""}),
            json!({"seed": 7}),
            json!({"seed": {"seed": {"seed": {"seed": {"seed": {"seed": "x"}}}}}}),
        ] {
            assert!(matches!(parse_stored_seed(&value), StoredSeed::Corrupt(_)), "{value}");
        }
    }

    #[test]
    fn test_generated_phrase_is_24_words() {
        let phrase = generate_seed_phrase().unwrap();
        assert_eq!(phrase.split(' ').count(), 24);
        assert!(Mnemonic::parse_in_normalized(Language::English, &phrase).is_ok());
        assert_ne!(*phrase, *generate_seed_phrase().unwrap());
    }

    #[tokio::test]
    async fn test_generates_and_persists_when_absent() {
        let storage = Arc::new(MemoryStore::new());
        let seeds = SeedManager::new(Arc::clone(&storage) as Arc<dyn KeyValueStore>);

        let first = seeds.load_or_init_seed().await.unwrap();
        assert_eq!(first.origin, SeedOrigin::Generated);
        assert!(first.persist_error.is_none());

        let stored = storage.get(SEED_STORAGE_KEY).await.unwrap().unwrap();
        assert_eq!(stored["format"], 2);
        assert_eq!(stored["phrase"], first.seed.phrase.as_str());

        let second = seeds.load_or_init_seed().await.unwrap();
        assert_eq!(second.origin, SeedOrigin::Loaded);
        assert_eq!(second.seed, first.seed);
    }

    #[tokio::test]
    async fn test_bare_string_migration_is_idempotent() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(SEED_STORAGE_KEY, &json!(DEV_PHRASE)).await.unwrap();
        let seeds = SeedManager::new(Arc::clone(&storage) as Arc<dyn KeyValueStore>);

        let migrated = seeds.load_or_init_seed().await.unwrap();
        assert_eq!(migrated.origin, SeedOrigin::Migrated);
        assert_eq!(migrated.seed.phrase, DEV_PHRASE);
        assert_eq!(
            storage.get(SEED_STORAGE_KEY).await.unwrap(),
            Some(json!({"format": 2, "phrase": DEV_PHRASE}))
        );

        let again = seeds.load_or_init_seed().await.unwrap();
        assert_eq!(again.origin, SeedOrigin::Loaded);
        assert_eq!(again.seed, migrated.seed);
        assert_eq!(
            storage.get(SEED_STORAGE_KEY).await.unwrap(),
            Some(json!({"format": 2, "phrase": DEV_PHRASE}))
        );
    }

    #[tokio::test]
    async fn test_corrupt_seed_is_regenerated() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(SEED_STORAGE_KEY, &json!({"bogus": true})).await.unwrap();
        let seeds = SeedManager::new(storage);

        let load = seeds.load_or_init_seed().await.unwrap();
        assert_eq!(load.origin, SeedOrigin::Regenerated);
        assert_eq!(load.seed.phrase.split(' ').count(), 24);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_seed_in_memory() {
        let seeds = SeedManager::new(Arc::new(ReadOnlyStore::default()));

        let load = seeds.load_or_init_seed().await.unwrap();
        assert_eq!(load.origin, SeedOrigin::Generated);
        assert!(matches!(
            load.persist_error,
            Some(Error::PersistenceWriteFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_failure_is_fatal_and_writes_nothing() {
        let storage = Arc::new(UnreadableStore::default());
        let seeds = SeedManager::new(Arc::clone(&storage) as Arc<dyn KeyValueStore>);

        let err = seeds.load_or_init_seed().await.unwrap_err();
        assert!(matches!(err, Error::SeedUnavailable(_)));
        assert!(err.to_string().contains("unreadable"));
        assert!(storage.0.get(SEED_STORAGE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_seed_validates_and_trims() {
        let storage = Arc::new(MemoryStore::new());
        let seeds = SeedManager::new(Arc::clone(&storage) as Arc<dyn KeyValueStore>);

        assert!(matches!(
            seeds.replace_seed("   ").await,
            Err(Error::InvalidDerivationInput(_))
        ));
        let bad = vec!["abandon"; 12].join(" ");
        assert!(seeds.replace_seed(&bad).await.is_err());
        assert!(storage.get(SEED_STORAGE_KEY).await.unwrap().is_none());

        let load = seeds.replace_seed(&format!("  {DEV_PHRASE}\n")).await.unwrap();
        assert_eq!(load.origin, SeedOrigin::Replaced);
        assert_eq!(load.seed.phrase, DEV_PHRASE);
        assert_eq!(
            storage.get(SEED_STORAGE_KEY).await.unwrap(),
            Some(json!({"format": 2, "phrase": DEV_PHRASE}))
        );
    }

    #[test]
    fn test_master_key_matches_root_keyring() {
        let ready = crypto_ready().unwrap();
        let master = SeedManager::derive_master_key(&ready, &SeedRecord::new(DEV_PHRASE)).unwrap();
        assert_eq!(
            master.pkh().as_str(),
            "0xbbeb502559223ffc799159e813f2da5ab83aa1c5cb124ee8bdfc442475f140a5"
        );
        assert!(!format!("{master:?}").contains("bottom"));
    }

    #[test]
    fn test_derive_child_matches_uri_derivation() {
        let ready = crypto_ready().unwrap();
        let master = SeedManager::derive_master_key(&ready, &SeedRecord::new(DEV_PHRASE)).unwrap();
        let child = master.derive_child(0).unwrap();
        let direct = persona::derive_key_at(DEV_PHRASE, 0).unwrap();
        assert_eq!(child, direct);
        assert_ne!(&child.pkh, master.pkh());
    }
}
