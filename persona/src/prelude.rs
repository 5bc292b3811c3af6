//! Commonly used types, re-exported for glob import.

pub use crate::client::{ClientConfig, GraphqlClient, SigningMiddleware, Transport};
pub use crate::config::{IdentityConfig, load_config};
pub use crate::error::{Error, Result};
pub use crate::keyring::{CacheConfig, CryptoReady, Keyring, KeyringCache, crypto_ready};
pub use crate::persona::{PersonaKey, Pkh, derive_key_at};
pub use crate::seed::{MasterKey, SeedManager, SeedRecord};
pub use crate::session::{IdentitySession, ReconcileReport};
pub use crate::signer::{KeyEncoding, PayloadMode, RequestSigner, SignedEnvelope, SignerConfig};
pub use crate::storage::{FileStore, KeyValueStore, MemoryStore};
pub use crate::store::{PersonaKeyStore, StoreState};
pub use crate::verify::{AuthHeaders, ReplayGuard, VerifierConfig, verify_headers};
