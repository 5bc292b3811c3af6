//! Identity session.
//!
//! [`IdentitySession`] owns the seed, the derived master key, the persona key
//! store and the signing machinery for one client. Reconciliation runs at two
//! explicit points only: [`IdentitySession::start`] and
//! [`IdentitySession::replace_seed`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use persona::prelude::*;
//!
//! let storage = Arc::new(FileStore::new(config.storage_dir()));
//! let session = IdentitySession::start(storage, config).await?;
//! let client = session.client().await?;
//! let data = client.request("query { me { name } }", serde_json::json!({})).await?;
//! ```

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::client::GraphqlClient;
use crate::config::IdentityConfig;
use crate::error::{Error, Result};
use crate::keyring::{CryptoReady, KeyringCache, crypto_ready};
use crate::persona::{PersonaKey, Pkh};
use crate::seed::{MasterKey, SeedLoad, SeedManager, SeedOrigin};
use crate::signer::{RequestSigner, SignedEnvelope};
use crate::storage::KeyValueStore;
use crate::store::{KeyStoreManager, PersonaKeyStore, StoreState};

/// What a reconciliation pass did.
#[derive(Debug)]
pub struct ReconcileReport {
    /// How the seed was obtained.
    pub seed_origin: SeedOrigin,
    /// State of the persona key store before reconciliation.
    pub store_state: StoreState,
    /// Pkh of the active persona afterwards.
    pub active_pkh: Pkh,
    /// Non-fatal failures, such as writes that did not reach storage.
    pub warnings: Vec<Error>,
}

impl ReconcileReport {
    /// Returns `true` if the persona key store was rebuilt.
    #[must_use]
    pub const fn rebuilt(&self) -> bool {
        !matches!(self.store_state, StoreState::Fresh)
    }
}

struct IdentityState {
    master: Arc<MasterKey>,
    store: PersonaKeyStore,
}

/// Identity and signing context for one client.
pub struct IdentitySession {
    config: IdentityConfig,
    ready: CryptoReady,
    seeds: SeedManager,
    keys: KeyStoreManager,
    cache: Arc<KeyringCache>,
    signer: Arc<RequestSigner>,
    state: RwLock<IdentityState>,
    reseed: Mutex<()>,
    startup: ReconcileReport,
}

impl IdentitySession {
    /// Bring up the identity: load or create the seed, derive the master key,
    /// reconcile the persona key store and warm the keyring cache.
    ///
    /// # Errors
    ///
    /// - [`Error::SigningUnavailable`] if the crypto self-test fails.
    /// - [`Error::SeedUnavailable`] if no seed can be loaded or generated.
    /// - [`Error::InvalidDerivationInput`] if the stored seed cannot be
    ///   derived.
    pub async fn start(storage: Arc<dyn KeyValueStore>, config: IdentityConfig) -> Result<Self> {
        config.validate()?;
        let ready = crypto_ready()?;
        let seeds = SeedManager::new(Arc::clone(&storage));
        let keys = KeyStoreManager::new(storage);
        let cache = Arc::new(KeyringCache::new(config.cache.clone()));
        let signer = Arc::new(RequestSigner::new(Arc::clone(&cache), config.signer));

        let load = seeds.load_or_init_seed().await?;
        let (state, report) = reconcile(&ready, &keys, &cache, load, None).await?;
        info!(
            master_pkh = %state.master.pkh(),
            active_pkh = %report.active_pkh,
            seed = ?report.seed_origin,
            rebuilt = report.rebuilt(),
            "identity session started"
        );

        Ok(Self {
            config,
            ready,
            seeds,
            keys,
            cache,
            signer,
            state: RwLock::new(state),
            reseed: Mutex::new(()),
            startup: report,
        })
    }

    /// Replace the seed phrase and re-derive every identity from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] if the phrase is empty or
    /// cannot be derived. The current identity is kept in that case.
    pub async fn replace_seed(&self, phrase: &str) -> Result<ReconcileReport> {
        let _guard = self.reseed.lock().await;

        let current = self.state.read().await.store.clone();
        let load = self.seeds.replace_seed(phrase).await?;
        let (state, report) = reconcile(&self.ready, &self.keys, &self.cache, load, Some(current)).await?;

        info!(
            master_pkh = %state.master.pkh(),
            active_pkh = %report.active_pkh,
            rebuilt = report.rebuilt(),
            "seed replaced"
        );
        *self.state.write().await = state;
        Ok(report)
    }

    /// Report from the reconciliation run by [`start`](Self::start).
    #[must_use]
    pub const fn startup_report(&self) -> &ReconcileReport {
        &self.startup
    }

    /// The persona requests are signed as.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningUnavailable`] if the store holds no persona.
    pub async fn active_persona(&self) -> Result<PersonaKey> {
        self.state
            .read()
            .await
            .store
            .active_persona()
            .cloned()
            .ok_or_else(|| Error::signing_unavailable("no active persona"))
    }

    /// Pkh of the live master key.
    pub async fn master_pkh(&self) -> Pkh {
        self.state.read().await.master.pkh().clone()
    }

    /// Copy of the in-memory persona key store.
    pub async fn persona_store(&self) -> PersonaKeyStore {
        self.state.read().await.store.clone()
    }

    /// Shared request signer.
    #[must_use]
    pub fn signer(&self) -> Arc<RequestSigner> {
        Arc::clone(&self.signer)
    }

    /// Shared keyring cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<KeyringCache> {
        &self.cache
    }

    /// Session configuration.
    #[must_use]
    pub const fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Sign `payload` as the active persona.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningUnavailable`] if there is no active persona or
    /// its keyring cannot be resolved.
    pub async fn sign(&self, payload: &[u8]) -> Result<SignedEnvelope> {
        let persona = self.active_persona().await?;
        self.signer.sign(&persona, payload)
    }

    /// A GraphQL client authenticated as the active persona.
    ///
    /// The client is bound to the persona at the time of the call; create a
    /// new one after [`replace_seed`](Self::replace_seed).
    ///
    /// # Errors
    ///
    /// Returns [`Error::SigningUnavailable`] if there is no active persona,
    /// or [`Error::Config`] if the client cannot be built.
    pub async fn client(&self) -> Result<GraphqlClient> {
        let persona = self.active_persona().await?;
        GraphqlClient::new(&self.config.client, self.signer(), persona)
    }
}

impl std::fmt::Debug for IdentitySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySession")
            .field("seeds", &self.seeds)
            .field("keys", &self.keys)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

async fn reconcile(
    ready: &CryptoReady,
    keys: &KeyStoreManager,
    cache: &KeyringCache,
    load: SeedLoad,
    current: Option<PersonaKeyStore>,
) -> Result<(IdentityState, ReconcileReport)> {
    let SeedLoad {
        seed,
        origin,
        persist_error,
    } = load;
    let mut warnings: Vec<Error> = persist_error.into_iter().collect();

    let master = Arc::new(SeedManager::derive_master_key(ready, &seed)?);
    let outcome = keys.reconcile_and_persist(&master, current).await?;
    warnings.extend(outcome.persist_error);

    let active = outcome
        .store
        .active_persona()
        .ok_or_else(|| Error::signing_unavailable("reconciled store has no persona"))?;
    if let Err(e) = cache.get_or_create(&active.derivation_uri()) {
        warn!(pkh = %active.pkh, error = %e, "failed to warm keyring cache");
    }
    let active_pkh = active.pkh.clone();

    for warning in &warnings {
        warn!(error = %warning, "identity state kept in memory only");
    }

    Ok((
        IdentityState {
            master,
            store: outcome.store,
        },
        ReconcileReport {
            seed_origin: origin,
            store_state: outcome.previous,
            active_pkh,
            warnings,
        },
    ))
}
