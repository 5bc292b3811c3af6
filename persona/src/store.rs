//! Persisted persona key store.
//!
//! The store records every persona derived from the current master key,
//! together with the master key fingerprint and a format version:
//!
//! ```json
//! {
//!   "num": 1,
//!   "master_pkh": "0x...",
//!   "format": 2,
//!   "info": [{"path": 0, "pkh": "0x...", "hdkey": "...", "active": true}]
//! }
//! ```
//!
//! A store is only trusted while it matches the live master key and the
//! current format. Anything else is stale and gets rebuilt by [`reconcile`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::persona::{PersonaKey, Pkh};
use crate::seed::MasterKey;
use crate::storage::KeyValueStore;

/// Storage key for the persona key store.
pub const PERSONA_KEYS_STORAGE_KEY: &str = "persona_keys";

/// Current persona key store format.
///
/// Bump this whenever derivation or the stored shape changes; existing
/// stores are then rebuilt on the next launch.
pub const PERSONA_KEY_FORMAT: u32 = 2;

/// Upper bound on entries kept in `info`, superseded ones included.
const MAX_RETAINED_KEYS: usize = 16;

/// Index of the persona derived on rebuild.
const PRIMARY_PERSONA_INDEX: u32 = 0;

/// The persisted persona key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaKeyStore {
    /// Number of entries in `info`.
    #[serde(default)]
    pub num: usize,
    /// Pkh of the master key these personas were derived from.
    pub master_pkh: Pkh,
    /// Record format. Stores written before formats were tracked have none.
    #[serde(default)]
    pub format: u32,
    /// Persona entries; the first one is the active persona.
    #[serde(default)]
    pub info: Vec<PersonaKey>,
}

impl PersonaKeyStore {
    /// A fresh store holding a single active persona.
    #[must_use]
    pub fn new(master_pkh: Pkh, persona: PersonaKey) -> Self {
        Self {
            num: 1,
            master_pkh,
            format: PERSONA_KEY_FORMAT,
            info: vec![persona],
        }
    }

    /// The persona requests are signed as.
    #[must_use]
    pub fn active_persona(&self) -> Option<&PersonaKey> {
        self.info.first()
    }

    /// Check this store against the live master key.
    #[must_use]
    pub fn state(&self, master_pkh: &Pkh) -> StoreState {
        if self.format != PERSONA_KEY_FORMAT {
            StoreState::Stale(StaleReason::FormatChanged {
                found: self.format,
                expected: PERSONA_KEY_FORMAT,
            })
        } else if self.info.is_empty() {
            StoreState::Stale(StaleReason::Empty)
        } else if &self.master_pkh != master_pkh {
            StoreState::Stale(StaleReason::MasterChanged {
                found: self.master_pkh.clone(),
                expected: master_pkh.clone(),
            })
        } else {
            StoreState::Fresh
        }
    }
}

/// Why a store has to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// The store holds no persona.
    Empty,
    /// The store was derived from another master key.
    MasterChanged {
        /// Fingerprint recorded in the store.
        found: Pkh,
        /// Fingerprint of the live master key.
        expected: Pkh,
    },
    /// The store was written in another format.
    FormatChanged {
        /// Format recorded in the store.
        found: u32,
        /// Current format.
        expected: u32,
    },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("no personas"),
            Self::MasterChanged { found, expected } => {
                write!(f, "master key changed ({found} -> {expected})")
            }
            Self::FormatChanged { found, expected } => {
                write!(f, "format changed ({found} -> {expected})")
            }
        }
    }
}

/// Lifecycle of the persona key store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreState {
    /// Nothing stored (or the stored value was unreadable).
    Absent,
    /// A store exists but cannot be trusted.
    Stale(StaleReason),
    /// The store matches the live master key and format.
    Fresh,
}

/// Classify an optional store against the live master key.
#[must_use]
pub fn classify(existing: Option<&PersonaKeyStore>, master: &MasterKey) -> StoreState {
    existing.map_or(StoreState::Absent, |store| store.state(master.pkh()))
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The store to use from now on.
    pub store: PersonaKeyStore,
    /// State of the previous store.
    pub previous: StoreState,
}

impl Reconciled {
    /// Returns `true` if the store was rebuilt.
    #[must_use]
    pub const fn rebuilt(&self) -> bool {
        !matches!(self.previous, StoreState::Fresh)
    }
}

/// Bring a persona key store in line with the live master key.
///
/// A fresh store is returned unchanged. Otherwise persona 0 is derived
/// from the master key and becomes the only active entry. If the old store
/// belonged to another master key its entries are kept after it, marked
/// inactive.
///
/// # Errors
///
/// Returns [`Error::InvalidDerivationInput`] if the persona cannot be derived.
pub fn reconcile(master: &MasterKey, existing: Option<PersonaKeyStore>) -> Result<Reconciled> {
    let previous = classify(existing.as_ref(), master);
    if let (StoreState::Fresh, Some(store)) = (&previous, &existing) {
        return Ok(Reconciled {
            store: store.clone(),
            previous,
        });
    }

    let persona = master.derive_child(PRIMARY_PERSONA_INDEX)?;
    let mut store = PersonaKeyStore::new(master.pkh().clone(), persona);

    if let Some(old) = existing
        && &old.master_pkh != master.pkh()
    {
        let mut seen: HashSet<Pkh> = store.info.iter().map(|k| k.pkh.clone()).collect();
        let retained: Vec<PersonaKey> = old
            .info
            .iter()
            .filter(|k| seen.insert(k.pkh.clone()))
            .map(PersonaKey::deactivated)
            .take(MAX_RETAINED_KEYS - store.info.len())
            .collect();
        store.info.extend(retained);
    }
    store.num = store.info.len();

    Ok(Reconciled { store, previous })
}

/// Outcome of [`KeyStoreManager::reconcile_and_persist`].
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// The store now in effect.
    pub store: PersonaKeyStore,
    /// State of the store before reconciliation.
    pub previous: StoreState,
    /// Set when a rebuilt store could not be written. The in-memory store
    /// stays authoritative and the next launch detects staleness again.
    pub persist_error: Option<Error>,
}

impl ReconcileOutcome {
    /// Returns `true` if the store was rebuilt.
    #[must_use]
    pub const fn rebuilt(&self) -> bool {
        !matches!(self.previous, StoreState::Fresh)
    }
}

/// Loads and rewrites the persisted persona key store.
///
/// Reconciliation is serialized so concurrent triggers produce a single
/// rebuild and a single write.
pub struct KeyStoreManager {
    storage: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl KeyStoreManager {
    /// Create a manager over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Load the stored persona keys.
    ///
    /// Unreadable or malformed values are logged and treated as absent.
    pub async fn load(&self) -> Option<PersonaKeyStore> {
        let value = match self.storage.get(PERSONA_KEYS_STORAGE_KEY).await {
            Ok(value) => value?,
            Err(e) => {
                warn!(error = %e, "failed to read persona keys, treating as absent");
                return None;
            }
        };

        match serde_json::from_value::<PersonaKeyStore>(value) {
            Ok(store) => {
                debug!(num = store.info.len(), format = store.format, "loaded persona keys");
                Some(store)
            }
            Err(e) => {
                warn!(error = %e, "stored persona keys are malformed, treating as absent");
                None
            }
        }
    }

    /// Load, reconcile against `master`, and write back a rebuilt store.
    ///
    /// `current` is the in-memory store, if any; it takes precedence over the
    /// stored one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`] if the persona cannot be
    /// derived. Write failures are reported in the outcome instead.
    pub async fn reconcile_and_persist(
        &self,
        master: &MasterKey,
        current: Option<PersonaKeyStore>,
    ) -> Result<ReconcileOutcome> {
        let _guard = self.lock.lock().await;

        let existing = match current {
            Some(store) => Some(store),
            None => self.load().await,
        };

        let Reconciled { store, previous } = reconcile(master, existing)?;
        if !matches!(previous, StoreState::Fresh) {
            info!(
                master_pkh = %store.master_pkh,
                num = store.num,
                reason = %describe(&previous),
                "rebuilt persona keys"
            );
        }

        let persist_error = if matches!(previous, StoreState::Fresh) {
            None
        } else {
            self.persist(&store).await.err()
        };

        Ok(ReconcileOutcome {
            store,
            previous,
            persist_error,
        })
    }

    async fn persist(&self, store: &PersonaKeyStore) -> Result<()> {
        let value = serde_json::to_value(store)?;
        self.storage
            .set(PERSONA_KEYS_STORAGE_KEY, &value)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to persist persona keys");
                Error::persistence(PERSONA_KEYS_STORAGE_KEY, e.to_string())
            })
    }
}

impl fmt::Debug for KeyStoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreManager")
            .field("backend", &self.storage.backend())
            .finish_non_exhaustive()
    }
}

fn describe(state: &StoreState) -> String {
    match state {
        StoreState::Absent => "absent".to_owned(),
        StoreState::Stale(reason) => reason.to_string(),
        StoreState::Fresh => "fresh".to_owned(),
    }
}
