//! Unified error types for the persona crate.
//!
//! The hierarchy follows the identity pipeline:
//! - seed and derivation failures (fatal for identity)
//! - signing failures (abort the affected request)
//! - storage and persistence failures (recovered or reported as warnings)
//! - transport and GraphQL failures (bubble to the caller)
//!
//! A stale persona key store is not an error. It is modelled as
//! [`StoreState::Stale`](crate::store::StoreState::Stale) and handled by
//! reconciliation.

/// Result type alias for persona operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the persona crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No seed could be loaded or generated.
    ///
    /// Fatal at startup: nothing identity-dependent can proceed.
    #[error("seed unavailable: {0}")]
    SeedUnavailable(String),

    /// A seed phrase, secret URI or index cannot be turned into a keypair.
    #[error("invalid derivation input: {0}")]
    InvalidDerivationInput(String),

    /// No keyring could be resolved for a persona, so nothing may be sent.
    #[error("signing unavailable: {0}")]
    SigningUnavailable(String),

    /// Writing identity state to storage failed.
    ///
    /// Non-fatal: the in-memory state stays authoritative for the session.
    #[error("failed to persist '{key}': {message}")]
    PersistenceWriteFailed {
        /// Storage key that could not be written.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// The storage backend failed.
    #[error("[{backend}] {message}")]
    Storage {
        /// Backend identifier (e.g. `"file"`, `"memory"`).
        backend: &'static str,
        /// Human-readable error description.
        message: String,
    },

    /// A signed envelope failed verification.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The request transport failed before a GraphQL response was read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with HTTP status outside 2xx.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code returned by the backend.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// The backend answered with one or more GraphQL errors.
    #[error("GraphQL error: {}", .0.join("; "))]
    GraphQl(Vec<String>),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a seed unavailable error.
    #[must_use]
    pub fn seed_unavailable(msg: impl Into<String>) -> Self {
        Self::SeedUnavailable(msg.into())
    }

    /// Create an invalid derivation input error.
    #[must_use]
    pub fn invalid_derivation(msg: impl Into<String>) -> Self {
        Self::InvalidDerivationInput(msg.into())
    }

    /// Create a signing unavailable error.
    #[must_use]
    pub fn signing_unavailable(msg: impl Into<String>) -> Self {
        Self::SigningUnavailable(msg.into())
    }

    /// Create a persistence write failure for the given storage key.
    #[must_use]
    pub fn persistence(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PersistenceWriteFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a storage error for the given backend.
    #[must_use]
    pub fn storage(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            backend,
            message: message.into(),
        }
    }

    /// Create a verification error.
    #[must_use]
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a transport error.
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a config error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns `true` if the caller may retry the failed operation.
    ///
    /// A retried request must be signed again; envelopes are never reused.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::SigningUnavailable(_) | Self::Transport(_) | Self::PersistenceWriteFailed { .. } => {
                true
            }
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transport("request timed out")
        } else if err.is_connect() {
            Self::transport(format!("connection failed: {err}"))
        } else {
            Self::transport(err.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => match e.downcast::<Self>() {
                Ok(inner) => inner,
                Err(other) => Self::transport(other.to_string()),
            },
        }
    }
}
