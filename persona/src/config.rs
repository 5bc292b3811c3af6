//! Identity configuration.
//!
//! Settings live in `~/.persona/config.json`. Every section is optional and
//! falls back to its defaults, so an empty file (or no file) is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::keyring::CacheConfig;
use crate::signer::SignerConfig;
use crate::verify::VerifierConfig;

/// Top-level configuration for an identity session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory for persisted identity state. Defaults to
    /// `~/.persona/state`.
    pub storage_dir: Option<PathBuf>,
    /// Request signing settings.
    pub signer: SignerConfig,
    /// Keyring cache settings.
    pub cache: CacheConfig,
    /// Backend client settings.
    pub client: ClientConfig,
    /// Envelope verification settings.
    pub verifier: VerifierConfig,
}

impl IdentityConfig {
    /// Directory for persisted identity state.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("state"))
    }

    /// Check settings that cannot be expressed in the types.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty endpoint, a zero cache bound or
    /// a zero nonce window.
    pub fn validate(&self) -> Result<()> {
        if self.client.endpoint.trim().is_empty() {
            return Err(Error::config("client.endpoint must not be empty"));
        }
        if self.cache.max_entries == Some(0) {
            return Err(Error::config("cache.max_entries must be at least 1"));
        }
        if self.verifier.nonce_capacity == 0 {
            return Err(Error::config("verifier.nonce_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Base directory for persona files (`~/.persona`).
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".persona")
}

/// Default configuration file path.
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from `path`, or from [`config_path`] when `None`.
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file cannot be read or parsed, or fails
/// [`IdentityConfig::validate`].
pub async fn load_config(path: Option<&Path>) -> Result<IdentityConfig> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let config = match tokio::fs::read_to_string(&path).await {
        Ok(content) => serde_json::from_str::<IdentityConfig>(&content)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            IdentityConfig::default()
        }
        Err(e) => return Err(Error::config(format!("{}: {e}", path.display()))),
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{KeyEncoding, PayloadMode};

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json"))).await.unwrap();
        assert_eq!(config, IdentityConfig::default());
    }

    #[tokio::test]
    async fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{
                "storage_dir": "/tmp/persona-state",
                "signer": {"key_encoding": "byte-list"},
                "cache": {"max_entries": 8},
                "client": {"endpoint": "https://api.example.com/graphql/"}
            }"#,
        )
        .await
        .unwrap();

        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.storage_dir(), PathBuf::from("/tmp/persona-state"));
        assert_eq!(config.signer.key_encoding, KeyEncoding::ByteList);
        assert_eq!(config.signer.payload_mode, PayloadMode::Raw);
        assert_eq!(config.cache.max_entries, Some(8));
        assert_eq!(config.client.endpoint, "https://api.example.com/graphql/");
        assert_eq!(config.client.timeout_secs, Some(30));
        assert_eq!(config.verifier, VerifierConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        tokio::fs::write(&path, "{ nope").await.unwrap();
        assert!(matches!(load_config(Some(&path)).await, Err(Error::Config(_))));

        tokio::fs::write(&path, r#"{"cache": {"max_entries": 0}}"#).await.unwrap();
        assert!(matches!(load_config(Some(&path)).await, Err(Error::Config(_))));
    }

    #[test]
    fn test_default_paths() {
        assert!(config_path().ends_with(".persona/config.json"));
        assert!(IdentityConfig::default().storage_dir().ends_with(".persona/state"));
    }
}
