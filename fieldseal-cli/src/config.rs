//! Configuration loading and validation for the `fieldseal` CLI.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fieldseal::key_provider::Keyring;
use fieldseal_key_file::FileKeyProvider;
use secrecy::SecretVec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Prefix of every environment variable read by the CLI.
pub const ENV_PREFIX: &str = "FIELDSEAL";

/// Validated CLI configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base64 encryption key (`FIELDSEAL_ENCRYPTION_KEY`).
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Base64 blind-index salt (`FIELDSEAL_INDEX_SALT`).
    #[serde(default)]
    pub index_salt: Option<String>,

    /// Key directory written by `fieldseal keygen` (`FIELDSEAL_KEY_DIR`).
    #[serde(default)]
    pub key_dir: Option<PathBuf>,

    /// SQLite database path (`FIELDSEAL_DATABASE`).
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of text.
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Settings {
    /// Load and validate configuration from `FIELDSEAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from an explicit variable map, or the process environment for `None`.
    fn load(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .context("failed to build fieldseal configuration")?;

        let settings: Self =
            cfg.try_deserialize().context("failed to deserialise fieldseal configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.encryption_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            bail!("FIELDSEAL_ENCRYPTION_KEY is set but empty");
        }
        if self.index_salt.is_some() && self.encryption_key.is_none() {
            bail!("FIELDSEAL_INDEX_SALT requires FIELDSEAL_ENCRYPTION_KEY");
        }
        if self.log_level.trim().is_empty() {
            bail!("FIELDSEAL_LOG_LEVEL must not be empty");
        }
        Ok(())
    }

    /// Path of the SQLite database, from the flag or `FIELDSEAL_DATABASE`.
    pub fn database_path(&self, flag: Option<PathBuf>) -> Result<PathBuf> {
        flag.or_else(|| self.database.clone())
            .context("no database given: pass --database or set FIELDSEAL_DATABASE")
    }

    /// Builds the keyring from inline keys, or else from the key directory.
    pub fn keyring(&self) -> Result<Keyring> {
        if let Some(key) = &self.encryption_key {
            let key = decode_secret(key).context("FIELDSEAL_ENCRYPTION_KEY is not valid base64")?;
            let salt = self
                .index_salt
                .as_deref()
                .map(decode_secret)
                .transpose()
                .context("FIELDSEAL_INDEX_SALT is not valid base64")?;
            return Keyring::new(key, salt).context("invalid key material");
        }

        if let Some(dir) = &self.key_dir {
            let provider = FileKeyProvider::new(dir)
                .with_context(|| format!("cannot open key directory {}", dir.display()))?;
            return Keyring::from_provider(&provider).context("cannot load keys");
        }

        bail!("no key material: set FIELDSEAL_ENCRYPTION_KEY or FIELDSEAL_KEY_DIR")
    }
}

fn decode_secret(encoded: &str) -> Result<SecretVec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded.trim()).map(SecretVec::new)
}
