//! API key lookup for jobs.
//!
//! Keys come from a plaintext JSON object file and from the environment.
//! Values are held in [`Zeroizing`] buffers so they are wiped on drop.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Source of named secrets.
pub trait KeyProvider: Send + Sync {
    /// Look up `name`, returning `None` when it is not configured.
    fn lookup(&self, name: &str) -> Option<Zeroizing<String>>;
}

/// File- and environment-backed key store.
///
/// Environment variables take precedence: `opendata_service_key` with prefix
/// `INGEST_KEY_` is read from `INGEST_KEY_OPENDATA_SERVICE_KEY`.
#[derive(Default)]
pub struct KeyStore {
    keys: HashMap<String, Zeroizing<String>>,
    env_prefix: Option<String>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `{"name": "value", ...}` JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read key file: {}", path.display()))?,
        );
        let raw: HashMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse key file: {}", path.display()))?;
        let keys = raw
            .into_iter()
            .map(|(name, value)| (name, Zeroizing::new(value)))
            .collect::<HashMap<_, _>>();
        info!(path = %path.display(), count = keys.len(), "loaded API keys");
        Ok(Self {
            keys,
            env_prefix: None,
        })
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn open_or_empty(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Persist the file-backed keys to `path` with mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let sorted: BTreeMap<&str, &str> = self
            .keys
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        let content = Zeroizing::new(serde_json::to_string_pretty(&sorted)?);
        fs::write(path, content.as_bytes())
            .with_context(|| format!("failed to write key file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }

        info!(path = %path.display(), count = self.keys.len(), "saved API keys");
        Ok(())
    }

    /// Also consult environment variables named `<prefix><NAME>`.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(name.into(), Zeroizing::new(value.into()));
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.keys.remove(name).is_some()
    }

    /// Names of the file-backed keys, sorted. Values are never exposed here.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn env_var_name(&self, name: &str) -> Option<String> {
        self.env_prefix
            .as_ref()
            .map(|prefix| format!("{}{}", prefix, name.to_ascii_uppercase()))
    }
}

impl KeyProvider for KeyStore {
    fn lookup(&self, name: &str) -> Option<Zeroizing<String>> {
        if let Some(var) = self.env_var_name(name) {
            if let Ok(value) = std::env::var(&var) {
                debug!(key = %name, source = "env", "API key resolved");
                return Some(Zeroizing::new(value));
            }
        }
        self.keys.get(name).cloned()
    }
}
