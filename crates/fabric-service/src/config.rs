// SPDX-License-Identifier: Apache-2.0
//! Configuration resolution: config-store override → environment variable
//! → hard-coded default, for every path and tunable the fabric needs.

use std::path::PathBuf;

use fabric_app_core::config::{ConfigService, ConfigStore};
use serde::{Deserialize, Serialize};

/// Persisted fabric settings, loaded/saved as a single blob under the key
/// `"fabric"` in whatever [`ConfigStore`] backs the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSettings {
    pub snippets_dir: Option<String>,
    pub audit_log_path: Option<String>,
    pub checkpoint_path: Option<String>,
    pub default_ttl_secs: Option<f64>,
}

/// Resolves a setting by checking, in order, a loaded config-store override,
/// an environment variable, then a hard-coded default.
pub struct ConfigResolver {
    stored: StoredSettings,
}

impl ConfigResolver {
    /// Build a resolver backed by `store`; a missing or unreadable config
    /// blob resolves to an empty override set rather than failing startup.
    pub fn from_store<S: ConfigStore>(store: &S) -> Self {
        let service = ConfigService::new(store);
        let stored = service.load::<StoredSettings>("fabric").ok().flatten().unwrap_or_default();
        Self { stored }
    }

    /// A resolver with no config-store overrides, useful for tests and for
    /// running with `--no-config-store`.
    pub fn empty() -> Self {
        Self { stored: StoredSettings::default() }
    }

    /// Build a resolver directly from a settings blob, bypassing both the
    /// config store and environment variables. Useful for tests that need
    /// deterministic paths without mutating process-global env state.
    pub fn from_stored(stored: StoredSettings) -> Self {
        Self { stored }
    }

    fn resolve_string(&self, stored: Option<&str>, env_var: &str, default: &str) -> String {
        if let Some(value) = stored {
            return value.to_string();
        }
        if let Ok(value) = std::env::var(env_var) {
            return value;
        }
        default.to_string()
    }

    fn resolve_f64(&self, stored: Option<f64>, env_var: &str, default: f64) -> f64 {
        if let Some(value) = stored {
            return value;
        }
        if let Ok(value) = std::env::var(env_var) {
            if let Ok(parsed) = value.parse() {
                return parsed;
            }
        }
        default
    }

    pub fn snippets_dir(&self) -> PathBuf {
        PathBuf::from(self.resolve_string(self.stored.snippets_dir.as_deref(), "FABRIC_SNIPPETS_DIR", "./fabric-data/snippets"))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        PathBuf::from(self.resolve_string(
            self.stored.audit_log_path.as_deref(),
            "FABRIC_AUDIT_LOG_PATH",
            "./fabric-data/audit.jsonl",
        ))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(self.resolve_string(
            self.stored.checkpoint_path.as_deref(),
            "FABRIC_CHECKPOINT_PATH",
            "./fabric-data/checkpoint.json",
        ))
    }

    pub fn default_ttl_secs(&self) -> f64 {
        self.resolve_f64(self.stored.default_ttl_secs, "FABRIC_DEFAULT_TTL_SECS", 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_resolver_falls_back_to_hard_coded_defaults() {
        let resolver = ConfigResolver::empty();
        assert_eq!(resolver.default_ttl_secs(), 3600.0);
        assert_eq!(resolver.checkpoint_path(), PathBuf::from("./fabric-data/checkpoint.json"));
    }

    #[test]
    fn stored_override_wins_over_default() {
        let mut resolver = ConfigResolver::empty();
        resolver.stored.default_ttl_secs = Some(120.0);
        assert_eq!(resolver.default_ttl_secs(), 120.0);
    }
}
