use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::subscription::{RepositoryLocation, SignaturePolicy, Subscription, SubscriptionId};

// =============================================================================
// Time-related constants
// =============================================================================

/// Default reconciliation interval in seconds (10 minutes).
pub const DEFAULT_INTERVAL_SECS: u64 = 600;

/// Delay between starting each subscription's reconcile loop (50ms).
pub const RECONCILE_STAGGER_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration structure
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicatorConfig {
    pub defaults: DefaultsConfig,
    pub credentials: Vec<CredentialEntry>,
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Defaults applied to subscriptions that do not override them
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultsConfig {
    /// Reconciliation interval in seconds
    pub interval_seconds: u64,
    /// Namespace for subscriptions that do not set one
    pub namespace: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECS,
            namespace: "default".to_string(),
        }
    }
}

/// A named credentials entry: a registry login, public key material for
/// signature verification, or a signing key.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CredentialEntry {
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_material: Option<String>,
}

/// One replication relationship as declared in the configuration file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub component: String,
    pub source: RepositoryLocation,
    #[serde(default)]
    pub destination: Option<RepositoryLocation>,
    #[serde(default)]
    pub semver: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub verify: Vec<SignaturePolicy>,
    #[serde(default)]
    pub signing_key: Option<String>,
    #[serde(default)]
    pub generation: i64,
}

impl ReplicatorConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let credential_names: HashSet<&str> =
            self.credentials.iter().map(|c| c.name.as_str()).collect();
        if credential_names.len() != self.credentials.len() {
            return Err(ConfigError::Invalid(
                "duplicate credentials entry names".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for subscription in &self.subscriptions {
            let id = self.subscription_id(subscription);
            if !seen.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate subscription '{id}'"
                )));
            }
            if subscription.component.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "subscription '{id}' has no component"
                )));
            }
            if subscription.source.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "subscription '{id}' has no source url"
                )));
            }

            for reference in self.credential_references(subscription) {
                if !credential_names.contains(reference.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "subscription '{id}' references unknown credentials entry '{reference}'"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Materialize the runtime subscriptions with defaults applied.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|config| Subscription {
                id: self.subscription_id(config),
                generation: config.generation,
                interval: Duration::from_secs(
                    config
                        .interval_seconds
                        .unwrap_or(self.defaults.interval_seconds),
                ),
                component: config.component.clone(),
                source: config.source.clone(),
                destination: config.destination.clone(),
                semver: config.semver.clone(),
                verify: config.verify.clone(),
                signing_key: config.signing_key.clone(),
            })
            .collect()
    }

    fn subscription_id(&self, config: &SubscriptionConfig) -> SubscriptionId {
        SubscriptionId::new(
            config
                .namespace
                .clone()
                .unwrap_or_else(|| self.defaults.namespace.clone()),
            config.name.clone(),
        )
    }

    fn credential_references<'a>(
        &self,
        subscription: &'a SubscriptionConfig,
    ) -> Vec<&'a String> {
        let mut references = Vec::new();
        references.extend(subscription.source.credentials.as_ref());
        if let Some(destination) = &subscription.destination {
            references.extend(destination.credentials.as_ref());
        }
        references.extend(subscription.verify.iter().map(|policy| &policy.public_key));
        references.extend(subscription.signing_key.as_ref());
        references
    }
}

/// Returns the path to the data directory for component-replicator.
/// Uses $XDG_DATA_HOME/component-replicator if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/component-replicator,
/// or ./component-replicator if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the state database file.
pub fn db_path() -> PathBuf {
    data_dir().join("state.db")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("component-replicator")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_from(value: serde_json::Value) -> ReplicatorConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn config_from_partial_object_uses_defaults_for_missing_fields() {
        let config = config_from(json!({
            "subscriptions": [
                {
                    "name": "podinfo",
                    "component": "acme/podinfo",
                    "source": { "url": "source.example.com" }
                }
            ]
        }));

        assert_eq!(config.defaults.interval_seconds, DEFAULT_INTERVAL_SECS);
        assert_eq!(config.defaults.namespace, "default");
        assert!(config.credentials.is_empty());

        let subscriptions = config.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        let subscription = &subscriptions[0];
        assert_eq!(subscription.id.to_string(), "default/podinfo");
        assert_eq!(
            subscription.interval,
            Duration::from_secs(DEFAULT_INTERVAL_SECS)
        );
        assert_eq!(subscription.destination, None);
        assert_eq!(subscription.semver, None);
    }

    #[test]
    fn config_from_full_object_parses_all_fields() {
        let config = config_from(json!({
            "defaults": { "intervalSeconds": 60, "namespace": "delivery" },
            "credentials": [
                { "name": "source-creds", "username": "robot", "password": "hunter2" },
                { "name": "release-key", "keyMaterial": "-----BEGIN PUBLIC KEY-----" }
            ],
            "subscriptions": [
                {
                    "name": "podinfo",
                    "component": "acme/podinfo",
                    "source": { "url": "source.example.com", "credentials": "source-creds" },
                    "destination": { "url": "destination.example.com" },
                    "semver": ">=1.0.0 <2.0.0",
                    "intervalSeconds": 30,
                    "verify": [ { "name": "release", "publicKey": "release-key" } ],
                    "generation": 4
                }
            ]
        }));
        config.validate().unwrap();

        let subscriptions = config.subscriptions();
        let subscription = &subscriptions[0];
        assert_eq!(subscription.id.to_string(), "delivery/podinfo");
        assert_eq!(subscription.interval, Duration::from_secs(30));
        assert_eq!(subscription.generation, 4);
        assert_eq!(subscription.semver.as_deref(), Some(">=1.0.0 <2.0.0"));
        assert_eq!(subscription.verify.len(), 1);
    }

    #[test]
    fn validate_rejects_duplicate_subscriptions() {
        let config = config_from(json!({
            "subscriptions": [
                { "name": "podinfo", "component": "acme/podinfo", "source": { "url": "a" } },
                { "name": "podinfo", "component": "acme/podinfo", "source": { "url": "b" } }
            ]
        }));

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_unknown_credential_references() {
        let config = config_from(json!({
            "subscriptions": [
                {
                    "name": "podinfo",
                    "component": "acme/podinfo",
                    "source": { "url": "source.example.com", "credentials": "missing" }
                }
            ]
        }));

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_accepts_resolvable_credential_references() {
        let config = config_from(json!({
            "credentials": [ { "name": "source-creds", "username": "u", "password": "p" } ],
            "subscriptions": [
                {
                    "name": "podinfo",
                    "component": "acme/podinfo",
                    "source": { "url": "source.example.com", "credentials": "source-creds" }
                }
            ]
        }));

        config.validate().unwrap();
    }

    #[test]
    fn data_dir_with_env_uses_xdg_data_home_when_set() {
        let path = data_dir_with_env(
            Some("/tmp/test-data".to_string()),
            Some(PathBuf::from("/home/user")),
        );

        assert_eq!(path, PathBuf::from("/tmp/test-data/component-replicator"));
    }

    #[test]
    fn data_dir_with_env_falls_back_to_home_local_share() {
        let path = data_dir_with_env(None, Some(PathBuf::from("/home/user")));

        assert_eq!(
            path,
            PathBuf::from("/home/user/.local/share/component-replicator")
        );
    }

    #[test]
    fn data_dir_with_env_falls_back_to_current_dir_when_no_dirs_available() {
        let path = data_dir_with_env(None, None);
        assert_eq!(path, PathBuf::from("./component-replicator"));
    }
}
