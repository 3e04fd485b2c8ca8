//! Subscription and persisted-state types.
//!
//! A [`Subscription`] declares a single source→destination replication
//! relationship for one component; [`SubscriptionState`] is the durable record
//! the reconcile driver maintains for it.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Condition reasons reported through the `Ready` condition.
pub mod reason {
    /// The most recent pass completed successfully.
    pub const SUCCEEDED: &str = "Succeeded";

    /// Authentication against the source or destination registry failed.
    pub const AUTHENTICATION_FAILED: &str = "AuthenticationFailed";

    /// The configured semver constraint could not be parsed.
    pub const INVALID_SEMVER_CONSTRAINT: &str = "InvalidSemverConstraint";

    /// No published version matched the constraint yet.
    pub const NO_MATCHING_VERSION: &str = "NoMatchingVersion";

    /// The source registry could not be reached while listing versions.
    pub const REGISTRY_UNREACHABLE: &str = "RegistryUnreachable";

    /// Fetching the component descriptor for the selected version failed.
    pub const DESCRIPTOR_FETCH_FAILED: &str = "ComponentDescriptorFetchFailed";

    /// Signature verification of the source component failed.
    pub const VERIFICATION_FAILED: &str = "ComponentVerificationFailed";

    /// Signing the destination component failed.
    pub const SIGNING_FAILED: &str = "ComponentSigningFailed";

    /// Transferring the component to the destination failed.
    pub const TRANSFER_FAILED: &str = "TransferFailed";
}

/// Identity of a subscription. The host scheduler serializes passes per id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId {
    pub namespace: String,
    pub name: String,
}

impl SubscriptionId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A repository to replicate from or to, with an optional named credentials
/// entry used to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryLocation {
    pub url: String,
    #[serde(default)]
    pub credentials: Option<String>,
}

impl RepositoryLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
        }
    }
}

/// A signature the source component must carry, and the credentials entry
/// holding the public key to check it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePolicy {
    /// Name of the signature on the component descriptor.
    pub name: String,
    /// Credentials entry holding the public key material.
    pub public_key: String,
}

/// Desired state of one replication relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Bumped by the configuration layer whenever the subscription changes.
    pub generation: i64,
    /// Requeue interval between reconciliation passes.
    pub interval: Duration,
    pub component: String,
    pub source: RepositoryLocation,
    /// When unset, the component is "replicated in place": no transfer runs
    /// and the source URL is recorded as the replicated location.
    pub destination: Option<RepositoryLocation>,
    /// Semver range constraint; `None` matches every published version.
    pub semver: Option<String>,
    /// Signatures to verify on the source component before transferring.
    pub verify: Vec<SignaturePolicy>,
    /// Credentials entry holding key material used to sign the destination
    /// component; `None` disables signing.
    pub signing_key: Option<String>,
}

/// `Ready` condition reported for a subscription, always reflecting the most
/// recent completed pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCondition {
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

/// Durable record tracked per subscription.
///
/// `last_applied_version` only advances after a transfer attempt completed
/// without error; `last_attempted_version` is written as soon as a candidate
/// is selected, so a crash mid-transfer leaves an observable trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionState {
    #[serde(default)]
    pub last_attempted_version: String,
    #[serde(default)]
    pub last_applied_version: String,
    #[serde(default)]
    pub replicated_repository_url: String,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub ready: Option<ReadyCondition>,
}

impl SubscriptionState {
    /// Overwrite the `Ready` condition. The transition timestamp only moves
    /// when the status flips.
    pub fn set_condition(&mut self, status: bool, reason: &str, message: impl Into<String>) {
        let last_transition_time = match &self.ready {
            Some(existing) if existing.status == status => existing.last_transition_time.clone(),
            _ => Utc::now().to_rfc3339(),
        };
        self.ready = Some(ReadyCondition {
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time,
        });
    }

    /// Whether the last completed pass left the subscription ready.
    pub fn is_ready(&self) -> bool {
        self.ready.as_ref().is_some_and(|c| c.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_id_displays_as_namespace_slash_name() {
        let id = SubscriptionId::new("delivery", "podinfo");
        assert_eq!(id.to_string(), "delivery/podinfo");
    }

    #[test]
    fn set_condition_records_status_reason_and_message() {
        let mut state = SubscriptionState::default();
        state.set_condition(false, reason::TRANSFER_FAILED, "nope");

        let condition = state.ready.as_ref().unwrap();
        assert!(!condition.status);
        assert_eq!(condition.reason, reason::TRANSFER_FAILED);
        assert_eq!(condition.message, "nope");
        assert!(!state.is_ready());
    }

    #[test]
    fn set_condition_keeps_transition_time_while_status_is_unchanged() {
        let mut state = SubscriptionState::default();
        state.set_condition(true, reason::SUCCEEDED, "replicated v1.0.0");
        let first = state.ready.as_ref().unwrap().last_transition_time.clone();

        state.set_condition(true, reason::SUCCEEDED, "replicated v1.1.0");
        let second = state.ready.as_ref().unwrap();
        assert_eq!(second.last_transition_time, first);
        assert_eq!(second.message, "replicated v1.1.0");
    }

    #[test]
    fn set_condition_overwrites_stale_reason_on_flip() {
        let mut state = SubscriptionState::default();
        state.set_condition(false, reason::NO_MATCHING_VERSION, "still searching");
        state.set_condition(true, reason::SUCCEEDED, "replicated v1.0.0");

        let condition = state.ready.as_ref().unwrap();
        assert!(condition.status);
        assert_eq!(condition.reason, reason::SUCCEEDED);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = SubscriptionState {
            last_attempted_version: "v1.2.3".to_string(),
            last_applied_version: "v1.2.2".to_string(),
            replicated_repository_url: "https://registry.example/acme".to_string(),
            observed_generation: 3,
            ready: None,
        };
        state.set_condition(true, reason::SUCCEEDED, "replicated v1.2.2");

        let json = serde_json::to_string(&state).unwrap();
        let decoded: SubscriptionState = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, state);
    }
}
