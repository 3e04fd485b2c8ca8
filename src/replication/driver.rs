//! The reconcile driver: one full replication pass for one subscription.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client::ComponentClient;
use crate::replication::constraint::Constraint;
use crate::replication::decision::{ReplicationAction, decide};
use crate::replication::error::{ReconcileError, ResolveError};
use crate::replication::resolver::VersionResolver;
use crate::replication::version_set::ComponentVersion;
use crate::store::StateStore;
use crate::subscription::{Subscription, SubscriptionState, reason};

/// Result of one reconciliation attempt. Drives both the persisted `Ready`
/// condition and the requeue delay. Never persisted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Nothing to act on yet; the subscription keeps polling.
    NoMatchingVersion { reason: String, message: String },
    /// The applied version is already current.
    AlreadyUpToDate { version: String },
    /// A new version was replicated.
    TransferSucceeded {
        version: String,
        destination_url: String,
    },
    /// Descriptor fetch, verification, signing, or the transfer itself failed.
    TransferFailed { reason: String, message: String },
    /// The authenticated context could not be established.
    AuthenticationFailed { message: String },
}

impl ReplicationOutcome {
    /// The `Ready` condition this outcome maps to.
    fn ready_condition(&self) -> (bool, String, String) {
        match self {
            Self::NoMatchingVersion { reason, message } => {
                (false, reason.clone(), message.clone())
            }
            Self::AlreadyUpToDate { version } => (
                true,
                reason::SUCCEEDED.to_string(),
                format!("version '{version}' is already up to date"),
            ),
            Self::TransferSucceeded {
                version,
                destination_url,
            } => (
                true,
                reason::SUCCEEDED.to_string(),
                format!("replicated version '{version}' to '{destination_url}'"),
            ),
            Self::TransferFailed { reason, message } => (false, reason.clone(), message.clone()),
            Self::AuthenticationFailed { message } => (
                false,
                reason::AUTHENTICATION_FAILED.to_string(),
                message.clone(),
            ),
        }
    }
}

/// Successful completion of a pass, carrying the delay until the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSuccess {
    pub outcome: ReplicationOutcome,
    pub requeue_after: Duration,
}

/// Runs reconciliation passes. Stateless between passes: everything durable
/// lives in the [`StateStore`].
pub struct ReconcileDriver {
    client: Arc<dyn ComponentClient>,
    store: Arc<dyn StateStore>,
}

impl ReconcileDriver {
    pub fn new(client: Arc<dyn ComponentClient>, store: Arc<dyn StateStore>) -> Self {
        Self { client, store }
    }

    /// Run one reconciliation pass for `subscription`.
    ///
    /// Ends with exactly one of a typed error or a success carrying the next
    /// requeue delay; bounded retrying is entirely the host scheduler's job.
    pub async fn reconcile_once(
        &self,
        subscription: &Subscription,
    ) -> Result<ReconcileSuccess, ReconcileError> {
        let id = &subscription.id;
        debug!(subscription = %id, component = %subscription.component, "starting reconciliation pass");

        let mut state = self.store.load(id)?.unwrap_or_default();
        state.observed_generation = subscription.generation;

        let ctx = match self.client.create_authenticated_context(subscription).await {
            Ok(ctx) => ctx,
            Err(err) => {
                let outcome = ReplicationOutcome::AuthenticationFailed {
                    message: err.to_string(),
                };
                return self.finish_err(
                    subscription,
                    state,
                    outcome,
                    ReconcileError::Authentication {
                        id: id.clone(),
                        source: err,
                    },
                );
            }
        };

        let constraint = match Constraint::parse(subscription.semver.as_deref().unwrap_or("")) {
            Ok(constraint) => constraint,
            Err(err) => {
                // A broken constraint is a configuration error: surfaced
                // hard, but still retried on the normal interval since the
                // configuration may be fixed externally.
                state.set_condition(false, reason::INVALID_SEMVER_CONSTRAINT, err.to_string());
                self.save_best_effort(subscription, &state);
                return Err(ReconcileError::Constraint(err));
            }
        };

        let resolver = VersionResolver::new(Arc::clone(&self.client));
        let candidate = match resolver
            .resolve_latest(&ctx, &subscription.source, &subscription.component, &constraint)
            .await
        {
            Ok(candidate) => candidate,
            Err(err) => {
                let condition_reason = match &err {
                    ResolveError::RegistryUnreachable { .. } => {
                        error!(subscription = %id, error = %err, "source registry unreachable");
                        reason::REGISTRY_UNREACHABLE
                    }
                    _ => {
                        info!(subscription = %id, "no matching version yet, still searching");
                        reason::NO_MATCHING_VERSION
                    }
                };
                let outcome = ReplicationOutcome::NoMatchingVersion {
                    reason: condition_reason.to_string(),
                    message: err.to_string(),
                };
                return self.finish_ok(subscription, state, outcome);
            }
        };

        match decide(&candidate, &state) {
            ReplicationAction::SkipUpToDate => {
                debug!(subscription = %id, version = %candidate, "already up to date");
                let outcome = ReplicationOutcome::AlreadyUpToDate {
                    version: state.last_applied_version.clone(),
                };
                self.finish_ok(subscription, state, outcome)
            }
            ReplicationAction::Proceed { candidate } => {
                self.replicate(subscription, &ctx, candidate, state).await
            }
        }
    }

    /// Execute the transfer for an accepted candidate.
    async fn replicate(
        &self,
        subscription: &Subscription,
        ctx: &crate::client::AccessContext,
        candidate: ComponentVersion,
        mut state: SubscriptionState,
    ) -> Result<ReconcileSuccess, ReconcileError> {
        let id = &subscription.id;
        info!(subscription = %id, version = %candidate, "new version found, replicating");

        // Persisted before the transfer starts so an interrupted pass leaves
        // an observable trace of what was attempted.
        state.last_attempted_version = candidate.original().to_string();
        self.store.save(id, &state)?;

        let mut descriptor = match self
            .client
            .get_component_descriptor(
                ctx,
                &subscription.source,
                &subscription.component,
                candidate.original(),
            )
            .await
        {
            Ok(descriptor) => descriptor,
            Err(err) => {
                let outcome = ReplicationOutcome::TransferFailed {
                    reason: reason::DESCRIPTOR_FETCH_FAILED.to_string(),
                    message: err.to_string(),
                };
                return self.finish_err(
                    subscription,
                    state,
                    outcome,
                    ReconcileError::DescriptorFetch(err),
                );
            }
        };

        if !subscription.verify.is_empty() {
            if let Err(err) = self
                .client
                .verify_signatures(ctx, &descriptor, &subscription.verify)
                .await
            {
                let outcome = ReplicationOutcome::TransferFailed {
                    reason: reason::VERIFICATION_FAILED.to_string(),
                    message: err.to_string(),
                };
                return self.finish_err(
                    subscription,
                    state,
                    outcome,
                    ReconcileError::Verification(err),
                );
            }
            debug!(subscription = %id, version = %candidate, "source component verified");
        }

        if subscription.signing_key.is_some() {
            match self
                .client
                .sign_destination_component(ctx, &mut descriptor)
                .await
            {
                Ok(public_key) => {
                    debug!(
                        subscription = %id,
                        key_bytes = public_key.len(),
                        "signed destination component"
                    );
                }
                Err(err) => {
                    let outcome = ReplicationOutcome::TransferFailed {
                        reason: reason::SIGNING_FAILED.to_string(),
                        message: err.to_string(),
                    };
                    return self.finish_err(
                        subscription,
                        state,
                        outcome,
                        ReconcileError::Signing(err),
                    );
                }
            }
        }

        let replicated_url = match &subscription.destination {
            Some(destination) => {
                if let Err(err) = self
                    .client
                    .transfer_component(ctx, &descriptor, destination)
                    .await
                {
                    let outcome = ReplicationOutcome::TransferFailed {
                        reason: reason::TRANSFER_FAILED.to_string(),
                        message: err.to_string(),
                    };
                    return self.finish_err(
                        subscription,
                        state,
                        outcome,
                        ReconcileError::Transfer(err),
                    );
                }
                destination.url.clone()
            }
            None => {
                // Replicate-in-place mode: nothing to copy, the source stays
                // the authoritative location.
                debug!(subscription = %id, "no destination configured, skipping transfer");
                subscription.source.url.clone()
            }
        };

        state.last_applied_version = candidate.original().to_string();
        state.replicated_repository_url = replicated_url.clone();

        info!(subscription = %id, version = %candidate, url = %replicated_url, "replication complete");
        let outcome = ReplicationOutcome::TransferSucceeded {
            version: candidate.original().to_string(),
            destination_url: replicated_url,
        };
        self.finish_ok(subscription, state, outcome)
    }

    fn finish_ok(
        &self,
        subscription: &Subscription,
        mut state: SubscriptionState,
        outcome: ReplicationOutcome,
    ) -> Result<ReconcileSuccess, ReconcileError> {
        let (status, condition_reason, message) = outcome.ready_condition();
        state.set_condition(status, &condition_reason, message);
        self.store.save(&subscription.id, &state)?;

        Ok(ReconcileSuccess {
            outcome,
            requeue_after: subscription.interval,
        })
    }

    fn finish_err(
        &self,
        subscription: &Subscription,
        mut state: SubscriptionState,
        outcome: ReplicationOutcome,
        err: ReconcileError,
    ) -> Result<ReconcileSuccess, ReconcileError> {
        let (status, condition_reason, message) = outcome.ready_condition();
        state.set_condition(status, &condition_reason, message);
        self.save_best_effort(subscription, &state);
        Err(err)
    }

    /// Persist the condition without masking the error that caused it.
    fn save_best_effort(&self, subscription: &Subscription, state: &SubscriptionState) {
        if let Err(err) = self.store.save(&subscription.id, state) {
            warn!(subscription = %subscription.id, error = %err, "failed to persist subscription state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        AuthError, ComponentDescriptor, DescriptorError, MockComponentClient, TransferError,
        VerifyError,
    };
    use crate::store::{MockStateStore, SqliteStateStore, StoreError};
    use crate::subscription::{RepositoryLocation, SignaturePolicy, SubscriptionId};
    use tempfile::TempDir;

    fn subscription() -> Subscription {
        Subscription {
            id: SubscriptionId::new("delivery", "podinfo"),
            generation: 1,
            interval: Duration::from_secs(600),
            component: "acme/podinfo".to_string(),
            source: RepositoryLocation::new("source.example.com"),
            destination: Some(RepositoryLocation::new("destination.example.com")),
            semver: None,
            verify: Vec::new(),
            signing_key: None,
        }
    }

    fn descriptor(version: &str) -> ComponentDescriptor {
        ComponentDescriptor {
            name: "acme/podinfo".to_string(),
            version: version.to_string(),
            signatures: Vec::new(),
            manifest: serde_json::json!({}),
            payload: b"{}".to_vec(),
            source: RepositoryLocation::new("source.example.com"),
        }
    }

    fn test_store() -> (TempDir, Arc<SqliteStateStore>) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStateStore::new(&temp_dir.path().join("state.db")).unwrap();
        (temp_dir, Arc::new(store))
    }

    fn client_with_versions(versions: Vec<&str>) -> MockComponentClient {
        let versions: Vec<String> = versions.into_iter().map(|v| v.to_string()).collect();
        let mut client = MockComponentClient::new();
        client
            .expect_create_authenticated_context()
            .returning(|_| Ok(Default::default()));
        client
            .expect_list_versions()
            .returning(move |_, _, _| Ok(versions.clone()));
        client
    }

    #[tokio::test]
    async fn successful_pass_applies_the_selected_version() {
        let (_temp_dir, store) = test_store();
        let mut client = client_with_versions(vec!["v0.0.1", "v0.0.2"]);
        client
            .expect_get_component_descriptor()
            .withf(|_, _, _, version| version == "v0.0.2")
            .returning(|_, _, _, version| Ok(descriptor(version)));
        client
            .expect_transfer_component()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let success = driver.reconcile_once(&sub).await.unwrap();
        assert_eq!(
            success.outcome,
            ReplicationOutcome::TransferSucceeded {
                version: "v0.0.2".to_string(),
                destination_url: "destination.example.com".to_string(),
            }
        );
        assert_eq!(success.requeue_after, sub.interval);

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.last_attempted_version, "v0.0.2");
        assert_eq!(state.last_applied_version, "v0.0.2");
        assert_eq!(state.replicated_repository_url, "destination.example.com");
        assert_eq!(state.observed_generation, 1);
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn transfer_failure_keeps_applied_version_unset() {
        let (_temp_dir, store) = test_store();
        let mut client = client_with_versions(vec!["v0.0.1"]);
        client
            .expect_get_component_descriptor()
            .returning(|_, _, _, version| Ok(descriptor(version)));
        client.expect_transfer_component().times(1).returning(|_, _, _| {
            Err(TransferError::DestinationUnreachable(
                "connection refused".to_string(),
            ))
        });

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let err = driver.reconcile_once(&sub).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transfer(_)));

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.last_attempted_version, "v0.0.1");
        assert_eq!(state.last_applied_version, "");
        let condition = state.ready.unwrap();
        assert!(!condition.status);
        assert_eq!(condition.reason, reason::TRANSFER_FAILED);
    }

    #[tokio::test]
    async fn up_to_date_subscription_skips_the_transfer() {
        let (_temp_dir, store) = test_store();
        let sub = subscription();

        let mut state = SubscriptionState::default();
        state.last_attempted_version = "v0.0.2".to_string();
        state.last_applied_version = "v0.0.2".to_string();
        store.save(&sub.id, &state).unwrap();

        let mut client = client_with_versions(vec!["v0.0.1", "v0.0.2"]);
        client.expect_get_component_descriptor().times(0);
        client.expect_transfer_component().times(0);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let success = driver.reconcile_once(&sub).await.unwrap();

        assert_eq!(
            success.outcome,
            ReplicationOutcome::AlreadyUpToDate {
                version: "v0.0.2".to_string()
            }
        );
        let state = store.load(&sub.id).unwrap().unwrap();
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn older_upstream_version_never_downgrades() {
        let (_temp_dir, store) = test_store();
        let sub = subscription();

        let mut state = SubscriptionState::default();
        state.last_attempted_version = "v0.2.0".to_string();
        state.last_applied_version = "v0.2.0".to_string();
        store.save(&sub.id, &state).unwrap();

        let mut client = client_with_versions(vec!["v0.1.0"]);
        client.expect_transfer_component().times(0);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let success = driver.reconcile_once(&sub).await.unwrap();

        assert!(matches!(
            success.outcome,
            ReplicationOutcome::AlreadyUpToDate { .. }
        ));
        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.last_applied_version, "v0.2.0");
    }

    #[tokio::test]
    async fn missing_destination_replicates_in_place() {
        let (_temp_dir, store) = test_store();
        let mut sub = subscription();
        sub.destination = None;

        let mut client = client_with_versions(vec!["v0.0.1"]);
        client
            .expect_get_component_descriptor()
            .returning(|_, _, _, version| Ok(descriptor(version)));
        client.expect_transfer_component().times(0);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let success = driver.reconcile_once(&sub).await.unwrap();

        assert_eq!(
            success.outcome,
            ReplicationOutcome::TransferSucceeded {
                version: "v0.0.1".to_string(),
                destination_url: "source.example.com".to_string(),
            }
        );
        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.replicated_repository_url, "source.example.com");
    }

    #[tokio::test]
    async fn authentication_failure_marks_not_ready_and_errors() {
        let (_temp_dir, store) = test_store();
        let mut client = MockComponentClient::new();
        client.expect_create_authenticated_context().returning(|_| {
            Err(AuthError::CredentialsNotFound("registry-creds".to_string()))
        });
        client.expect_list_versions().times(0);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let err = driver.reconcile_once(&sub).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Authentication { .. }));

        let state = store.load(&sub.id).unwrap().unwrap();
        let condition = state.ready.unwrap();
        assert!(!condition.status);
        assert_eq!(condition.reason, reason::AUTHENTICATION_FAILED);
    }

    #[tokio::test]
    async fn invalid_constraint_is_a_hard_error() {
        let (_temp_dir, store) = test_store();
        let client = client_with_versions(vec!["v0.0.1"]);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let mut sub = subscription();
        sub.semver = Some("not-a-constraint".to_string());

        let err = driver.reconcile_once(&sub).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Constraint(_)));

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(
            state.ready.unwrap().reason,
            reason::INVALID_SEMVER_CONSTRAINT
        );
    }

    #[tokio::test]
    async fn no_versions_published_keeps_polling_without_error() {
        let (_temp_dir, store) = test_store();
        let client = client_with_versions(vec![]);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let success = driver.reconcile_once(&sub).await.unwrap();
        assert!(matches!(
            success.outcome,
            ReplicationOutcome::NoMatchingVersion { .. }
        ));
        assert_eq!(success.requeue_after, sub.interval);

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.ready.unwrap().reason, reason::NO_MATCHING_VERSION);
    }

    #[tokio::test]
    async fn unreachable_registry_surfaces_prominently_but_keeps_polling() {
        let (_temp_dir, store) = test_store();
        let mut client = MockComponentClient::new();
        client
            .expect_create_authenticated_context()
            .returning(|_| Ok(Default::default()));
        client.expect_list_versions().returning(|_, _, _| {
            Err(crate::client::RegistryError::Unreachable(
                "connection refused".to_string(),
            ))
        });

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let success = driver.reconcile_once(&sub).await.unwrap();
        assert!(matches!(
            success.outcome,
            ReplicationOutcome::NoMatchingVersion { .. }
        ));

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.ready.unwrap().reason, reason::REGISTRY_UNREACHABLE);
    }

    #[tokio::test]
    async fn descriptor_fetch_failure_reports_its_own_reason() {
        let (_temp_dir, store) = test_store();
        let mut client = client_with_versions(vec!["v0.0.1"]);
        client.expect_get_component_descriptor().returning(|_, _, component, version| {
            Err(DescriptorError::NotFound {
                component: component.to_string(),
                version: version.to_string(),
            })
        });
        client.expect_transfer_component().times(0);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let err = driver.reconcile_once(&sub).await.unwrap_err();
        assert!(matches!(err, ReconcileError::DescriptorFetch(_)));

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.last_attempted_version, "v0.0.1");
        assert_eq!(
            state.ready.unwrap().reason,
            reason::DESCRIPTOR_FETCH_FAILED
        );
    }

    #[tokio::test]
    async fn verification_failure_blocks_the_transfer() {
        let (_temp_dir, store) = test_store();
        let mut client = client_with_versions(vec!["v0.0.1"]);
        client
            .expect_get_component_descriptor()
            .returning(|_, _, _, version| Ok(descriptor(version)));
        client.expect_verify_signatures().returning(|_, _, _| {
            Err(VerifyError::DigestMismatch {
                name: "release-signature".to_string(),
            })
        });
        client.expect_transfer_component().times(0);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let mut sub = subscription();
        sub.verify = vec![SignaturePolicy {
            name: "release-signature".to_string(),
            public_key: "release-key".to_string(),
        }];

        let err = driver.reconcile_once(&sub).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Verification(_)));

        let state = store.load(&sub.id).unwrap().unwrap();
        assert_eq!(state.ready.unwrap().reason, reason::VERIFICATION_FAILED);
    }

    #[tokio::test]
    async fn state_store_failures_surface_as_errors() {
        let mut store = MockStateStore::new();
        store
            .expect_load()
            .returning(|_| Err(StoreError::LockPoisoned));
        let client = client_with_versions(vec!["v0.0.1"]);

        let driver = ReconcileDriver::new(Arc::new(client), Arc::new(store));
        let err = driver.reconcile_once(&subscription()).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Store(_)));
    }

    #[tokio::test]
    async fn second_pass_with_no_new_version_invokes_no_transfer() {
        let (_temp_dir, store) = test_store();
        let mut client = client_with_versions(vec!["v0.0.1"]);
        client
            .expect_get_component_descriptor()
            .times(1)
            .returning(|_, _, _, version| Ok(descriptor(version)));
        client
            .expect_transfer_component()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let driver = ReconcileDriver::new(Arc::new(client), Arc::clone(&store) as Arc<dyn StateStore>);
        let sub = subscription();

        let first = driver.reconcile_once(&sub).await.unwrap();
        assert!(matches!(
            first.outcome,
            ReplicationOutcome::TransferSucceeded { .. }
        ));

        // The mock's times(1) expectations fail the test if the second pass
        // fetches or transfers again.
        let second = driver.reconcile_once(&sub).await.unwrap();
        assert!(matches!(
            second.outcome,
            ReplicationOutcome::AlreadyUpToDate { .. }
        ));
    }
}
