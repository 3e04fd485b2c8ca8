use thiserror::Error;

use crate::client::{AuthError, DescriptorError, RegistryError, SignError, TransferError, VerifyError};
use crate::store::StoreError;
use crate::subscription::SubscriptionId;

#[derive(Debug, Error)]
pub enum VersionParseError {
    #[error("version string is empty")]
    Empty,

    #[error("invalid version '{raw}': {source}")]
    Invalid {
        raw: String,
        #[source]
        source: semver::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("invalid semver constraint '{raw}': {source}")]
    Invalid {
        raw: String,
        #[source]
        source: semver::Error,
    },
}

/// Why version resolution produced no candidate.
///
/// The first three variants are an expected steady state for subscriptions
/// waiting on upstream publication; `RegistryUnreachable` is also retried on
/// the normal interval but surfaced more prominently.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no versions published for component '{component}'")]
    NoVersionsPublished { component: String },

    #[error("all {count} published versions of component '{component}' were unparseable")]
    AllVersionsUnparseable { component: String, count: usize },

    #[error("no version of component '{component}' matched constraint '{constraint}'")]
    NoConstraintMatch {
        component: String,
        constraint: String,
    },

    #[error("registry unreachable while listing versions of component '{component}': {source}")]
    RegistryUnreachable {
        component: String,
        #[source]
        source: RegistryError,
    },
}

/// Typed failure of one reconciliation pass, wrapped with the stage that hit it.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to authenticate subscription '{id}': {source}")]
    Authentication {
        id: SubscriptionId,
        #[source]
        source: AuthError,
    },

    #[error("failed to parse semver constraint: {0}")]
    Constraint(#[source] ConstraintError),

    #[error("failed to fetch component descriptor: {0}")]
    DescriptorFetch(#[source] DescriptorError),

    #[error("failed to verify component signatures: {0}")]
    Verification(#[source] VerifyError),

    #[error("failed to sign destination component: {0}")]
    Signing(#[source] SignError),

    #[error("failed to transfer component: {0}")]
    Transfer(#[source] TransferError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}
