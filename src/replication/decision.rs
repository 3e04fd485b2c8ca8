//! The replication decision: whether a resolved candidate moves forward.

use semver::Version;
use tracing::{debug, error};

use crate::replication::version_set::ComponentVersion;
use crate::subscription::SubscriptionState;

/// What a reconciliation pass does with a resolved candidate version.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationAction {
    /// The candidate is not newer than what is already applied.
    SkipUpToDate,
    /// Transfer the candidate. The caller must persist
    /// `last_attempted_version` before starting the transfer.
    Proceed { candidate: ComponentVersion },
}

/// Decide whether `candidate` represents forward progress over the persisted
/// state.
///
/// An unset `last_applied_version` compares as `0.0.0`, so the very first
/// pass always proceeds. The system never downgrades: a candidate older than
/// or equal to the applied version is skipped, including the regressed case
/// where upstream now lists an older version than what is applied.
pub fn decide(candidate: &ComponentVersion, state: &SubscriptionState) -> ReplicationAction {
    let applied = applied_baseline(state);

    if *candidate.parsed() <= applied {
        if *candidate.parsed() < applied {
            debug!(
                candidate = %candidate,
                applied = %applied,
                "candidate is older than the applied version, skipping"
            );
        }
        return ReplicationAction::SkipUpToDate;
    }

    ReplicationAction::Proceed {
        candidate: candidate.clone(),
    }
}

fn applied_baseline(state: &SubscriptionState) -> Version {
    if state.last_applied_version.is_empty() {
        return Version::new(0, 0, 0);
    }

    match ComponentVersion::parse(&state.last_applied_version) {
        Ok(version) => version.parsed().clone(),
        Err(err) => {
            // Persisted state should never hold an unparseable version; fall
            // back to the baseline so replication keeps making progress.
            error!(
                applied = %state.last_applied_version,
                error = %err,
                "persisted applied version is unparseable, treating as 0.0.0"
            );
            Version::new(0, 0, 0)
        }
    }
}
