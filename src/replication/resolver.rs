//! Latest-version resolution against the component registry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::{AccessContext, ComponentClient, RegistryError};
use crate::replication::constraint::Constraint;
use crate::replication::error::ResolveError;
use crate::replication::version_set::{ComponentVersion, VersionSet};
use crate::subscription::RepositoryLocation;

/// Resolves the newest published version of a component that satisfies a
/// constraint.
///
/// Performs exactly one listing call per invocation and never retries
/// internally; retry cadence belongs to the host scheduler's requeue.
pub struct VersionResolver {
    client: Arc<dyn ComponentClient>,
}

impl VersionResolver {
    pub fn new(client: Arc<dyn ComponentClient>) -> Self {
        Self { client }
    }

    pub async fn resolve_latest(
        &self,
        ctx: &AccessContext,
        source: &RepositoryLocation,
        component: &str,
        constraint: &Constraint,
    ) -> Result<ComponentVersion, ResolveError> {
        let raw = match self.client.list_versions(ctx, source, component).await {
            Ok(raw) => raw,
            // A component that is not published yet is the same steady state
            // as an empty listing.
            Err(RegistryError::NotFound(_)) => {
                return Err(ResolveError::NoVersionsPublished {
                    component: component.to_string(),
                });
            }
            Err(err) => {
                return Err(ResolveError::RegistryUnreachable {
                    component: component.to_string(),
                    source: err,
                });
            }
        };

        if raw.is_empty() {
            return Err(ResolveError::NoVersionsPublished {
                component: component.to_string(),
            });
        }

        let (versions, failures) = VersionSet::from_raw(&raw);
        for (raw_version, err) in &failures {
            warn!(component, version = %raw_version, error = %err, "skipping unparseable version");
        }
        if versions.is_empty() {
            return Err(ResolveError::AllVersionsUnparseable {
                component: component.to_string(),
                count: raw.len(),
            });
        }

        match constraint.select_best(&versions) {
            Some(best) => {
                debug!(component, version = %best, %constraint, "resolved latest matching version");
                Ok(best.clone())
            }
            None => Err(ResolveError::NoConstraintMatch {
                component: component.to_string(),
                constraint: constraint.to_string(),
            }),
        }
    }
}
