//! Semver range constraints and best-match selection.

use std::fmt;

use semver::{Version, VersionReq};

use crate::replication::error::ConstraintError;
use crate::replication::version_set::{ComponentVersion, VersionSet};

/// A parsed semver range constraint.
///
/// Comparators may be separated by commas or plain whitespace
/// (`">=1.0.0 <2.0.0"`) and may carry a leading `v`. An empty or unset
/// constraint matches every version.
#[derive(Debug, Clone)]
pub struct Constraint {
    req: VersionReq,
    original: String,
}

impl Constraint {
    /// The constraint that matches everything.
    pub fn match_all() -> Self {
        Self {
            req: VersionReq::STAR,
            original: String::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConstraintError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::match_all());
        }

        let req = VersionReq::parse(&normalize(trimmed)).map_err(|source| {
            ConstraintError::Invalid {
                raw: raw.to_string(),
                source,
            }
        })?;

        Ok(Self {
            req,
            original: trimmed.to_string(),
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    /// Select the newest version in `versions` satisfying the constraint.
    pub fn select_best<'a>(&self, versions: &'a VersionSet) -> Option<&'a ComponentVersion> {
        versions
            .sorted_descending()
            .into_iter()
            .find(|version| self.req.matches(version.parsed()))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.original.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.original)
        }
    }
}

/// Rewrite a constraint into the comma-separated comparator list the semver
/// crate expects, stripping any `v` prefix from each comparator's version.
fn normalize(raw: &str) -> String {
    let comparators: Vec<&str> = if raw.contains(',') {
        raw.split(',').map(str::trim).filter(|c| !c.is_empty()).collect()
    } else {
        raw.split_whitespace().collect()
    };

    comparators
        .iter()
        .map(|comparator| strip_version_prefix(comparator))
        .collect::<Vec<String>>()
        .join(", ")
}

fn strip_version_prefix(comparator: &str) -> String {
    let operator_len = comparator.len()
        - comparator
            .trim_start_matches(['=', '<', '>', '~', '^'])
            .len();
    let (operator, version) = comparator.split_at(operator_len);
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    format!("{operator}{version}")
}
