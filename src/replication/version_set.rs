//! Component version parsing and the ordered, deduplicated version set.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;
use semver::Version;

use crate::replication::error::VersionParseError;

/// A parsed component version.
///
/// Keeps the original string (which may carry a leading `v`) for display and
/// storage round-tripping; ordering and equality use only the normalized
/// semver value. Versions differing solely in build metadata compare by
/// semver precedence first, with the metadata as a deterministic tie-break.
#[derive(Debug, Clone, Eq)]
pub struct ComponentVersion {
    original: String,
    parsed: Version,
}

impl ComponentVersion {
    /// Parse a raw version string.
    ///
    /// Accepts an optional leading `v` and pads partial versions ("1", "1.2")
    /// with zeros. Empty strings and non-numeric segments are rejected.
    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parsed =
            Version::parse(&pad_partial(bare)).map_err(|source| VersionParseError::Invalid {
                raw: raw.to_string(),
                source,
            })?;

        Ok(Self {
            original: trimmed.to_string(),
            parsed,
        })
    }

    /// The version string as published upstream.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// The normalized semver value.
    pub fn parsed(&self) -> &Version {
        &self.parsed
    }
}

impl fmt::Display for ComponentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialEq for ComponentVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl PartialOrd for ComponentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComponentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

/// Pad "1" and "1.2" out to a full triple. Versions carrying pre-release or
/// build metadata are left untouched.
fn pad_partial(bare: &str) -> Cow<'_, str> {
    if bare.contains('-') || bare.contains('+') {
        return Cow::Borrowed(bare);
    }
    match bare.split('.').count() {
        1 => Cow::Owned(format!("{bare}.0.0")),
        2 => Cow::Owned(format!("{bare}.0")),
        _ => Cow::Borrowed(bare),
    }
}

/// The parseable versions of a component, deduplicated by normalized value.
///
/// Built fresh on every reconciliation pass and discarded once a decision is
/// made. Insertion order carries no meaning; callers select a "latest" through
/// [`VersionSet::sorted_descending`].
#[derive(Debug, Clone, Default)]
pub struct VersionSet {
    entries: IndexMap<Version, ComponentVersion>,
}

impl VersionSet {
    /// Build a set from raw version strings.
    ///
    /// Unparseable strings never abort the build; they are returned alongside
    /// the set so the caller can report them. Duplicates (by normalized value)
    /// collapse to the first-seen original string.
    pub fn from_raw(raw: &[String]) -> (Self, Vec<(String, VersionParseError)>) {
        let mut entries = IndexMap::new();
        let mut failures = Vec::new();

        for candidate in raw {
            match ComponentVersion::parse(candidate) {
                Ok(version) => {
                    entries
                        .entry(version.parsed().clone())
                        .or_insert(version);
                }
                Err(err) => failures.push((candidate.clone(), err)),
            }
        }

        (Self { entries }, failures)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentVersion> {
        self.entries.values()
    }

    /// Versions ordered newest first.
    pub fn sorted_descending(&self) -> Vec<&ComponentVersion> {
        let mut versions: Vec<&ComponentVersion> = self.entries.values().collect();
        versions.sort_by(|a, b| b.cmp(a));
        versions
    }
}
