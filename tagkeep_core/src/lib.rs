//! Shared value types for the tagkeep registry proxy.
//!
//! The proxy, the usage index and the cleaner all speak in terms of
//! [`TagEntry`]: one tag in the upstream registry together with the last
//! time a client pulled or pushed it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single tag in the upstream registry and its last observed access time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Repository path, may contain `/` (e.g. `library/alpine`).
    pub repo: String,
    /// Tag token within the repository.
    pub tag: String,
    pub access_time: DateTime<Utc>,
}

impl TagEntry {
    pub fn new(repo: impl Into<String>, tag: impl Into<String>, access_time: DateTime<Utc>) -> Self {
        Self {
            repo: repo.into(),
            tag: tag.into(),
            access_time,
        }
    }

    /// Display form `repo:tag`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }

    /// Rebuilds an entry from its `repo:tag` display form.
    ///
    /// Splits on the *first* `:` so multi-segment repos survive the round
    /// trip. Returns `None` when either side would be empty.
    pub fn from_name(name: &str, access_time: DateTime<Utc>) -> Option<Self> {
        let (repo, tag) = name.split_once(':')?;
        if repo.is_empty() || tag.is_empty() {
            return None;
        }
        Some(Self::new(repo, tag, access_time))
    }

    /// Canonical form `<registry_host>/repo:tag` used for registry
    /// operations. A `scheme://` prefix on the host is dropped.
    pub fn canonical_name(&self, registry_host: &str) -> String {
        let host = match registry_host.split_once("://") {
            Some((_, rest)) => rest,
            None => registry_host,
        };
        format!("{}/{}", host, self.name())
    }
}

impl std::fmt::Display for TagEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repo, self.tag)
    }
}

/// Serializes an access time for use as an ordered index key.
///
/// Fixed zone (UTC) and fixed-width nanosecond precision keep the
/// lexicographic order of the produced strings identical to chronological
/// order, and make two observations landing in the same second distinct
/// keys.
pub fn encode_access_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

/// Parses an access-time key. Accepts any RFC-3339 text, so keys written
/// with plain second precision still load.
pub fn decode_access_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ByteSizeError {
    #[error("no valid suffix, must be Gi, Mi or Ki")]
    MissingSuffix,
    #[error("invalid size value: {0}")]
    BadValue(#[from] std::num::ParseIntError),
}

/// Decodes a byte-count string with a binary suffix: `Ki`, `Mi` or `Gi`.
pub fn parse_byte_string(s: &str) -> Result<u64, ByteSizeError> {
    let (raw, unit) = if let Some(raw) = s.strip_suffix("Gi") {
        (raw, GIB)
    } else if let Some(raw) = s.strip_suffix("Mi") {
        (raw, MIB)
    } else if let Some(raw) = s.strip_suffix("Ki") {
        (raw, KIB)
    } else {
        return Err(ByteSizeError::MissingSuffix);
    };
    Ok(raw.trim().parse::<u64>()? * unit)
}
