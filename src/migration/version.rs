//! Migration versions.
//!
//! Registry migrations are versioned with semantic versions (`1.2.0`);
//! manifest migrations with zero-padded sequence numbers (`V001`). Both live
//! in one [`MigrationVersion`] so the engine orders and compares them the same
//! way regardless of where a migration was loaded from.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub enum MigrationVersion {
    /// `1.2.0`
    Semantic(semver::Version),
    /// `V001`; `width` is the zero-padded digit count, kept for display
    Sequence { number: u64, width: usize },
}

/// A version string that is neither semver nor `V<digits>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError {
    pub input: String,
    pub reason: String,
}

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid migration version '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for VersionParseError {}

impl MigrationVersion {
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let trimmed = input.trim();
        if let Some(digits) = trimmed.strip_prefix('V') {
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionParseError {
                    input: input.to_string(),
                    reason: "expected digits after 'V'".to_string(),
                });
            }
            let number = digits.parse::<u64>().map_err(|e| VersionParseError {
                input: input.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(MigrationVersion::Sequence {
                number,
                width: digits.len(),
            });
        }
        Self::parse_semantic(trimmed)
    }

    /// Parse a semantic version only; `V001` style input is rejected.
    pub fn parse_semantic(input: &str) -> Result<Self, VersionParseError> {
        semver::Version::parse(input.trim())
            .map(MigrationVersion::Semantic)
            .map_err(|e| VersionParseError {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// `V<number>` padded to three digits, the manifest default.
    pub fn sequence(number: u64) -> Self {
        MigrationVersion::Sequence { number, width: 3 }
    }

    pub fn as_semver(&self) -> Option<&semver::Version> {
        match self {
            MigrationVersion::Semantic(v) => Some(v),
            MigrationVersion::Sequence { .. } => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MigrationVersion::Sequence { .. } => 0,
            MigrationVersion::Semantic(_) => 1,
        }
    }
}

/// Parse a runtime/application version, tolerating a leading `v`.
pub fn parse_runtime_version(input: &str) -> Result<semver::Version, VersionParseError> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    semver::Version::parse(bare).map_err(|e| VersionParseError {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationVersion::Semantic(v) => write!(f, "{v}"),
            MigrationVersion::Sequence { number, width } => write!(f, "V{number:0width$}"),
        }
    }
}

impl FromStr for MigrationVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Ord for MigrationVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (MigrationVersion::Semantic(a), MigrationVersion::Semantic(b)) => a.cmp(b),
            (
                MigrationVersion::Sequence { number: a, width: wa },
                MigrationVersion::Sequence { number: b, width: wb },
            ) => a.cmp(b).then(wa.cmp(wb)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for MigrationVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MigrationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MigrationVersion {}

impl Hash for MigrationVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            MigrationVersion::Semantic(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            MigrationVersion::Sequence { number, width } => {
                1u8.hash(state);
                number.hash(state);
                width.hash(state);
            }
        }
    }
}

impl Serialize for MigrationVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MigrationVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MigrationVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> MigrationVersion {
        MigrationVersion::parse(s).unwrap()
    }

    #[test]
    fn test_semver_ordering_is_numeric() {
        assert!(v("1.2.0") < v("1.10.0"));
        assert!(v("1.0.0") < v("1.0.1"));
        assert!(v("2.0.0-rc.1") < v("2.0.0"));
    }

    #[test]
    fn test_sequence_round_trips_padding() {
        assert_eq!(v("V001").to_string(), "V001");
        assert_eq!(v("V12").to_string(), "V12");
        assert!(v("V002") < v("V010"));
        assert_eq!(MigrationVersion::sequence(7).to_string(), "V007");
    }

    #[test]
    fn test_sequences_sort_before_semvers() {
        assert!(v("V999") < v("0.0.1"));
    }

    #[test]
    fn test_rejects_malformed_versions() {
        assert!(MigrationVersion::parse("V").is_err());
        assert!(MigrationVersion::parse("V1a").is_err());
        assert!(MigrationVersion::parse("1.0").is_err());
        assert!(MigrationVersion::parse_semantic("V001").is_err());
    }

    #[test]
    fn test_runtime_version_accepts_v_prefix() {
        assert_eq!(parse_runtime_version("v1.4.2").unwrap(), semver::Version::new(1, 4, 2));
        assert!(parse_runtime_version("latest").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("V003")).unwrap();
        assert_eq!(json, "\"V003\"");
        let back: MigrationVersion = serde_json::from_str("\"1.1.0\"").unwrap();
        assert_eq!(back, v("1.1.0"));
    }
}
