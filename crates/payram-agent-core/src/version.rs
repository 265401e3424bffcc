//! Semantic version parsing and compatibility range matching.
//!
//! Versions are exactly three dot-separated non-negative integers.
//! Comparison is lexicographic on the `(major, minor, patch)` triple. A
//! `max` constraint may end with the literal suffix `.x`, meaning any
//! version whose major equals the specified major and whose minor is at
//! or below the specified minor.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Errors from version parsing and range matching.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VersionError {
    /// The string is not three dot-separated non-negative integers.
    #[error("invalid version {0:?}")]
    Invalid(String),

    /// A max constraint could not be parsed.
    #[error("invalid max {0:?}")]
    InvalidMax(String),
}

/// A parsed `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (major, minor, patch) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(major), Some(minor), Some(patch), None) => (major, minor, patch),
            _ => return Err(VersionError::Invalid(s.to_string())),
        };

        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(VersionError::Invalid(s.to_string()));
            }
            part.parse::<u64>()
                .map_err(|_| VersionError::Invalid(s.to_string()))
        };

        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
            patch: parse(patch)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compares two version strings.
///
/// # Errors
///
/// Returns [`VersionError::Invalid`] when either side fails to parse.
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    let a: Version = a.parse()?;
    let b: Version = b.parse()?;
    Ok(a.cmp(&b))
}

/// Checks `version` against a max constraint, which may end in `.x`.
///
/// `"M.m.x"` matches any version with major `M` and minor at most `m`;
/// otherwise the constraint is a concrete version and the predicate is
/// `version <= max`.
///
/// # Errors
///
/// Returns [`VersionError`] when either side fails to parse.
pub fn matches_max(version: &str, max: &str) -> Result<bool, VersionError> {
    if let Some(prefix) = max.strip_suffix(".x") {
        let bound: Version = format!("{prefix}.0")
            .parse()
            .map_err(|_| VersionError::InvalidMax(max.to_string()))?;
        let v: Version = version.parse()?;

        return Ok(match v.major.cmp(&bound.major) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => v.minor <= bound.minor,
        });
    }

    Ok(compare(version, max)? != Ordering::Greater)
}

/// Evaluates `core_version` against a `min`/`max` range.
///
/// Empty constraints are unconstrained. Returns whether the version is
/// compatible and, when it is not, a human reason. Invalid inputs yield a
/// non-compatible result with a generic reason.
#[must_use]
pub fn is_compatible(core_version: &str, min: &str, max: &str) -> (bool, String) {
    if !min.is_empty() {
        match compare(core_version, min) {
            Err(_) => return (false, "invalid core or min version".to_string()),
            Ok(Ordering::Less) => {
                return (false, format!("Requires payram-core >= {min}"));
            }
            Ok(_) => {}
        }
    }

    if !max.is_empty() {
        match matches_max(core_version, max) {
            Err(_) => return (false, "invalid max version".to_string()),
            Ok(false) => {
                if max.ends_with(".x") {
                    return (false, format!("Requires payram-core {max}"));
                }
                return (false, format!("Requires payram-core <= {max}"));
            }
            Ok(true) => {}
        }
    }

    (true, String::new())
}
