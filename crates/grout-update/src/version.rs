//! Release version parsing and ordering

use crate::UpdateError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Version string reported by builds without a release tag
pub const DEV_VERSION: &str = "dev";

/// `[v]MAJOR[.MINOR[.PATCH]][-PRERELEASE]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl Version {
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let (numbers, prerelease) = match body.split_once('-') {
            Some((numbers, pre)) if !pre.is_empty() => (numbers, Some(pre.to_string())),
            Some(_) => return Err(UpdateError::InvalidVersion(s.to_string())),
            None => (body, None),
        };

        let mut parts = numbers.split('.');
        let mut next = |required: bool| -> Result<u64, UpdateError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| UpdateError::InvalidVersion(s.to_string())),
                None if required => Err(UpdateError::InvalidVersion(s.to_string())),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(UpdateError::InvalidVersion(s.to_string()));
        }

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

/// Order two version strings
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, UpdateError> {
    Ok(a.parse::<Version>()?.cmp(&b.parse::<Version>()?))
}

/// Whether `latest` supersedes `current`. Development builds never update.
pub fn is_newer(current: &str, latest: &str) -> bool {
    if current.trim() == DEV_VERSION {
        return false;
    }
    matches!(compare_versions(current, latest), Ok(Ordering::Less))
}
