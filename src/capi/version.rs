//! Kubernetes version parsing, ordering and upgrade gating.
//!
//! Versions look like `v1.18.0+vmware.2`: a semantic version followed by an
//! optional vendor build suffix. Ordering is numeric on
//! `(major, minor, patch, build)` so that `+vmware.11` sorts after `+vmware.2`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::error::CuoError;

/// A parsed Kubernetes version with its vendor build number.
#[derive(Debug, Clone)]
pub struct VersionIdentifier {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Vendor build number, `0` when the version carries no suffix.
    pub build: u64,
    vendor: Option<String>,
}

impl VersionIdentifier {
    const fn key(&self) -> (u64, u64, u64, u64) {
        (self.major, self.minor, self.patch, self.build)
    }

    /// Render as a plain `vX.Y.Z` string without the vendor suffix.
    pub fn semver(&self) -> String {
        format!("v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionIdentifier {
    type Err = CuoError;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        let malformed = || CuoError::MalformedVersion(version.to_string());

        let trimmed = version.trim();
        let s = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let (semver_part, suffix) = match s.split_once('+') {
            Some((sem, suffix)) => (sem, Some(suffix)),
            None => (s, None),
        };

        let parts: Vec<&str> = semver_part.split('.').collect();
        if parts.len() != 3 {
            return Err(malformed());
        }
        let major = parts[0].parse::<u64>().map_err(|_| malformed())?;
        let minor = parts[1].parse::<u64>().map_err(|_| malformed())?;
        let patch = parts[2].parse::<u64>().map_err(|_| malformed())?;

        // Suffix format: `<vendor>.<build>[-<anything>]`, e.g. `vmware.1-tkg.1`.
        let (vendor, build) = match suffix {
            Some(suffix) => {
                let (vendor, rest) = suffix.split_once('.').ok_or_else(malformed)?;
                if vendor.is_empty() || !vendor.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(malformed());
                }
                let build = rest
                    .split(['-', '.'])
                    .next()
                    .unwrap_or_default()
                    .parse::<u64>()
                    .map_err(|_| malformed())?;
                (Some(vendor.to_string()), build)
            }
            None => (None, 0),
        };

        Ok(Self {
            major,
            minor,
            patch,
            build,
            vendor,
        })
    }
}

impl fmt::Display for VersionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(vendor) = &self.vendor {
            write!(f, "+{}.{}", vendor, self.build)?;
        }
        Ok(())
    }
}

impl PartialEq for VersionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for VersionIdentifier {}

impl PartialOrd for VersionIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Outcome of comparing the current version against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ProceedUpgrade,
    NoOpSameVersion,
    RejectDowngrade,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProceedUpgrade => write!(f, "ProceedUpgrade"),
            Self::NoOpSameVersion => write!(f, "NoOpSameVersion"),
            Self::RejectDowngrade => write!(f, "RejectDowngrade"),
        }
    }
}

/// Decide whether moving from `current` to `target` is an upgrade.
pub fn compare(current: &VersionIdentifier, target: &VersionIdentifier) -> Decision {
    match current.cmp(target) {
        Ordering::Less => Decision::ProceedUpgrade,
        Ordering::Equal => Decision::NoOpSameVersion,
        Ordering::Greater => Decision::RejectDowngrade,
    }
}

/// Check that Kubernetes supports moving directly between the two versions.
///
/// Major versions must match, at most one minor version may be skipped
/// forward, and the patch level cannot go backwards within a minor.
pub const fn is_upgrade_compatible(current: &VersionIdentifier, target: &VersionIdentifier) -> bool {
    if current.major != target.major {
        return false;
    }
    if target.minor < current.minor || target.minor - current.minor > 1 {
        return false;
    }
    !(target.minor == current.minor && target.patch < current.patch)
}

/// Gate an upgrade request, returning the decision or a typed rejection.
pub fn verify_upgrade(current: &str, target: &str) -> Result<Decision> {
    let current_id: VersionIdentifier = current.parse()?;
    let target_id: VersionIdentifier = target.parse()?;

    let decision = compare(&current_id, &target_id);
    if decision == Decision::RejectDowngrade {
        return Err(CuoError::RejectedDowngrade {
            current: current.to_string(),
            target: target.to_string(),
        }
        .into());
    }

    if !is_upgrade_compatible(&current_id, &target_id) {
        return Err(CuoError::UnsupportedUpgradePath {
            current: current.to_string(),
            target: target.to_string(),
        }
        .into());
    }

    Ok(decision)
}

/// Make a version usable inside an object name (`v1.18.0+vmware.2` -> `v1-18-0-vmware-2`).
pub fn sanitize_for_name(version: &str) -> String {
    version.replace(['.', '+'], "-").to_lowercase()
}

/// Derive the release object name from a distribution version.
pub fn release_name(distribution_version: &str) -> String {
    distribution_version.replace('+', "---")
}
