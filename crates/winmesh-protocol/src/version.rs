//! Wire format versioning.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version stamped on every broadcast frame.
///
/// Peers built from different releases can share a channel as long as their
/// major versions agree; minor bumps only add optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| VersionError::InvalidFormat(s.to_string()))?;

        let major = major
            .parse::<u16>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;
        let minor = minor
            .parse::<u16>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;

        Ok(Self { major, minor })
    }

    /// Major versions must match; any minor version is accepted.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Checks a received version against [`ProtocolVersion::CURRENT`].
    pub fn ensure_compatible(&self) -> Result<(), VersionError> {
        if self.is_compatible_with(&Self::CURRENT) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: self.to_string(),
                expected: Self::CURRENT.to_string(),
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = ProtocolVersion::parse("1.3").unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 3));
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(ProtocolVersion::parse("1").is_err());
        assert!(ProtocolVersion::parse("1.0.0").is_err());
        assert!(ProtocolVersion::parse("one.two").is_err());
    }

    #[test]
    fn test_ensure_compatible() {
        assert!(ProtocolVersion::new(1, 7).ensure_compatible().is_ok());

        let err = ProtocolVersion::new(2, 0).ensure_compatible().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Incompatible version: got 2.0, expected 1.0"
        );
    }
}
