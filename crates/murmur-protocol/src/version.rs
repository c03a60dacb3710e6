//! Binary layout version.
//!
//! Every binary frame opens with the writer's `major.minor` as two bytes.
//! A reader accepts any minor revision of its own major version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Layout version written by this crate.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Bumped when the header or a body layout changes incompatibly.
    pub major: u8,
    /// Bumped for additions old readers can skip.
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The two header bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        [self.major, self.minor]
    }

    #[must_use]
    pub const fn from_bytes([major, minor]: [u8; 2]) -> Self {
        Self::new(major, minor)
    }

    /// Whether a reader at this version decodes frames written at `writer`.
    #[must_use]
    pub fn can_read(self, writer: Version) -> bool {
        self.major == writer.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format!("expected major.minor, got {s:?}"))?;
        let part = |p: &str| p.parse::<u8>().map_err(|e| format!("bad version {s:?}: {e}"));
        Ok(Self::new(part(major)?, part(minor)?))
    }
}
