//! Process-wide configuration version clock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A configuration version token.
///
/// Versions from the same [`VersionClock`] are totally ordered; a later
/// commit always carries a strictly greater version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Parse a version label as rendered by `Display`.
    pub fn parse_label(label: &str) -> Option<Self> {
        label.parse().ok().map(Self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic version generator.
///
/// Bumped by whoever commits a configuration change. Shared by `Arc`
/// rather than through a global so tests get independent clocks.
#[derive(Debug, Default)]
pub struct VersionClock {
    current: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at a given version.
    pub fn starting_at(version: Version) -> Self {
        Self {
            current: AtomicU64::new(version.0),
        }
    }

    /// Advance the clock and return the new version.
    pub fn bump(&self) -> Version {
        Version(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Current version without advancing.
    pub fn current(&self) -> Version {
        Version(self.current.load(Ordering::Acquire))
    }
}
