//! Firmware version parsing and comparison

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Dotted firmware version (`major.minor.patch`).
///
/// Comparison goes through [`FirmwareVersion::encoded`], so "2.10.2" sorts
/// after "2.9.10" no matter how many digits each component has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Fixed-width numeric encoding: `major*1_000_000 + minor*1_000 + patch`
    pub fn encoded(&self) -> u64 {
        self.major as u64 * 1_000_000 + self.minor as u64 * 1_000 + self.patch as u64
    }

    pub fn at_least(&self, minimum: &FirmwareVersion) -> bool {
        self.encoded() >= minimum.encoded()
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encoded().cmp(&other.encoded())
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    /// Accepts "5.12.3", "v5.12", "5.12.3-beta" (suffixes after the digits of
    /// each component are ignored). Missing components default to 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let mut parts = trimmed.split('.');

        fn component(part: Option<&str>) -> Option<u32> {
            let digits: String = part?.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }

        let major = component(parts.next()).ok_or_else(|| format!("invalid version '{s}'"))?;
        let minor = component(parts.next()).unwrap_or(0);
        let patch = component(parts.next()).unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}
