//! Numeric version handling for the spotifyd binary.
//!
//! Versions are compared component-wise as (major, minor, patch).  String
//! comparison is wrong here ("0.10.0" must sort above "0.9.0"), so `Version`
//! derives `Ord` on the numeric tuple.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('v');
        let mut parts = s.splitn(3, '.');
        let mut next = |name: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {name} in version '{s}'"))?
                // Tolerate trailing junk like "0.4.1-5-gdeadbeef".
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| format!("non-numeric {name} in version '{s}'"))?
                .parse::<u32>()
                .map_err(|e| format!("bad {name} in version '{s}': {e}"))
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch").unwrap_or(0),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Pull a version out of `spotifyd --version` output, e.g. "spotifyd 0.3.5".
pub fn parse_version_output(output: &str) -> Option<Version> {
    output
        .split_whitespace()
        .find_map(|token| Version::from_str(token).ok())
}

/// Numeric check that `found` satisfies `minimum`.  Malformed input is
/// treated as invalid rather than an error; the caller only needs a verdict.
pub fn is_version_valid(found: &str, minimum: &str) -> bool {
    match (Version::from_str(found), Version::from_str(minimum)) {
        (Ok(f), Ok(m)) => f >= m,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_numerically_not_lexicographically() {
        assert!(!is_version_valid("0.3.9", "0.4.0"));
        assert!(is_version_valid("0.4.0", "0.4.0"));
        assert!(is_version_valid("1.0.0", "0.4.0"));
        assert!(is_version_valid("0.10.0", "0.9.0"));
    }

    #[test]
    fn parses_tool_output() {
        assert_eq!(
            parse_version_output("spotifyd 0.3.5"),
            Some(Version::new(0, 3, 5))
        );
        assert_eq!(
            parse_version_output("spotifyd v0.4.1-5-gdeadbeef\n"),
            Some(Version::new(0, 4, 1))
        );
        assert_eq!(parse_version_output("no numbers here"), None);
    }

    #[test]
    fn malformed_input_is_invalid() {
        assert!(!is_version_valid("garbage", "0.4.0"));
        assert!(!is_version_valid("0.4.0", "garbage"));
    }
}
