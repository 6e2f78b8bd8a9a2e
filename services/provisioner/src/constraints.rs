//! Machine constraints: abstract resource and architecture preferences.
//!
//! Constraints travel with a machine record from the operator who added
//! the machine all the way to the broker, which treats them as a floor:
//! the hardware actually granted may exceed them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from parsing a constraints string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintsError {
    /// A token was not `name=value`.
    #[error("malformed constraint {0:?}")]
    Malformed(String),

    /// The constraint name is not recognized.
    #[error("unknown constraint {0:?}")]
    Unknown(String),

    /// A numeric or sized value could not be parsed.
    #[error("bad value for constraint {name}: {value:?}")]
    BadValue {
        /// Constraint name.
        name: String,
        /// The unparseable value.
        value: String,
    },
}

/// Resource and architecture preferences for a machine.
///
/// All fields are optional; an unset field means "no preference". Sizes
/// are mebibytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// CPU architecture, e.g. `amd64`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,

    /// Minimum memory in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,

    /// Minimum CPU core count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u64>,

    /// Minimum root disk in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_disk_mb: Option<u64>,
}

impl Constraints {
    /// Returns true if no preference is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arch.is_none()
            && self.mem_mb.is_none()
            && self.cpu_cores.is_none()
            && self.root_disk_mb.is_none()
    }
}

impl FromStr for Constraints {
    type Err = ConstraintsError;

    /// Parses the operator-facing form, e.g.
    /// `arch=amd64 mem=4G cpu-cores=1 root-disk=8G`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cons = Constraints::default();
        for token in s.split_whitespace() {
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| ConstraintsError::Malformed(token.to_string()))?;
            let bad = || ConstraintsError::BadValue {
                name: name.to_string(),
                value: value.to_string(),
            };
            match name {
                "arch" => cons.arch = Some(value.to_string()),
                "mem" => cons.mem_mb = Some(parse_size_mb(value).ok_or_else(bad)?),
                "root-disk" => cons.root_disk_mb = Some(parse_size_mb(value).ok_or_else(bad)?),
                "cpu-cores" => cons.cpu_cores = Some(value.parse().map_err(|_| bad())?),
                _ => return Err(ConstraintsError::Unknown(name.to_string())),
            }
        }
        Ok(cons)
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(arch) = &self.arch {
            parts.push(format!("arch={arch}"));
        }
        if let Some(mem) = self.mem_mb {
            parts.push(format!("mem={mem}M"));
        }
        if let Some(cores) = self.cpu_cores {
            parts.push(format!("cpu-cores={cores}"));
        }
        if let Some(disk) = self.root_disk_mb {
            parts.push(format!("root-disk={disk}M"));
        }
        f.write_str(&parts.join(" "))
    }
}

/// Parses a size with an optional M/G/T suffix into MiB. A bare number
/// means MiB.
fn parse_size_mb(value: &str) -> Option<u64> {
    let (digits, multiplier) = match value.as_bytes().last()? {
        b'M' => (&value[..value.len() - 1], 1),
        b'G' => (&value[..value.len() - 1], 1024),
        b'T' => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    // Fractional sizes like 1.5G round up to a whole MiB.
    if let Ok(n) = digits.parse::<u64>() {
        return n.checked_mul(multiplier);
    }
    let f = digits.parse::<f64>().ok()?;
    if !f.is_finite() || f < 0.0 {
        return None;
    }
    Some((f * multiplier as f64).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_full_constraint_string() {
        let cons: Constraints = "arch=amd64 mem=4G cpu-cores=1 root-disk=8G".parse().unwrap();
        assert_eq!(cons.arch.as_deref(), Some("amd64"));
        assert_eq!(cons.mem_mb, Some(4096));
        assert_eq!(cons.cpu_cores, Some(1));
        assert_eq!(cons.root_disk_mb, Some(8192));
    }

    #[rstest]
    #[case("512M", 512)]
    #[case("512", 512)]
    #[case("2G", 2048)]
    #[case("1T", 1024 * 1024)]
    #[case("1.5G", 1536)]
    fn size_suffixes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_size_mb(input), Some(expected));
    }

    #[rstest]
    #[case("mem")]
    #[case("mem=fast")]
    #[case("cpu-cores=one")]
    #[case("colour=blue")]
    fn rejects_malformed(#[case] input: &str) {
        assert!(input.parse::<Constraints>().is_err());
    }

    #[test]
    fn empty_and_display() {
        assert!(Constraints::default().is_empty());
        let cons: Constraints = "arch=amd64 mem=2G".parse().unwrap();
        assert!(!cons.is_empty());
        assert_eq!(cons.to_string(), "arch=amd64 mem=2048M");
    }
}
