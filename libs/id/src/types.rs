//! Identifier types.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::IdError;

/// A machine identifier.
///
/// Top-level machines are plain numbers (`"0"`, `"42"`). Containers are
/// nested paths that encode the host machine and a container type, for
/// example `"4/lxc/0"`. Nesting may recurse (`"4/lxc/0/kvm/1"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId {
    path: String,
}

impl MachineId {
    /// Creates a top-level machine id from a sequence number.
    #[must_use]
    pub fn top_level(n: u64) -> Self {
        Self {
            path: n.to_string(),
        }
    }

    /// Creates a container id on the given host machine.
    #[must_use]
    pub fn container(host: &MachineId, container_type: &str, n: u64) -> Self {
        Self {
            path: format!("{}/{}/{}", host.path, container_type, n),
        }
    }

    /// Parses a machine id, validating every path segment.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let invalid = || IdError::InvalidMachineId { id: s.to_string() };

        let segments: Vec<&str> = s.split('/').collect();
        // Path shape is number (type number)*, so the count is always odd.
        if segments.len() % 2 == 0 {
            return Err(invalid());
        }
        for (i, segment) in segments.iter().enumerate() {
            let is_number = i % 2 == 0;
            if segment.is_empty() {
                return Err(invalid());
            }
            if is_number {
                if !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
            } else if !segment.bytes().all(|b| b.is_ascii_lowercase()) {
                return Err(invalid());
            }
        }
        Ok(Self {
            path: s.to_string(),
        })
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Returns true if this id names a container rather than a top-level
    /// machine.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.path.contains('/')
    }

    /// Returns the host machine id for a container, or `None` for a
    /// top-level machine.
    #[must_use]
    pub fn parent(&self) -> Option<MachineId> {
        let (host, _) = self.path.rsplit_once('/')?;
        let (host, _) = host.rsplit_once('/')?;
        Some(MachineId {
            path: host.to_string(),
        })
    }

    /// Returns the container type segment, if any (`"lxc"` in `"4/lxc/0"`).
    #[must_use]
    pub fn container_type(&self) -> Option<&str> {
        let (host, _) = self.path.rsplit_once('/')?;
        host.rsplit_once('/').map_or(Some(host), |(_, t)| Some(t))
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl FromStr for MachineId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for MachineId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path)
    }
}

impl<'de> serde::Deserialize<'de> for MachineId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A cloud-assigned instance identifier.
///
/// Opaque to convoy: the broker mints it and convoy only ever compares,
/// stores, and hands it back.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wraps a provider-reported identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(String::deserialize(deserializer)?))
    }
}

/// A one-time token binding a start attempt to the instance it produced.
///
/// Format: `machine-{authority}:{uuid}`, where `authority` is the machine
/// id of the agent that issued the start. An instance carrying a different
/// nonce than the one recorded for its machine is not that machine's
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nonce(String);

impl Nonce {
    /// Generates a fresh nonce on behalf of the given authority.
    #[must_use]
    pub fn generate(authority: &MachineId) -> Self {
        Self(format!("machine-{}:{}", authority, Uuid::new_v4()))
    }

    /// Parses and validates a nonce string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let invalid = || IdError::InvalidNonce {
            nonce: s.to_string(),
        };
        let rest = s.strip_prefix("machine-").ok_or_else(invalid)?;
        let (machine, token) = rest.split_once(':').ok_or_else(invalid)?;
        MachineId::parse(machine).map_err(|_| invalid())?;
        Uuid::parse_str(token).map_err(|_| invalid())?;
        Ok(Self(s.to_string()))
    }

    /// Returns the machine id of the issuing authority.
    #[must_use]
    pub fn authority(&self) -> MachineId {
        // Validated at construction time.
        let rest = self.0.strip_prefix("machine-").unwrap_or(&self.0);
        let machine = rest.split_once(':').map_or(rest, |(m, _)| m);
        MachineId {
            path: machine.to_string(),
        }
    }

    /// Returns the raw nonce string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for Nonce {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Nonce {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0")]
    #[case("42")]
    #[case("4/lxc/0")]
    #[case("4/lxc/0/kvm/1")]
    fn machine_id_roundtrip(#[case] input: &str) {
        let id = MachineId::parse(input).unwrap();
        assert_eq!(id.to_string(), input);
    }

    #[rstest]
    #[case("")]
    #[case("4/lxc")]
    #[case("/lxc/0")]
    #[case("4//0")]
    #[case("4/LXC/0")]
    #[case("abc")]
    fn machine_id_rejects_malformed(#[case] input: &str) {
        assert!(MachineId::parse(input).is_err());
    }

    #[test]
    fn container_parentage() {
        let host = MachineId::top_level(4);
        let container = MachineId::container(&host, "lxc", 0);
        assert_eq!(container.as_str(), "4/lxc/0");
        assert!(container.is_container());
        assert_eq!(container.parent(), Some(host.clone()));
        assert_eq!(container.container_type(), Some("lxc"));

        assert!(!host.is_container());
        assert_eq!(host.parent(), None);
        assert_eq!(host.container_type(), None);

        let nested = MachineId::container(&container, "kvm", 1);
        assert_eq!(nested.parent(), Some(container));
    }

    #[test]
    fn nonce_format_and_authority() {
        let authority = MachineId::top_level(0);
        let nonce = Nonce::generate(&authority);
        assert!(nonce.as_str().starts_with("machine-0:"));
        assert_eq!(nonce.authority(), authority);

        let reparsed = Nonce::parse(nonce.as_str()).unwrap();
        assert_eq!(reparsed, nonce);
    }

    #[test]
    fn nonce_rejects_malformed() {
        assert!(Nonce::parse("machine-0").is_err());
        assert!(Nonce::parse("machine-0:not-a-uuid").is_err());
        assert!(Nonce::parse("0:4fa4f4c8-7a2c-4b0a-9a1d-111111111111").is_err());
    }

    #[test]
    fn instance_id_is_opaque() {
        let id = InstanceId::new("i-00f3e2");
        assert_eq!(id.as_str(), "i-00f3e2");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"i-00f3e2\"");
    }
}
