//! Machine records: the datastore's view of one machine.

use convoy_id::{InstanceId, MachineId, Nonce};
use serde::{Deserialize, Serialize};

use crate::constraints::Constraints;

/// Machine lifecycle. Monotonic: a machine only ever moves
/// `Alive -> Dying -> Dead`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    /// Normal operation.
    Alive,
    /// Destruction requested; cleanup in progress.
    Dying,
    /// Cleanup done; the record lingers until removed by the store.
    Dead,
}

impl Life {
    /// Returns true for `Alive`.
    #[must_use]
    pub fn is_alive(self) -> bool {
        matches!(self, Life::Alive)
    }

    /// Returns true for `Dying` or `Dead`.
    #[must_use]
    pub fn is_dying_or_dead(self) -> bool {
        !self.is_alive()
    }
}

/// Provisioning status of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum MachineStatus {
    /// Waiting for an instance.
    Pending,
    /// Instance running and bound.
    Started,
    /// Provisioning failed.
    Error {
        /// Human-readable failure reason, typically provider text.
        message: String,
        /// Explicitly marked worth retrying. The provisioner trusts this
        /// flag rather than classifying provider error strings itself.
        transient: bool,
    },
}

impl MachineStatus {
    /// Convenience constructor for a non-transient error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        MachineStatus::Error {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if this is an error flagged transient.
    #[must_use]
    pub fn is_transient_error(&self) -> bool {
        matches!(self, MachineStatus::Error { transient: true, .. })
    }
}

/// Hardware actually granted by the broker. May exceed the constraints
/// that were requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCharacteristics {
    /// CPU architecture.
    pub arch: Option<String>,
    /// Memory in MiB.
    pub mem_mb: Option<u64>,
    /// CPU core count.
    pub cpu_cores: Option<u64>,
    /// Root disk in MiB.
    pub root_disk_mb: Option<u64>,
}

/// One machine as held by the machine store.
///
/// The provisioner holds these only as a read-through cache refreshed on
/// each change notification; the store is the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRecord {
    /// Unique hierarchical identifier.
    pub id: MachineId,

    /// Lifecycle state.
    pub life: Life,

    /// Target platform series the machine should run, used to select
    /// tools (e.g. `noble`).
    pub series: String,

    /// Resource preferences.
    pub constraints: Constraints,

    /// Networks the instance must be attached to.
    pub include_networks: Vec<String>,

    /// Networks the instance must not be attached to.
    pub exclude_networks: Vec<String>,

    /// Cloud instance bound to this machine. Write-once: set on
    /// successful provisioning, never overwritten.
    pub instance_id: Option<InstanceId>,

    /// Nonce of the start attempt that produced `instance_id`.
    pub nonce: Option<Nonce>,

    /// Current provisioning status.
    pub status: MachineStatus,

    /// Hardware granted by the broker, recorded alongside the instance.
    pub hardware: Option<HardwareCharacteristics>,
}

impl MachineRecord {
    /// Returns true once an instance id has been committed.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Checks whether this machine was provisioned by the start attempt
    /// carrying `nonce`. A mismatch means the instance is not ours.
    #[must_use]
    pub fn check_provisioned(&self, nonce: &Nonce) -> bool {
        self.is_provisioned() && self.nonce.as_ref() == Some(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn life_ordering_is_monotonic() {
        assert!(Life::Alive < Life::Dying);
        assert!(Life::Dying < Life::Dead);
    }

    #[test]
    fn transient_flag() {
        assert!(!MachineStatus::error("boom").is_transient_error());
        let status = MachineStatus::Error {
            message: "boom".into(),
            transient: true,
        };
        assert!(status.is_transient_error());
        assert!(!MachineStatus::Pending.is_transient_error());
    }

    #[test]
    fn nonce_check_requires_match() {
        let id = MachineId::top_level(1);
        let authority = MachineId::top_level(0);
        let nonce = Nonce::generate(&authority);
        let mut record = MachineRecord {
            id,
            life: Life::Alive,
            series: "noble".into(),
            constraints: Constraints::default(),
            include_networks: vec![],
            exclude_networks: vec![],
            instance_id: None,
            nonce: None,
            status: MachineStatus::Pending,
            hardware: None,
        };
        assert!(!record.check_provisioned(&nonce));

        record.instance_id = Some("i-0".into());
        record.nonce = Some(nonce.clone());
        assert!(record.check_provisioned(&nonce));
        assert!(!record.check_provisioned(&Nonce::generate(&authority)));
    }
}
