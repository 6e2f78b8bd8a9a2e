//! Instance broker: the pluggable adapter to one cloud backend.
//!
//! The provisioner depends only on this interface. Authentication,
//! endpoints, and SDK glue are entirely the broker's concern.

use async_trait::async_trait;
use convoy_id::{InstanceId, MachineId, Nonce};
use thiserror::Error;

use crate::constraints::Constraints;
use crate::machine::HardwareCharacteristics;
use crate::tools::{Tools, ToolsList};

/// A cloud instance as reported by the broker. Opaque beyond id and
/// provider status text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Cloud-assigned identifier.
    pub id: InstanceId,
    /// Provider-reported state string, e.g. `running`.
    pub status: String,
}

/// Network interface metadata reported after a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Hardware address of the interface.
    pub mac_address: String,
    /// Interface name inside the instance, e.g. `eth0`.
    pub interface_name: String,
    /// Provider's identifier for the network.
    pub provider_id: String,
    /// Network name as requested by the machine record.
    pub network_name: String,
    /// VLAN tag, 0 for untagged.
    pub vlan_tag: u32,
    /// Subnet in CIDR notation.
    pub cidr: String,
}

/// Boot configuration for a new instance: the cloud-init equivalent.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Machine the instance is started for.
    pub machine_id: MachineId,
    /// Nonce binding this start attempt to the resulting instance. Must
    /// be unique per attempt within an environment.
    pub nonce: Nonce,
    /// Agent build the instance should boot with.
    pub tools: Tools,
}

/// Parameters for [`InstanceBroker::start_instance`].
#[derive(Debug, Clone)]
pub struct StartInstanceParams {
    /// Constraints on the kind of instance to create.
    pub constraints: Constraints,

    /// Candidate agent builds for the machine.
    pub tools: ToolsList,

    /// Boot configuration, including the attempt nonce.
    pub machine_config: MachineConfig,

    /// Networks the instance must be attached to.
    pub include_networks: Vec<String>,

    /// Networks the instance must not be attached to.
    pub exclude_networks: Vec<String>,

    /// Instances the new one should avoid sharing a host with
    /// (distribution group). Best-effort anti-affinity hint.
    pub avoid_instances: Vec<InstanceId>,
}

/// Result of a successful start.
#[derive(Debug, Clone)]
pub struct StartedInstance {
    /// The new instance.
    pub instance: Instance,
    /// Hardware actually granted.
    pub hardware: HardwareCharacteristics,
    /// Interfaces attached, one per requested network.
    pub networks: Vec<NetworkInfo>,
}

/// Errors from broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Provider-reported failure, carried verbatim.
    #[error("{0}")]
    Provider(String),

    /// The backend has no instance with this id.
    #[error("instance {0} not found")]
    NotFound(InstanceId),
}

/// Instance lifecycle operations against one cloud backend.
#[async_trait]
pub trait InstanceBroker: std::fmt::Debug + Send + Sync {
    /// Creates one instance. Called at most once per machine per attempt;
    /// the caller guarantees no two concurrent calls for the same
    /// machine id.
    async fn start_instance(
        &self,
        params: StartInstanceParams,
    ) -> Result<StartedInstance, BrokerError>;

    /// Shuts down the given instances. Best-effort: every id is
    /// attempted even if one fails, and the first error encountered is
    /// returned afterwards.
    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), BrokerError>;

    /// Returns every instance currently visible to the backend, without
    /// pagination gaps. Consumed by the orphan sweep.
    async fn all_instances(&self) -> Result<Vec<Instance>, BrokerError>;
}
