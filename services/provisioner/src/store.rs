//! Machine store capabilities consumed by the provisioner.
//!
//! The store is an external collaborator; the provisioner depends on a
//! handful of narrow capability traits and composes them through
//! [`StoreFacade`], a facade holding a named reference to each
//! capability implementation.

use std::sync::Arc;

use async_trait::async_trait;
use convoy_id::{InstanceId, MachineId, Nonce};
use thiserror::Error;

use crate::broker::NetworkInfo;
use crate::machine::{HardwareCharacteristics, MachineRecord, MachineStatus};
use crate::watcher::MachineWatch;

/// Errors from machine store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No machine with this id exists (any more).
    #[error("machine {0} not found")]
    NotFound(MachineId),

    /// `set_provisioned` was called for an already provisioned machine.
    /// The original binding is left intact.
    #[error("machine {id} already provisioned as {instance_id}")]
    AlreadyProvisioned {
        /// The machine.
        id: MachineId,
        /// The instance it is already bound to.
        instance_id: InstanceId,
    },

    /// A network descriptor carried a malformed CIDR.
    #[error("cannot add network {name:?}: invalid CIDR address: {cidr}")]
    InvalidCidr {
        /// Network name from the descriptor.
        name: String,
        /// The unparseable CIDR text.
        cidr: String,
    },

    /// An attempted life transition would move backwards.
    #[error("life of machine {0} cannot regress")]
    LifeRegression(MachineId),
}

/// Read access to machine records.
#[async_trait]
pub trait MachineReader: Send + Sync {
    /// Fetches the current record for one machine.
    async fn get_machine(&self, id: &MachineId) -> Result<MachineRecord, StoreError>;
}

/// Write access for provisioning outcomes.
#[async_trait]
pub trait ProvisioningRecorder: Send + Sync {
    /// Commits the instance binding for a machine. Write-once: fails
    /// with [`StoreError::AlreadyProvisioned`] if an instance id is
    /// already set, leaving the original untouched.
    async fn set_provisioned(
        &self,
        id: &MachineId,
        instance_id: InstanceId,
        nonce: Nonce,
        hardware: HardwareCharacteristics,
    ) -> Result<(), StoreError>;

    /// Updates a machine's provisioning status. The transient marker
    /// rides inside [`MachineStatus::Error`].
    async fn set_status(&self, id: &MachineId, status: MachineStatus) -> Result<(), StoreError>;

    /// Registers post-provisioning network interface metadata. Validates
    /// the descriptor; a malformed CIDR fails the whole call.
    async fn add_network_interface(
        &self,
        id: &MachineId,
        info: &NetworkInfo,
    ) -> Result<(), StoreError>;
}

/// Watch streams over the machine collection.
pub trait MachineWatcher: Send + Sync {
    /// Watch for machines whose life or provisioning-relevant state
    /// changed. The first batch holds every machine currently known.
    fn watch_machines(&self) -> MachineWatch;

    /// Watch for machines newly flagged with a transient error.
    fn watch_retryable(&self) -> MachineWatch;
}

/// Anti-affinity data for placement hints.
#[async_trait]
pub trait DistributionSource: Send + Sync {
    /// Instance ids already colocated with services the machine will
    /// run, which the broker should avoid placing it next to.
    async fn distribution_group(&self, id: &MachineId) -> Result<Vec<InstanceId>, StoreError>;
}

/// Explicit composition of the store capabilities the provisioner uses.
///
/// Each capability is a named field; dispatch is by method, and any
/// field may point at a different implementation.
#[derive(Clone)]
pub struct StoreFacade {
    /// Record reads.
    pub machines: Arc<dyn MachineReader>,
    /// Provisioning writes.
    pub recorder: Arc<dyn ProvisioningRecorder>,
    /// Change notification streams.
    pub watches: Arc<dyn MachineWatcher>,
    /// Placement hints.
    pub groups: Arc<dyn DistributionSource>,
}

impl StoreFacade {
    /// Builds a facade where one object provides every capability.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: MachineReader + ProvisioningRecorder + MachineWatcher + DistributionSource + 'static,
    {
        Self {
            machines: store.clone(),
            recorder: store.clone(),
            watches: store.clone(),
            groups: store,
        }
    }

    /// See [`MachineReader::get_machine`].
    pub async fn get_machine(&self, id: &MachineId) -> Result<MachineRecord, StoreError> {
        self.machines.get_machine(id).await
    }

    /// See [`ProvisioningRecorder::set_provisioned`].
    pub async fn set_provisioned(
        &self,
        id: &MachineId,
        instance_id: InstanceId,
        nonce: Nonce,
        hardware: HardwareCharacteristics,
    ) -> Result<(), StoreError> {
        self.recorder
            .set_provisioned(id, instance_id, nonce, hardware)
            .await
    }

    /// See [`ProvisioningRecorder::set_status`].
    pub async fn set_status(
        &self,
        id: &MachineId,
        status: MachineStatus,
    ) -> Result<(), StoreError> {
        self.recorder.set_status(id, status).await
    }

    /// See [`ProvisioningRecorder::add_network_interface`].
    pub async fn add_network_interface(
        &self,
        id: &MachineId,
        info: &NetworkInfo,
    ) -> Result<(), StoreError> {
        self.recorder.add_network_interface(id, info).await
    }

    /// See [`DistributionSource::distribution_group`].
    pub async fn distribution_group(
        &self,
        id: &MachineId,
    ) -> Result<Vec<InstanceId>, StoreError> {
        self.groups.distribution_group(id).await
    }
}
