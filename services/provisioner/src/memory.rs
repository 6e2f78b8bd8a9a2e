//! In-memory machine store.
//!
//! A fully functional [`StoreFacade`] backend holding the machine
//! inventory in process memory. It backs the local provider and the test
//! suite; a replicated datastore would sit behind the same capability
//! traits in a real deployment.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use convoy_id::{InstanceId, MachineId, Nonce};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::NetworkInfo;
use crate::constraints::Constraints;
use crate::machine::{HardwareCharacteristics, Life, MachineRecord, MachineStatus};
use crate::store::{
    DistributionSource, MachineReader, MachineWatcher, ProvisioningRecorder, StoreError,
};
use crate::watcher::{MachineWatch, WatchBatch, WatchError};

/// A network registered from post-provisioning metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    /// Network name.
    pub name: String,
    /// Provider's identifier for the network.
    pub provider_id: String,
    /// Subnet in CIDR notation.
    pub cidr: String,
    /// VLAN tag, 0 for untagged.
    pub vlan_tag: u32,
}

/// A network interface registered for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    /// Hardware address.
    pub mac_address: String,
    /// Interface name inside the instance.
    pub interface_name: String,
    /// Name of the network the interface is on.
    pub network_name: String,
}

#[derive(Default)]
struct Inner {
    machines: BTreeMap<MachineId, MachineRecord>,
    networks: BTreeMap<String, NetworkRecord>,
    interfaces: BTreeMap<MachineId, Vec<InterfaceRecord>>,
    next_machine: u64,
    container_counters: BTreeMap<(MachineId, String), u64>,
    machine_watchers: Vec<mpsc::UnboundedSender<WatchBatch>>,
    retry_watchers: Vec<mpsc::UnboundedSender<WatchBatch>>,
}

impl Inner {
    fn notify_machines<I: IntoIterator<Item = MachineId>>(&mut self, ids: I) {
        let batch: std::collections::BTreeSet<MachineId> = ids.into_iter().collect();
        self.machine_watchers
            .retain(|tx| tx.send(Ok(batch.clone())).is_ok());
    }

    fn notify_retryable(&mut self, id: &MachineId) {
        let batch: std::collections::BTreeSet<MachineId> = [id.clone()].into_iter().collect();
        self.retry_watchers
            .retain(|tx| tx.send(Ok(batch.clone())).is_ok());
    }

    fn machine_mut(&mut self, id: &MachineId) -> Result<&mut MachineRecord, StoreError> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

/// In-memory machine store with watch fan-out.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new top-level machine in `Pending` state.
    pub fn add_machine(&self, series: &str, constraints: Constraints) -> MachineId {
        self.add_machine_with_networks(series, constraints, vec![], vec![])
    }

    /// Adds a new top-level machine with requested networks.
    pub fn add_machine_with_networks(
        &self,
        series: &str,
        constraints: Constraints,
        include_networks: Vec<String>,
        exclude_networks: Vec<String>,
    ) -> MachineId {
        let mut inner = self.inner.lock().unwrap();
        let id = MachineId::top_level(inner.next_machine);
        inner.next_machine += 1;
        let record = MachineRecord {
            id: id.clone(),
            life: Life::Alive,
            series: series.to_string(),
            constraints,
            include_networks,
            exclude_networks,
            instance_id: None,
            nonce: None,
            status: MachineStatus::Pending,
            hardware: None,
        };
        inner.machines.insert(id.clone(), record);
        inner.notify_machines([id.clone()]);
        id
    }

    /// Adds a container machine on an existing host.
    pub fn add_container(
        &self,
        host: &MachineId,
        container_type: &str,
        series: &str,
        constraints: Constraints,
    ) -> Result<MachineId, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.machines.contains_key(host) {
            return Err(StoreError::NotFound(host.clone()));
        }
        let key = (host.clone(), container_type.to_string());
        let n = inner.container_counters.entry(key).or_insert(0);
        let id = MachineId::container(host, container_type, *n);
        *n += 1;
        let record = MachineRecord {
            id: id.clone(),
            life: Life::Alive,
            series: series.to_string(),
            constraints,
            include_networks: vec![],
            exclude_networks: vec![],
            instance_id: None,
            nonce: None,
            status: MachineStatus::Pending,
            hardware: None,
        };
        inner.machines.insert(id.clone(), record);
        inner.notify_machines([id.clone()]);
        Ok(id)
    }

    /// Requests destruction: `Alive -> Dying`. A machine already dying
    /// or dead is left as is.
    pub fn destroy(&self, id: &MachineId) -> Result<(), StoreError> {
        self.advance_life(id, Life::Dying)
    }

    /// Forces the machine to `Dead`.
    pub fn ensure_dead(&self, id: &MachineId) -> Result<(), StoreError> {
        self.advance_life(id, Life::Dead)
    }

    fn advance_life(&self, id: &MachineId, life: Life) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.machine_mut(id)?;
        if record.life < life {
            record.life = life;
            debug!(machine_id = %id, life = ?life, "machine life advanced");
            inner.notify_machines([id.clone()]);
        }
        Ok(())
    }

    /// Removes a machine record entirely. Cleanup acknowledgement from
    /// whatever destroyed the machine, not the provisioner's concern.
    pub fn remove(&self, id: &MachineId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .machines
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        inner.interfaces.remove(id);
        inner.notify_machines([id.clone()]);
        Ok(())
    }

    /// Operator tooling entry point: flags a failed machine for retry.
    pub fn set_transient_error(
        &self,
        id: &MachineId,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.machine_mut(id)?;
        record.status = MachineStatus::Error {
            message: message.into(),
            transient: true,
        };
        inner.notify_retryable(id);
        Ok(())
    }

    /// Snapshot of one machine, if present.
    #[must_use]
    pub fn machine(&self, id: &MachineId) -> Option<MachineRecord> {
        self.inner.lock().unwrap().machines.get(id).cloned()
    }

    /// Snapshot of every machine record.
    #[must_use]
    pub fn all_machines(&self) -> Vec<MachineRecord> {
        self.inner.lock().unwrap().machines.values().cloned().collect()
    }

    /// A registered network, if present.
    #[must_use]
    pub fn network(&self, name: &str) -> Option<NetworkRecord> {
        self.inner.lock().unwrap().networks.get(name).cloned()
    }

    /// Interfaces registered for a machine.
    #[must_use]
    pub fn network_interfaces(&self, id: &MachineId) -> Vec<InterfaceRecord> {
        self.inner
            .lock()
            .unwrap()
            .interfaces
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulates loss of the watch backend: every subscribed watcher
    /// receives a terminal `Err` item.
    pub fn fail_watchers(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        let err = WatchError(reason.to_string());
        inner
            .machine_watchers
            .retain(|tx| tx.send(Err(err.clone())).is_ok());
        inner
            .retry_watchers
            .retain(|tx| tx.send(Err(err.clone())).is_ok());
    }
}

#[async_trait]
impl MachineReader for MemoryStore {
    async fn get_machine(&self, id: &MachineId) -> Result<MachineRecord, StoreError> {
        self.machine(id).ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

#[async_trait]
impl ProvisioningRecorder for MemoryStore {
    async fn set_provisioned(
        &self,
        id: &MachineId,
        instance_id: InstanceId,
        nonce: Nonce,
        hardware: HardwareCharacteristics,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.machine_mut(id)?;
        if let Some(existing) = &record.instance_id {
            return Err(StoreError::AlreadyProvisioned {
                id: id.clone(),
                instance_id: existing.clone(),
            });
        }
        record.instance_id = Some(instance_id);
        record.nonce = Some(nonce);
        record.hardware = Some(hardware);
        inner.notify_machines([id.clone()]);
        Ok(())
    }

    async fn set_status(&self, id: &MachineId, status: MachineStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.machine_mut(id)?;
        let now_retryable = status.is_transient_error();
        record.status = status;
        if now_retryable {
            inner.notify_retryable(id);
        } else {
            inner.notify_machines([id.clone()]);
        }
        Ok(())
    }

    async fn add_network_interface(
        &self,
        id: &MachineId,
        info: &NetworkInfo,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.machines.contains_key(id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        if parse_cidr(&info.cidr).is_none() {
            return Err(StoreError::InvalidCidr {
                name: info.network_name.clone(),
                cidr: info.cidr.clone(),
            });
        }
        inner
            .networks
            .entry(info.network_name.clone())
            .or_insert_with(|| NetworkRecord {
                name: info.network_name.clone(),
                provider_id: info.provider_id.clone(),
                cidr: info.cidr.clone(),
                vlan_tag: info.vlan_tag,
            });
        inner
            .interfaces
            .entry(id.clone())
            .or_default()
            .push(InterfaceRecord {
                mac_address: info.mac_address.clone(),
                interface_name: info.interface_name.clone(),
                network_name: info.network_name.clone(),
            });
        Ok(())
    }
}

impl MachineWatcher for MemoryStore {
    fn watch_machines(&self) -> MachineWatch {
        let (tx, watch) = MachineWatch::channel();
        let mut inner = self.inner.lock().unwrap();
        // Initial batch: everything currently known, even if empty.
        let all: std::collections::BTreeSet<MachineId> =
            inner.machines.keys().cloned().collect();
        let _ = tx.send(Ok(all));
        inner.machine_watchers.push(tx);
        watch
    }

    fn watch_retryable(&self) -> MachineWatch {
        let (tx, watch) = MachineWatch::channel();
        let mut inner = self.inner.lock().unwrap();
        let retryable: std::collections::BTreeSet<MachineId> = inner
            .machines
            .values()
            .filter(|m| m.status.is_transient_error())
            .map(|m| m.id.clone())
            .collect();
        if !retryable.is_empty() {
            let _ = tx.send(Ok(retryable));
        }
        inner.retry_watchers.push(tx);
        watch
    }
}

#[async_trait]
impl DistributionSource for MemoryStore {
    async fn distribution_group(&self, id: &MachineId) -> Result<Vec<InstanceId>, StoreError> {
        // Spread: avoid every instance already bound to another live
        // machine. A real store would scope this to shared services.
        let inner = self.inner.lock().unwrap();
        if !inner.machines.contains_key(id) {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(inner
            .machines
            .values()
            .filter(|m| &m.id != id && m.life.is_alive())
            .filter_map(|m| m.instance_id.clone())
            .collect())
    }
}

/// Parses `address/prefix-length` CIDR notation.
fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= max).then_some((addr, prefix))
}
