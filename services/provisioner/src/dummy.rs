//! Dummy cloud backend.
//!
//! An in-process [`InstanceBroker`] used by the local provider and the
//! test suite. One [`DummyCloud`] holds the backend state; opening the
//! environment again (for example after a config change) yields a new
//! broker handle over the same instances, like reconnecting to a real
//! cloud with fresh credentials.
//!
//! Behavior knobs, driven from environment config attributes:
//! - `broken`: whitespace-separated method names that should fail, e.g.
//!   `"StartInstance"`.
//! - `secret`: an opaque string recorded with every start operation, so
//!   tests can tell which config a start was dispatched under.
//!
//! A requested network whose name starts with `bad-` is reported with a
//! malformed CIDR, which trips post-provisioning metadata validation
//! downstream.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy_id::{InstanceId, MachineId, Nonce};
use convoy_retry::AttemptStrategy;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{
    BrokerError, Instance, InstanceBroker, NetworkInfo, StartInstanceParams, StartedInstance,
};
use crate::constraints::Constraints;
use crate::environ::EnvironConfig;
use crate::machine::HardwareCharacteristics;
use crate::registry::{BrokerFactory, RegistryError};

/// Retry used to absorb the simulated eventual-consistency window when
/// stopping an instance that may not be visible yet.
const STOP_ATTEMPT: AttemptStrategy =
    AttemptStrategy::new(Duration::from_millis(100), Duration::from_millis(20));

/// One operation the backend performed, for test synchronization.
#[derive(Debug, Clone)]
pub enum DummyOp {
    /// An instance was started.
    StartInstance {
        /// Machine the start was for.
        machine_id: MachineId,
        /// The instance created.
        instance: Instance,
        /// Constraints passed through.
        constraints: Constraints,
        /// Attempt nonce passed through.
        nonce: Nonce,
        /// The config's `secret` attribute at dispatch time.
        secret: String,
        /// Networks requested.
        include_networks: Vec<String>,
        /// Networks excluded.
        exclude_networks: Vec<String>,
        /// Interfaces reported back.
        networks: Vec<NetworkInfo>,
        /// Anti-affinity avoid-list passed through.
        avoid_instances: Vec<InstanceId>,
    },
    /// A stop was requested for these ids.
    StopInstances {
        /// The ids as requested, whether or not each stop succeeded.
        ids: Vec<InstanceId>,
    },
}

#[derive(Debug, Default)]
struct CloudState {
    instances: BTreeMap<InstanceId, Instance>,
    next_id: u64,
    ops: Option<mpsc::UnboundedSender<DummyOp>>,
}

impl CloudState {
    fn record(&mut self, op: DummyOp) {
        if let Some(tx) = &self.ops {
            if tx.send(op).is_err() {
                self.ops = None;
            }
        }
    }
}

/// The dummy backend's cloud-side state.
#[derive(Clone, Default)]
pub struct DummyCloud {
    state: Arc<Mutex<CloudState>>,
}

impl DummyCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the operation stream. Only one listener at a time;
    /// a later call replaces the earlier listener.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<DummyOp> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().ops = Some(tx);
        rx
    }

    /// Returns a registry factory opening brokers onto this cloud.
    #[must_use]
    pub fn factory(&self) -> BrokerFactory {
        let cloud = self.clone();
        Arc::new(move |config: &EnvironConfig| {
            Ok(Arc::new(cloud.broker(config)) as Arc<dyn InstanceBroker>)
        })
    }

    /// Opens a broker handle with the given config.
    #[must_use]
    pub fn broker(&self, config: &EnvironConfig) -> DummyBroker {
        DummyBroker {
            state: self.state.clone(),
            config: config.clone(),
        }
    }

    /// Starts an instance out of band, with no machine record behind it.
    /// The resulting orphan is what the safe-mode sweep argues about.
    pub fn start_unknown_instance(&self, env_name: &str) -> Instance {
        let mut state = self.state.lock().unwrap();
        let id = InstanceId::new(format!("{}-{}", env_name, state.next_id));
        state.next_id += 1;
        let instance = Instance {
            id: id.clone(),
            status: "running".to_string(),
        };
        state.instances.insert(id, instance.clone());
        instance
    }

    /// Ids of every instance currently running.
    #[must_use]
    pub fn running_instances(&self) -> Vec<InstanceId> {
        self.state.lock().unwrap().instances.keys().cloned().collect()
    }
}

/// Broker handle over a [`DummyCloud`], bound to one config.
#[derive(Debug)]
pub struct DummyBroker {
    state: Arc<Mutex<CloudState>>,
    config: EnvironConfig,
}

impl DummyBroker {
    fn broken(&self, method: &str) -> bool {
        self.config
            .attr_str("broken")
            .is_some_and(|s| s.split_whitespace().any(|m| m == method))
    }
}

#[async_trait]
impl InstanceBroker for DummyBroker {
    async fn start_instance(
        &self,
        params: StartInstanceParams,
    ) -> Result<StartedInstance, BrokerError> {
        if self.broken("StartInstance") {
            return Err(BrokerError::Provider(
                "dummy.StartInstance is broken".to_string(),
            ));
        }

        let cons = &params.constraints;
        let hardware = HardwareCharacteristics {
            arch: cons.arch.clone(),
            mem_mb: cons.mem_mb,
            cpu_cores: cons.cpu_cores,
            root_disk_mb: cons.root_disk_mb,
        };

        let networks: Vec<NetworkInfo> = params
            .include_networks
            .iter()
            .enumerate()
            .map(|(i, name)| NetworkInfo {
                mac_address: format!("aa:bb:cc:dd:ee:f{:x}", i % 16),
                interface_name: format!("eth{i}"),
                provider_id: name.clone(),
                network_name: name.clone(),
                vlan_tag: i as u32,
                cidr: if name.starts_with("bad-") {
                    "invalid".to_string()
                } else {
                    format!("0.{}.2.0/24", i + 1)
                },
            })
            .collect();

        let mut state = self.state.lock().unwrap();
        let id = InstanceId::new(format!("{}-{}", self.config.name, state.next_id));
        state.next_id += 1;
        let instance = Instance {
            id: id.clone(),
            status: "running".to_string(),
        };
        state.instances.insert(id, instance.clone());
        info!(
            machine_id = %params.machine_config.machine_id,
            instance_id = %instance.id,
            "dummy backend started instance"
        );
        state.record(DummyOp::StartInstance {
            machine_id: params.machine_config.machine_id.clone(),
            instance: instance.clone(),
            constraints: params.constraints.clone(),
            nonce: params.machine_config.nonce.clone(),
            secret: self.config.attr_str("secret").unwrap_or("").to_string(),
            include_networks: params.include_networks.clone(),
            exclude_networks: params.exclude_networks.clone(),
            networks: networks.clone(),
            avoid_instances: params.avoid_instances.clone(),
        });
        drop(state);

        Ok(StartedInstance {
            instance,
            hardware,
            networks,
        })
    }

    async fn stop_instances(&self, ids: &[InstanceId]) -> Result<(), BrokerError> {
        let mut first_err = None;
        for id in ids {
            // A just-created instance may not be visible yet; absorb the
            // window with a short bounded retry before reporting it gone.
            let mut attempt = STOP_ATTEMPT.start();
            let mut stopped = false;
            while attempt.next_async().await {
                if self.state.lock().unwrap().instances.remove(id).is_some() {
                    stopped = true;
                    break;
                }
            }
            if stopped {
                debug!(instance_id = %id, "dummy backend stopped instance");
            } else if first_err.is_none() {
                first_err = Some(BrokerError::NotFound(id.clone()));
            }
        }
        self.state
            .lock()
            .unwrap()
            .record(DummyOp::StopInstances { ids: ids.to_vec() });
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn all_instances(&self) -> Result<Vec<Instance>, BrokerError> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MachineConfig;
    use crate::tools::Tools;

    fn params(machine: u64, include: Vec<String>) -> StartInstanceParams {
        let machine_id = MachineId::top_level(machine);
        let authority = MachineId::top_level(0);
        StartInstanceParams {
            constraints: "arch=amd64 mem=4G cpu-cores=1 root-disk=8G".parse().unwrap(),
            tools: vec![Tools {
                version: "2.1.0".into(),
                series: "noble".into(),
                arch: "amd64".into(),
                url: "https://tools.test/t.tgz".into(),
            }],
            machine_config: MachineConfig {
                machine_id: machine_id.clone(),
                nonce: Nonce::generate(&authority),
                tools: Tools {
                    version: "2.1.0".into(),
                    series: "noble".into(),
                    arch: "amd64".into(),
                    url: "https://tools.test/t.tgz".into(),
                },
            },
            include_networks: include,
            exclude_networks: vec![],
            avoid_instances: vec![],
        }
    }

    #[tokio::test]
    async fn start_grants_requested_hardware() {
        let cloud = DummyCloud::new();
        let broker = cloud.broker(&EnvironConfig::new("dummyenv", "dummy"));
        let started = broker.start_instance(params(1, vec![])).await.unwrap();
        assert_eq!(started.instance.id, InstanceId::new("dummyenv-0"));
        assert_eq!(started.hardware.arch.as_deref(), Some("amd64"));
        assert_eq!(started.hardware.mem_mb, Some(4096));
        assert_eq!(started.hardware.cpu_cores, Some(1));
        assert_eq!(started.hardware.root_disk_mb, Some(8192));
        assert_eq!(cloud.running_instances().len(), 1);
    }

    #[tokio::test]
    async fn broken_config_fails_starts() {
        let cloud = DummyCloud::new();
        let config = EnvironConfig::new("dummyenv", "dummy").with_attr("broken", "StartInstance");
        let broker = cloud.broker(&config);
        let err = broker.start_instance(params(1, vec![])).await.unwrap_err();
        assert_eq!(err.to_string(), "dummy.StartInstance is broken");
        assert!(cloud.running_instances().is_empty());
    }

    #[tokio::test]
    async fn bad_network_prefix_yields_invalid_cidr() {
        let cloud = DummyCloud::new();
        let broker = cloud.broker(&EnvironConfig::new("dummyenv", "dummy"));
        let started = broker
            .start_instance(params(1, vec!["net1".into(), "bad-net2".into()]))
            .await
            .unwrap();
        assert_eq!(started.networks[0].cidr, "0.1.2.0/24");
        assert_eq!(started.networks[1].cidr, "invalid");
        assert_eq!(started.networks[1].interface_name, "eth1");
    }

    #[tokio::test]
    async fn stop_attempts_every_id() {
        let cloud = DummyCloud::new();
        let broker = cloud.broker(&EnvironConfig::new("dummyenv", "dummy"));
        let a = broker.start_instance(params(1, vec![])).await.unwrap().instance;
        let b = broker.start_instance(params(2, vec![])).await.unwrap().instance;

        let missing = InstanceId::new("dummyenv-404");
        let err = broker
            .stop_instances(&[a.id.clone(), missing.clone(), b.id.clone()])
            .await
            .unwrap_err();
        // First error reported, but both real instances were stopped.
        assert_eq!(err, BrokerError::NotFound(missing));
        assert!(cloud.running_instances().is_empty());
    }
}
