//! convoy-provisioner
//!
//! A provisioning control loop: converges a declarative machine
//! inventory held in a machine store with the instances a cloud backend
//! actually runs.
//!
//! The core is [`task::ProvisionerTask`], a single-loop reconciler
//! driven by change notifications. Everything it talks to is a trait:
//! the machine store ([`store::StoreFacade`]), the cloud backend
//! ([`broker::InstanceBroker`]), and the agent-binary catalogue
//! ([`tools::ToolsCatalogue`]). The in-memory store and the dummy cloud
//! backend exercise the loop in tests and in the local daemon.

pub mod broker;
pub mod config;
pub mod constraints;
pub mod dummy;
pub mod environ;
pub mod machine;
pub mod memory;
pub mod registry;
pub mod store;
pub mod task;
pub mod tools;
pub mod watcher;

pub use broker::{Instance, InstanceBroker, NetworkInfo, StartInstanceParams, StartedInstance};
pub use constraints::Constraints;
pub use environ::{environ_channel, EnvironConfig};
pub use machine::{HardwareCharacteristics, Life, MachineRecord, MachineStatus};
pub use memory::MemoryStore;
pub use registry::ProviderRegistry;
pub use store::{StoreError, StoreFacade};
pub use task::{Control, ProvisionerHandle, ProvisionerTask, TaskError, TaskParams};
