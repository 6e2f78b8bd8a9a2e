//! # convoy-id
//!
//! Typed identifiers for the convoy orchestrator.
//!
//! ## Design Principles
//!
//! - Machine ids are hierarchical: a container's id encodes its host
//!   machine (`4/lxc/0` is container 0 of type `lxc` on machine `4`)
//! - Instance ids are opaque cloud-assigned strings; convoy never
//!   interprets them beyond equality
//! - Nonces bind one start attempt to the resulting instance, so a stale
//!   or duplicate start can never be mistaken for the authoritative one
//!
//! ## Id Format
//!
//! Machine ids are `/`-separated paths of `number[/container-type/number]`
//! segments. Nonces are `machine-{authority}:{uuid}`.

mod error;
mod types;

pub use error::IdError;
pub use types::{InstanceId, MachineId, Nonce};
