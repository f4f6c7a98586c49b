//! Mesh session coordination
//!
//! Synchronous core: [`Network`] consumes relay envelopes, capability
//! completions, capture results and timer firings, and reports through
//! an [`EventBus`]. The async runtime in [`crate::runtime`] feeds it.

pub mod admission;
pub mod connection;
pub mod events;
pub mod network;
pub mod registry;
pub mod relay_chain;
pub mod role;
pub mod status;
pub mod timer;

#[cfg(test)]
pub(crate) mod mock;

pub use admission::AdmissionQueue;
pub use connection::Connection;
pub use events::{EventBus, NetworkEvent};
pub use network::{ClientIdentity, ClientInfo, Network};
pub use registry::PeerRegistry;
pub use relay_chain::{ChainUpdate, RelayChain};
pub use role::{assign_role, Participant, RolePolicy};
pub use status::Status;
pub use timer::{Scheduler, TimerId, TimerKind, TimerSet};
