//! # echomesh-node
//!
//! The node runtime: everything that sits between the ingress, the store,
//! and the transport.
//!
//! - [`vault`] — the device identity: creation, sealing, onion binding.
//! - [`contacts`] — the contact manager service and its four import entry
//!   points, all converging on one validation path.
//! - [`sender`] — the outbound pipeline: encrypt+sign, transport selection,
//!   delivery bookkeeping, retry sweeping.
//! - [`invites`] — invite creation, remote acceptance, garbage collection.
//! - [`supervisor`] — the ordered boot sequence, watchdog, and the root
//!   context every component hangs off.

pub mod contacts;
pub mod invites;
pub mod sender;
pub mod state;
pub mod supervisor;
pub mod vault;

pub use sender::{OutboundSender, SendOutcome};
pub use state::NodeState;
pub use supervisor::{NodeContext, Supervisor};
