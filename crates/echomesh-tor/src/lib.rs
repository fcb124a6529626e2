//! # echomesh-tor
//!
//! Wraps an external Tor daemon behind one observable state machine.
//!
//! The node never speaks Tor's wire protocols itself; it drives the daemon
//! over the control port (bootstrap progress, onion service publication,
//! HS_DESC events) and hands the SOCKS endpoint to the outbound sender.
//! All state transitions are published through a `tokio::sync::watch`
//! channel so subscribers always see a consistent snapshot.

pub mod control;
pub mod orchestrator;
pub mod state;

pub use orchestrator::TorOrchestrator;
pub use state::{TorErrorCode, TorState};
