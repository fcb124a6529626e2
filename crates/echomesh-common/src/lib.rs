//! # echomesh-common
//!
//! Shared types, utilities, and configuration for the Echomesh node runtime:
//! canonical identifiers (fingerprints, onion addresses), the persisted data
//! model, wire envelope formats, QR codecs, and the error taxonomy used by
//! every other crate in the workspace.

pub mod config;
pub mod error;
pub mod models;
pub mod qr;
pub mod types;
pub mod validation;
pub mod wire;

/// Current wall-clock time as Unix milliseconds.
///
/// All persisted and wire timestamps in Echomesh are int64 milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
