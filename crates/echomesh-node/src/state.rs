//! Observable node lifecycle state.

/// Published by the supervisor through a watch channel. UI layers subscribe
/// to render boot progress without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Nothing running.
    Idle,
    /// A boot is in flight; `phase` names the current step.
    Booting { phase: String },
    /// Fully reachable: hidden service published, ingress bound, SOCKS
    /// attached.
    Ready { onion: String, ingress_port: u16 },
    /// The last boot failed; the watchdog will retry with backoff.
    Error { code: String, detail: String },
}

impl NodeState {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Booting { .. } => "Booting",
            Self::Ready { .. } => "Ready",
            Self::Error { .. } => "Error",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}
