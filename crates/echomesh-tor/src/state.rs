//! The observable transport state machine.

use serde::Serialize;

/// Error classes surfaced through the state flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TorErrorCode {
    BootstrapTimeout,
    HiddenServicePublishTimeout,
    ControlUnavailable,
    Io,
    Unknown,
}

impl TorErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootstrapTimeout => "BOOTSTRAP_TIMEOUT",
            Self::HiddenServicePublishTimeout => "HS_PUBLISH_TIMEOUT",
            Self::ControlUnavailable => "CONTROL_UNAVAILABLE",
            Self::Io => "IO",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Discrete transport states, published atomically in order.
///
/// `onion_hint` in [`TorState::Error`] is the last onion this device
/// published; it is display material only and never treated as reachable
/// until a fresh `Ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorState {
    Stopped,
    Starting,
    Bootstrapping { progress: u8, tag: String, summary: String },
    TransportReady { socks_host: String, socks_port: u16 },
    HiddenServicePublishing { onion: String },
    Ready { onion: String, socks_host: String, socks_port: u16 },
    Error { code: TorErrorCode, detail: String, recoverable: bool, onion_hint: Option<String> },
}

impl TorState {
    /// Short tag for logs, health responses, and the runtime snapshot.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Bootstrapping { .. } => "Bootstrapping",
            Self::TransportReady { .. } => "TransportReady",
            Self::HiddenServicePublishing { .. } => "HiddenServicePublishing",
            Self::Ready { .. } => "Ready",
            Self::Error { .. } => "Error",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// SOCKS endpoint, available from `TransportReady` onward.
    pub fn socks_endpoint(&self) -> Option<(String, u16)> {
        match self {
            Self::TransportReady { socks_host, socks_port }
            | Self::Ready { socks_host, socks_port, .. } => {
                Some((socks_host.clone(), *socks_port))
            }
            _ => None,
        }
    }

    pub fn onion(&self) -> Option<&str> {
        match self {
            Self::HiddenServicePublishing { onion } | Self::Ready { onion, .. } => Some(onion),
            Self::Error { onion_hint, .. } => onion_hint.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_exposes_endpoint_and_onion() {
        let state = TorState::Ready {
            onion: "x.onion".into(),
            socks_host: "127.0.0.1".into(),
            socks_port: 9050,
        };
        assert!(state.is_ready());
        assert_eq!(state.socks_endpoint(), Some(("127.0.0.1".into(), 9050)));
        assert_eq!(state.onion(), Some("x.onion"));
        assert_eq!(state.tag(), "Ready");
    }

    #[test]
    fn error_carries_hint_only() {
        let state = TorState::Error {
            code: TorErrorCode::BootstrapTimeout,
            detail: "no progress".into(),
            recoverable: true,
            onion_hint: Some("y.onion".into()),
        };
        assert!(!state.is_ready());
        assert_eq!(state.socks_endpoint(), None);
        assert_eq!(state.onion(), Some("y.onion"));
    }
}
