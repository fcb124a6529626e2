//! The transport orchestrator.
//!
//! Owns the control-port connection, publishes every state transition
//! through a watch channel, and mediates hidden-service publication for
//! both the persistent primary onion and the ephemeral invite onion.
//!
//! Descriptor-upload waiting uses a single-slot waiter per service kind:
//! the event pump completes the current waiter when an `HS_DESC UPLOADED`
//! event carries the awaited service id. Uploads observed before a waiter
//! registers are remembered, so the register-then-wait race is closed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use echomesh_common::config::TorConfig;
use echomesh_common::types::OnionAddr;
use echomesh_crypto::sealing::SealError;
use echomesh_crypto::DeviceKek;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use zeroize::Zeroizing;

use crate::control::{ControlAuth, ControlClient, ControlError, ControlEvent};
use crate::state::{TorErrorCode, TorState};

/// Sealed hidden-service key file inside the data directory.
pub const HS_KEY_FILE: &str = "hidden_service_key.enc";
/// Runtime scratch directory wiped by a transport reset.
pub const RUNTIME_DIR: &str = "tor-runtime";

/// Bootstrap poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(750);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("control channel: {0}")]
    Control(#[from] ControlError),
    #[error("bootstrap did not complete in time")]
    BootstrapTimeout,
    #[error("hidden service descriptor was not uploaded in time")]
    PublishTimeout {
        /// Whether this failure consumed the once-per-boot automatic
        /// wipe-and-restart.
        auto_reset: bool,
    },
    #[error("transport is not started")]
    NotStarted,
    #[error("sealed key: {0}")]
    Seal(#[from] SealError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon returned a malformed service id")]
    BadServiceId,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ServiceKind {
    Primary,
    Invite,
}

struct DescWaiter {
    service_id: String,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct WaiterSlots {
    primary: Option<DescWaiter>,
    invite: Option<DescWaiter>,
    /// Service ids already seen as uploaded; bounded by a reset per boot.
    uploaded: HashSet<String>,
}

struct Inner {
    control: Option<Arc<ControlClient>>,
    invite_service: Option<(OnionAddr, String)>,
    auto_reset_done: bool,
}

/// Drives the external Tor daemon and publishes [`TorState`].
pub struct TorOrchestrator {
    config: TorConfig,
    data_dir: PathBuf,
    kek: Arc<DeviceKek>,
    state_tx: watch::Sender<TorState>,
    inner: Mutex<Inner>,
    waiters: Arc<StdMutex<WaiterSlots>>,
    onion_hint: StdMutex<Option<String>>,
}

impl TorOrchestrator {
    pub fn new(config: TorConfig, data_dir: PathBuf, kek: Arc<DeviceKek>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(TorState::Stopped);
        Arc::new(Self {
            config,
            data_dir,
            kek,
            state_tx,
            inner: Mutex::new(Inner {
                control: None,
                invite_service: None,
                auto_reset_done: false,
            }),
            waiters: Arc::new(StdMutex::new(WaiterSlots::default())),
            onion_hint: StdMutex::new(None),
        })
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TorState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> TorState {
        self.state_tx.borrow().clone()
    }

    /// Seed the display-only onion hint (e.g. from a persisted preference).
    pub fn set_onion_hint(&self, hint: Option<String>) {
        *self.onion_hint.lock().expect("hint lock") = hint;
    }

    pub fn onion_hint(&self) -> Option<String> {
        self.onion_hint.lock().expect("hint lock").clone()
    }

    fn publish(&self, state: TorState) {
        tracing::debug!(state = state.tag(), "transport state");
        let _ = self.state_tx.send(state);
    }

    fn publish_error(&self, code: TorErrorCode, detail: impl Into<String>, recoverable: bool) {
        self.publish(TorState::Error {
            code,
            detail: detail.into(),
            recoverable,
            onion_hint: self.onion_hint(),
        });
    }

    fn auth(&self) -> ControlAuth {
        if !self.config.control_cookie_path.is_empty() {
            ControlAuth::CookieFile(PathBuf::from(&self.config.control_cookie_path))
        } else if !self.config.control_password.is_empty() {
            ControlAuth::Password(self.config.control_password.clone())
        } else {
            ControlAuth::Null
        }
    }

    async fn control(&self) -> Result<Arc<ControlClient>, OrchestratorError> {
        self.inner
            .lock()
            .await
            .control
            .clone()
            .ok_or(OrchestratorError::NotStarted)
    }

    /// Connect to the control port, authenticate, and start the event pump.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.publish(TorState::Starting);

        let addr = format!("{}:{}", self.config.control_host, self.config.control_port);
        let control = match ControlClient::connect(&addr).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                self.publish_error(TorErrorCode::ControlUnavailable, e.to_string(), true);
                return Err(e.into());
            }
        };
        if let Err(e) = control.authenticate(&self.auth()).await {
            self.publish_error(TorErrorCode::ControlUnavailable, e.to_string(), true);
            return Err(e.into());
        }
        if let Err(e) = control.watch_hs_desc().await {
            self.publish_error(TorErrorCode::ControlUnavailable, e.to_string(), true);
            return Err(e.into());
        }

        if let Some(events) = control.take_events().await {
            tokio::spawn(event_pump(events, Arc::clone(&self.waiters)));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.control = Some(control);
            inner.invite_service = None;
            // each boot gets one automatic wipe-and-restart budget
            inner.auto_reset_done = false;
        }
        self.waiters.lock().expect("waiter lock").uploaded.clear();

        self.publish(TorState::Bootstrapping {
            progress: 0,
            tag: "starting".into(),
            summary: String::new(),
        });
        Ok(())
    }

    /// Disconnect from the control port without touching persisted state.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.control = None;
        inner.invite_service = None;
        drop(inner);
        self.publish(TorState::Stopped);
    }

    /// Remove both onion services, then disconnect.
    pub async fn stop_service(&self) {
        if let Ok(control) = self.control().await {
            let invite = self.inner.lock().await.invite_service.take();
            if let Some((_, service_id)) = invite {
                let _ = control.del_onion(&service_id).await;
            }
        }
        self.stop().await;
    }

    /// Tear down and re-establish the control connection.
    pub async fn reconnect(&self) -> Result<(), OrchestratorError> {
        self.stop().await;
        self.start().await
    }

    /// Poll bootstrap progress until the daemon reports `PROGRESS=100
    /// TAG=done`, then transition to `TransportReady`.
    pub async fn await_ready(
        &self,
        budget: Duration,
    ) -> Result<(String, u16), OrchestratorError> {
        let control = self.control().await?;
        let deadline = Instant::now() + budget;

        loop {
            match control.bootstrap_phase().await {
                Ok(phase) => {
                    let done = phase.progress >= 100 && phase.tag == "done";
                    self.publish(TorState::Bootstrapping {
                        progress: phase.progress,
                        tag: phase.tag,
                        summary: phase.summary,
                    });
                    if done {
                        let socks =
                            (self.config.socks_host.clone(), self.config.socks_port);
                        self.publish(TorState::TransportReady {
                            socks_host: socks.0.clone(),
                            socks_port: socks.1,
                        });
                        return Ok(socks);
                    }
                }
                Err(e) => {
                    self.publish_error(TorErrorCode::ControlUnavailable, e.to_string(), true);
                    return Err(e.into());
                }
            }

            if Instant::now() + POLL_INTERVAL > deadline {
                self.publish_error(
                    TorErrorCode::BootstrapTimeout,
                    "bootstrap did not reach 100%",
                    true,
                );
                return Err(OrchestratorError::BootstrapTimeout);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Publish the primary hidden service, reusing the sealed persisted key
    /// when one exists.
    ///
    /// On descriptor-upload timeout this wipes the transport state at most
    /// once per boot so the supervisor's next attempt starts clean.
    pub async fn ensure_hidden_service(
        &self,
        local_port: u16,
        virtual_port: u16,
    ) -> Result<OnionAddr, OrchestratorError> {
        let control = self.control().await?;

        let key_path = self.data_dir.join(HS_KEY_FILE);
        let key_spec: Zeroizing<String> = if key_path.exists() {
            let sealed = std::fs::read_to_string(&key_path)?;
            let blob = self.kek.open(sealed.trim())?;
            let blob = std::str::from_utf8(&blob).map_err(|_| SealError::Format)?;
            Zeroizing::new(format!("ED25519-V3:{blob}"))
        } else {
            Zeroizing::new("NEW:ED25519-V3".to_owned())
        };

        let reply = control.add_onion(&key_spec, virtual_port, local_port, false).await?;
        let onion = OnionAddr::parse(&format!("{}.onion", reply.service_id))
            .map_err(|_| OrchestratorError::BadServiceId)?;
        self.publish(TorState::HiddenServicePublishing { onion: onion.as_str().to_owned() });

        let budget = Duration::from_secs(self.config.publish_timeout_secs);
        if !self.wait_for_upload(ServiceKind::Primary, &reply.service_id, budget).await {
            let auto_reset = {
                let mut inner = self.inner.lock().await;
                let first = !inner.auto_reset_done;
                inner.auto_reset_done = true;
                first
            };
            self.publish_error(
                TorErrorCode::HiddenServicePublishTimeout,
                "descriptor upload timed out",
                true,
            );
            if auto_reset {
                tracing::warn!("descriptor upload timed out; wiping transport state once");
                self.reset_transport_only().await?;
            }
            return Err(OrchestratorError::PublishTimeout { auto_reset });
        }

        // Persist a freshly generated key only after a successful upload.
        if let Some(private_key) = &reply.private_key {
            let sealed = self.kek.seal(private_key.as_bytes())?;
            std::fs::write(&key_path, sealed)?;
            tracing::info!("sealed new hidden service key");
        }

        *self.onion_hint.lock().expect("hint lock") = Some(onion.as_str().to_owned());
        Ok(onion)
    }

    /// Publish the ephemeral invite hidden service. Memoized until dropped;
    /// the key never touches disk.
    pub async fn ensure_invite_hidden_service(
        &self,
        local_port: u16,
        virtual_port: u16,
    ) -> Result<OnionAddr, OrchestratorError> {
        if let Some((onion, _)) = &self.inner.lock().await.invite_service {
            return Ok(onion.clone());
        }

        let control = self.control().await?;
        let reply = control.add_onion("NEW:ED25519-V3", virtual_port, local_port, true).await?;
        let onion = OnionAddr::parse(&format!("{}.onion", reply.service_id))
            .map_err(|_| OrchestratorError::BadServiceId)?;

        let budget = Duration::from_secs(self.config.publish_timeout_secs);
        if !self.wait_for_upload(ServiceKind::Invite, &reply.service_id, budget).await {
            let _ = control.del_onion(&reply.service_id).await;
            return Err(OrchestratorError::PublishTimeout { auto_reset: false });
        }

        self.inner.lock().await.invite_service = Some((onion.clone(), reply.service_id));
        Ok(onion)
    }

    /// Best-effort removal of the invite hidden service.
    pub async fn drop_invite_hidden_service(&self) {
        let taken = self.inner.lock().await.invite_service.take();
        if let Some((_, service_id)) = taken {
            if let Ok(control) = self.control().await {
                if let Err(e) = control.del_onion(&service_id).await {
                    tracing::debug!("DEL_ONION for invite service failed: {e}");
                }
            }
        }
    }

    /// Current invite onion, if one is published.
    pub async fn invite_onion(&self) -> Option<OnionAddr> {
        self.inner.lock().await.invite_service.as_ref().map(|(o, _)| o.clone())
    }

    /// Delete the hidden-service key file and runtime directories, then
    /// transition to `Stopped`. The persisted onion-hint preference is the
    /// caller's to clear.
    pub async fn reset_transport_only(&self) -> Result<(), OrchestratorError> {
        let key_path = self.data_dir.join(HS_KEY_FILE);
        if key_path.exists() {
            std::fs::remove_file(&key_path)?;
        }
        let runtime_dir = self.data_dir.join(RUNTIME_DIR);
        if runtime_dir.exists() {
            std::fs::remove_dir_all(&runtime_dir)?;
        }
        *self.onion_hint.lock().expect("hint lock") = None;
        self.stop().await;
        Ok(())
    }

    /// Publish the terminal `Ready` state once the supervisor has bound the
    /// onion and attached the SOCKS client.
    pub fn mark_ready(&self, onion: &OnionAddr) {
        self.publish(TorState::Ready {
            onion: onion.as_str().to_owned(),
            socks_host: self.config.socks_host.clone(),
            socks_port: self.config.socks_port,
        });
    }

    async fn wait_for_upload(
        &self,
        kind: ServiceKind,
        service_id: &str,
        budget: Duration,
    ) -> bool {
        let rx = {
            let mut slots = self.waiters.lock().expect("waiter lock");
            if slots.uploaded.contains(service_id) {
                return true;
            }
            let (tx, rx) = oneshot::channel();
            let waiter = DescWaiter { service_id: service_id.to_owned(), tx };
            // Replacing a stale waiter cancels it; its boot has moved on.
            match kind {
                ServiceKind::Primary => slots.primary = Some(waiter),
                ServiceKind::Invite => slots.invite = Some(waiter),
            }
            rx
        };
        timeout(budget, rx).await.map(|r| r.is_ok()).unwrap_or(false)
    }
}

async fn event_pump(
    mut events: tokio::sync::mpsc::UnboundedReceiver<ControlEvent>,
    waiters: Arc<StdMutex<WaiterSlots>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ControlEvent::HsDescUploaded { service_id } => {
                let mut guard = waiters.lock().expect("waiter lock");
                let slots = &mut *guard;
                slots.uploaded.insert(service_id.clone());
                for slot in [&mut slots.primary, &mut slots.invite] {
                    if slot.as_ref().is_some_and(|w| w.service_id == service_id) {
                        if let Some(waiter) = slot.take() {
                            let _ = waiter.tx.send(());
                        }
                    }
                }
            }
            ControlEvent::HsDescFailed { service_id } => {
                // One HsDir rejecting an upload is not fatal; the daemon
                // keeps trying others. Only the timeout decides.
                tracing::debug!(%service_id, "hs descriptor upload attempt failed");
            }
            ControlEvent::Other(_) => {}
        }
    }
    tracing::debug!("control event pump ended");
}
