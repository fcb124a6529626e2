//! Boot orchestration, watchdog, and the root context.
//!
//! One ordered sequence establishes all reachability:
//!
//! ```text
//! ensure_identity -> detach_sender -> start_transport -> await_bootstrap
//! -> socks endpoint -> start_ingress -> ensure_hidden_service
//! -> bind_onion -> attach_socks -> READY
//! ```
//!
//! Every boot gets a generation id from an atomic counter. A phase whose
//! generation is no longer current aborts immediately, so at most one boot
//! ever takes effect even when the watchdog fires while an older boot is
//! still in flight.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use echomesh_api::replay::ReplayGuard;
use echomesh_api::ApiState;
use echomesh_common::config::AppConfig;
use echomesh_common::error::CoreError;
use echomesh_common::now_millis;
use echomesh_common::wire::RuntimeSnapshot;
use echomesh_crypto::{DeviceKek, EnvelopeCodec, SealedEnvelopeCodec};
use echomesh_db::repository::prefs;
use echomesh_db::Store;
use echomesh_tor::orchestrator::OrchestratorError;
use echomesh_tor::{TorOrchestrator, TorState};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::contacts::ContactManager;
use crate::invites::InviteService;
use crate::sender::OutboundSender;
use crate::state::NodeState;
use crate::vault::IdentityVault;

/// The root context: every long-lived component, created once and passed
/// explicitly. There is no process-global state.
pub struct NodeContext {
    pub config: AppConfig,
    pub store: Store,
    pub kek: Arc<DeviceKek>,
    pub codec: Arc<dyn EnvelopeCodec>,
    pub vault: IdentityVault,
    pub contacts: ContactManager,
    pub sender: Arc<OutboundSender>,
    pub invites: InviteService,
    pub tor: Arc<TorOrchestrator>,
    pub replay: Arc<ReplayGuard>,
}

impl NodeContext {
    pub fn new(config: AppConfig, store: Store, kek: Arc<DeviceKek>) -> Arc<Self> {
        let codec: Arc<dyn EnvelopeCodec> = Arc::new(SealedEnvelopeCodec);
        let tor = TorOrchestrator::new(
            config.tor.clone(),
            config.data_dir.clone(),
            Arc::clone(&kek),
        );
        let vault = IdentityVault::new(store.clone(), Arc::clone(&kek));
        let contacts = ContactManager::new(store.clone());
        let sender = OutboundSender::new(
            store.clone(),
            Arc::clone(&kek),
            Arc::clone(&codec),
            config.security.debug,
        );
        let invites = InviteService::new(store.clone(), Arc::clone(&tor), contacts.clone());
        Arc::new(Self {
            config,
            store,
            kek,
            codec,
            vault,
            contacts,
            sender,
            invites,
            tor,
            replay: Arc::new(ReplayGuard::new()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("boot superseded by a newer generation")]
    Superseded,
    #[error("transport: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("ingress did not start in time")]
    IngressTimeout,
    #[error("ingress: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl BootError {
    fn code(&self) -> &'static str {
        match self {
            Self::Superseded => "SUPERSEDED",
            Self::Orchestrator(OrchestratorError::BootstrapTimeout) => "BOOTSTRAP_TIMEOUT",
            Self::Orchestrator(OrchestratorError::PublishTimeout { .. }) => "HS_PUBLISH_TIMEOUT",
            Self::Orchestrator(_) => "CONTROL_UNAVAILABLE",
            Self::IngressTimeout | Self::Io(_) => "IO",
            Self::Core(_) => "UNKNOWN",
        }
    }
}

struct IngressHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    port: u16,
}

/// Drives boots and keeps the node reachable.
pub struct Supervisor {
    ctx: Arc<NodeContext>,
    state_tx: watch::Sender<NodeState>,
    boot_id: AtomicU64,
    ingress: Mutex<Option<IngressHandle>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<NodeContext>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(NodeState::Idle);
        Arc::new(Self {
            ctx,
            state_tx,
            boot_id: AtomicU64::new(0),
            ingress: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> NodeState {
        self.state_tx.borrow().clone()
    }

    fn publish(&self, state: NodeState) {
        tracing::info!(state = state.tag(), "node state");
        let _ = self.state_tx.send(state);
    }

    fn phase(&self, my_boot: u64, name: &str) -> Result<(), BootError> {
        if self.boot_id.load(Ordering::SeqCst) != my_boot {
            return Err(BootError::Superseded);
        }
        tracing::info!(phase = name, "boot phase");
        self.publish(NodeState::Booting { phase: name.to_owned() });
        Ok(())
    }

    /// Run one full boot. Safe to call again at any time: the previous
    /// generation self-cancels at its next phase boundary.
    pub async fn boot(&self) -> Result<(), BootError> {
        let my_boot = self.boot_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cfg = &self.ctx.config;

        // A newer boot owns the ingress from here on.
        self.stop_ingress().await;

        self.phase(my_boot, "ensure_identity")?;
        self.ctx.vault.ensure_identity().await?;

        self.ctx.sender.detach_socks_client();

        self.phase(my_boot, "start_transport")?;
        if let Some(hint) = prefs::get(&self.ctx.store, prefs::KEY_LAST_ONION)
            .await
            .map_err(|e| BootError::Core(CoreError::Internal(e.into())))?
        {
            self.ctx.tor.set_onion_hint(Some(hint));
        }
        self.ctx.tor.start().await?;

        self.phase(my_boot, "await_bootstrap")?;
        let (socks_host, socks_port) = self
            .ctx
            .tor
            .await_ready(Duration::from_secs(cfg.supervisor.boot_timeout_secs))
            .await?;

        self.phase(my_boot, "start_ingress")?;
        let port = self.start_ingress(cfg).await?;
        self.ctx.sender.set_loopback_port(port);

        self.phase(my_boot, "publish_hidden_service")?;
        let onion = self
            .ctx
            .tor
            .ensure_hidden_service(port, cfg.ingress.virtual_port)
            .await?;

        self.phase(my_boot, "bind_onion")?;
        self.ctx.vault.bind_onion(onion.as_str()).await?;

        self.phase(my_boot, "attach_sender")?;
        self.ctx.sender.attach_socks_client(&socks_host, socks_port)?;

        if self.boot_id.load(Ordering::SeqCst) != my_boot {
            return Err(BootError::Superseded);
        }
        self.ctx.tor.mark_ready(&onion);
        self.publish(NodeState::Ready {
            onion: onion.as_str().to_owned(),
            ingress_port: port,
        });
        tracing::info!(onion = onion.as_str(), port, "node is reachable");
        Ok(())
    }

    async fn start_ingress(&self, cfg: &AppConfig) -> Result<u16, BootError> {
        let api_state = ApiState {
            store: self.ctx.store.clone(),
            codec: Arc::clone(&self.ctx.codec),
            replay: Arc::clone(&self.ctx.replay),
            kek: Arc::clone(&self.ctx.kek),
            tor_state: self.ctx.tor.subscribe(),
            bound_port: Arc::new(AtomicU16::new(0)),
            strict_verified: cfg.security.strict_verified,
            debug: cfg.security.debug,
        };

        let listener = timeout(
            Duration::from_secs(cfg.ingress.start_timeout_secs),
            echomesh_api::bind_ephemeral(&api_state),
        )
        .await
        .map_err(|_| BootError::IngressTimeout)??;
        let port = api_state.bound_port();

        let router = echomesh_api::build_router(api_state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            if let Err(e) = echomesh_api::serve(listener, router, async {
                let _ = shutdown_rx.await;
            })
            .await
            {
                tracing::error!("ingress server error: {e}");
            }
        });

        *self.ingress.lock().await = Some(IngressHandle { shutdown: shutdown_tx, task, port });
        Ok(port)
    }

    /// Stop the ingress and release its port.
    pub async fn stop_ingress(&self) {
        if let Some(handle) = self.ingress.lock().await.take() {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
            tracing::info!(port = handle.port, "ingress stopped");
        }
    }

    /// Full teardown: ingress down, onions removed, transport disconnected.
    pub async fn shutdown(&self) {
        // invalidate any in-flight boot
        self.boot_id.fetch_add(1, Ordering::SeqCst);
        self.stop_ingress().await;
        self.ctx.sender.detach_socks_client();
        self.ctx.tor.stop_service().await;
        self.publish(NodeState::Idle);
    }

    /// Run the watchdog plus the periodic sweeps until shutdown.
    ///
    /// The watchdog re-boots with exponential backoff whenever readiness is
    /// lost; the sweeps handle invite GC and queued-message retries.
    pub async fn run(self: Arc<Self>) {
        let gc = {
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                let period = Duration::from_secs(me.ctx.config.supervisor.invite_gc_secs);
                loop {
                    sleep(period).await;
                    if let Err(e) = me.ctx.invites.gc().await {
                        tracing::warn!("invite gc failed: {e}");
                    }
                }
            })
        };
        let retries = {
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                let period = Duration::from_secs(me.ctx.config.supervisor.retry_sweep_secs);
                loop {
                    sleep(period).await;
                    if me.state().is_ready() {
                        if let Err(e) = me.ctx.sender.sweep_retries(now_millis()).await {
                            tracing::warn!("retry sweep failed: {e}");
                        }
                    }
                }
            })
        };
        if self.ctx.config.security.debug {
            let me = Arc::clone(&self);
            tokio::spawn(async move { me.snapshot_loop().await });
        }

        let initial = Duration::from_secs(self.ctx.config.supervisor.backoff_initial_secs);
        let cap = Duration::from_secs(self.ctx.config.supervisor.backoff_cap_secs);
        let mut backoff = initial;

        loop {
            match self.boot().await {
                Ok(()) => {
                    backoff = initial;
                    self.wait_for_readiness_loss().await;
                    tracing::warn!("readiness lost; rebooting");
                }
                Err(BootError::Superseded) => {
                    tracing::debug!("boot superseded");
                    gc.abort();
                    retries.abort();
                    return;
                }
                Err(e) => {
                    tracing::error!("boot failed: {e}");
                    self.publish(NodeState::Error {
                        code: e.code().to_owned(),
                        detail: e.to_string(),
                    });
                }
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(cap);
        }
    }

    async fn wait_for_readiness_loss(&self) {
        let mut rx = self.ctx.tor.subscribe();
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            match &*rx.borrow() {
                TorState::Error { .. } | TorState::Stopped => return,
                _ => {}
            }
        }
    }

    async fn snapshot_loop(&self) {
        let mut rx = self.ctx.tor.subscribe();
        loop {
            self.write_runtime_snapshot(&rx.borrow().clone());
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn write_runtime_snapshot(&self, tor_state: &TorState) {
        let ingress_port = match self.state() {
            NodeState::Ready { ingress_port, .. } => Some(ingress_port),
            _ => None,
        };
        let (error_code, error_detail) = match tor_state {
            TorState::Error { code, detail, .. } => {
                (Some(code.as_str().to_owned()), Some(detail.clone()))
            }
            _ => (None, None),
        };
        let socks = tor_state.socks_endpoint();
        let snapshot = RuntimeSnapshot {
            v: 1,
            state: tor_state.tag().to_owned(),
            onion: tor_state.onion().map(str::to_owned),
            local_port: ingress_port,
            socks_host: socks.as_ref().map(|(h, _)| h.clone()),
            socks_port: socks.map(|(_, p)| p),
            error_code,
            error_detail,
            ts: now_millis(),
        };
        let path = self.ctx.config.data_dir.join("runtime.json");
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::debug!("runtime snapshot not written: {e}");
                }
            }
            Err(e) => tracing::debug!("runtime snapshot not serialized: {e}"),
        }
    }
}
