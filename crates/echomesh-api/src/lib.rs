//! # echomesh-api
//!
//! The loopback ingress: a small axum server bound to `127.0.0.1` on an
//! ephemeral port. The hidden service forwards its virtual port here, so
//! everything a remote peer can reach goes through this router: the
//! inbound envelope pipeline, one-shot invite acceptance, and direct
//! contact import. Note-to-self traffic arrives over plain loopback.

pub mod inbound;
pub mod replay;
pub mod routes;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::Router;
use echomesh_crypto::{DeviceKek, EnvelopeCodec};
use echomesh_db::Store;
use echomesh_tor::TorState;
use tokio::net::TcpListener;
use tokio::sync::watch;

use replay::ReplayGuard;

/// Request body cap (bytes).
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub codec: Arc<dyn EnvelopeCodec>,
    pub replay: Arc<ReplayGuard>,
    pub kek: Arc<DeviceKek>,
    /// Transport state, read by the health route.
    pub tor_state: watch::Receiver<TorState>,
    /// The ephemeral port this server actually bound; 0 until bound.
    pub bound_port: Arc<AtomicU16>,
    pub strict_verified: bool,
    pub debug: bool,
}

impl ApiState {
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Relaxed)
    }
}

/// Build the complete ingress router. Anything outside the route table is a
/// hard 404.
pub fn build_router(state: ApiState) -> Router {
    let mut router = Router::new()
        .merge(routes::health::router())
        .merge(routes::messages::router())
        .merge(routes::invite::router())
        .merge(routes::contact_import::router());

    if state.debug {
        tracing::warn!("debug routes are enabled");
        router = router.merge(routes::debug::router());
    }

    router
        .fallback(routes::not_found)
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Bind `127.0.0.1:0` and record the chosen port in the state.
pub async fn bind_ephemeral(state: &ApiState) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    state.bound_port.store(port, Ordering::Relaxed);
    tracing::info!("ingress bound to 127.0.0.1:{port}");
    Ok(listener)
}

/// Serve until `shutdown` resolves. The listener (and its port) is released
/// when this future returns.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
