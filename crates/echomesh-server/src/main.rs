//! # echomeshd
//!
//! The Echomesh daemon: one long-lived process that publishes this device's
//! hidden service, runs the loopback ingress, and keeps the node reachable
//! through the supervisor's watchdog.
//!
//! An external Tor daemon must be reachable on the configured control and
//! SOCKS ports; echomeshd drives it, it does not spawn it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use echomesh_crypto::DeviceKek;
use echomesh_db::Store;
use echomesh_node::{NodeContext, Supervisor};

/// Filename of the device key-encryption key inside the data directory.
const KEK_FILE: &str = "device.kek";

#[derive(Parser, Debug)]
#[command(name = "echomeshd", version, about)]
struct Args {
    /// Data directory for the sealed store and key files.
    #[arg(long, env = "ECHOMESH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Tor control port override.
    #[arg(long, env = "ECHOMESH_TOR__CONTROL_PORT")]
    control_port: Option<u16>,

    /// Tor SOCKS port override.
    #[arg(long, env = "ECHOMESH_TOR__SOCKS_PORT")]
    socks_port: Option<u16>,

    /// Store PIN, when the sealed store was created with one.
    #[arg(long, env = "ECHOMESH_PIN", hide_env_values = true)]
    pin: Option<String>,

    /// Enable debug routes and the runtime snapshot. Never use on a
    /// production device.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = echomesh_common::config::load()?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.control_port {
        config.tor.control_port = port;
    }
    if let Some(port) = args.socks_port {
        config.tor.socks_port = port;
    }
    if args.debug {
        config.security.debug = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echomesh=debug,tower_http=info".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting echomeshd v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("   data dir: {}", config.data_dir.display());
    tracing::info!(
        "   tor: control {}:{}, socks {}:{}",
        config.tor.control_host,
        config.tor.control_port,
        config.tor.socks_host,
        config.tor.socks_port
    );

    let kek = Arc::new(DeviceKek::load_or_create(&config.data_dir.join(KEK_FILE))?);
    let store = Store::open(&config.data_dir, &kek, args.pin.as_deref()).await?;
    let ctx = NodeContext::new(config, store, kek);
    let supervisor = Supervisor::new(ctx);

    let runner = tokio::spawn(Arc::clone(&supervisor).run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    runner.abort();
    supervisor.shutdown().await;

    Ok(())
}
