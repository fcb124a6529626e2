//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > .env file > config.toml > defaults.
//!
//! The loaded [`AppConfig`] is created once at startup and passed down
//! explicitly; there is no process-global config state.

use std::path::PathBuf;

use serde::Deserialize;

/// Load configuration from defaults, an optional `config.toml`, and
/// `ECHOMESH_*` environment variables (`ECHOMESH_TOR__SOCKS_PORT`, etc.).
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("data_dir", "./data")?
        .set_default("tor.control_host", "127.0.0.1")?
        .set_default("tor.control_port", 9051)?
        .set_default("tor.socks_host", "127.0.0.1")?
        .set_default("tor.socks_port", 9050)?
        .set_default("tor.control_password", "")?
        .set_default("tor.control_cookie_path", "")?
        .set_default("tor.bootstrap_timeout_secs", 120)?
        .set_default("tor.publish_timeout_secs", 120)?
        .set_default("ingress.virtual_port", 80)?
        .set_default("ingress.start_timeout_secs", 5)?
        .set_default("security.strict_verified", true)?
        .set_default("security.debug", false)?
        .set_default("supervisor.boot_timeout_secs", 180)?
        .set_default("supervisor.backoff_initial_secs", 2)?
        .set_default("supervisor.backoff_cap_secs", 30)?
        .set_default("supervisor.invite_gc_secs", 60)?
        .set_default("supervisor.retry_sweep_secs", 30)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (ECHOMESH_TOR__SOCKS_PORT, etc.)
        .add_source(
            config::Environment::with_prefix("ECHOMESH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Root directory for the sealed store, key files, and runtime state.
    pub data_dir: PathBuf,
    pub tor: TorConfig,
    pub ingress: IngressConfig,
    pub security: SecurityConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TorConfig {
    pub control_host: String,
    pub control_port: u16,
    pub socks_host: String,
    pub socks_port: u16,
    /// Control-port password; empty for cookie or null auth.
    pub control_password: String,
    /// Path to the control auth cookie; empty to use password or null auth.
    pub control_cookie_path: String,
    /// Budget for the bootstrap progress poll.
    pub bootstrap_timeout_secs: u64,
    /// Budget for a hidden-service descriptor upload.
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngressConfig {
    /// Virtual port the hidden service exposes; forwarded to the ephemeral
    /// loopback port the ingress actually binds.
    pub virtual_port: u16,
    pub start_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// When set (the default), inbound envelopes are only accepted from
    /// `Verified` contacts.
    pub strict_verified: bool,
    /// Enables the debug routes, the debug-plaintext path, and the
    /// `runtime.json` snapshot. Never enable on a production device.
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Overall budget for one boot attempt.
    pub boot_timeout_secs: u64,
    pub backoff_initial_secs: u64,
    pub backoff_cap_secs: u64,
    /// Interval of the invite garbage-collection sweep.
    pub invite_gc_secs: u64,
    /// Interval of the queued-message retry sweep.
    pub retry_sweep_secs: u64,
}

impl AppConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.tor.control_host, self.tor.control_port)
    }

    pub fn socks_addr(&self) -> (String, u16) {
        (self.tor.socks_host.clone(), self.tor.socks_port)
    }
}
