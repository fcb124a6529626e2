//! # echomesh-db
//!
//! The sealed persistent store: identities, contacts, messages, invites,
//! and preferences in an embedded SQLite database via `sqlx`.
//!
//! Sensitive column content (message blobs, display names) is sealed under
//! a random master key before it reaches the database file. The master key
//! itself lives on disk only in sealed form: encrypted by the device
//! key-encryption key, optionally wrapped again by a user-PIN-derived
//! scrypt key. Schema changes are append-only numbered migrations.

pub mod master;
pub mod repository;

use std::path::Path;
use std::sync::Arc;

use echomesh_crypto::sealing::SealError;
use echomesh_crypto::DeviceKek;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use master::MasterKey;

/// Filename of the database inside the data directory.
pub const DB_FILE: &str = "echomesh.db";
/// Filename of the sealed master-key file inside the data directory.
pub const MASTER_KEY_FILE: &str = "store_master.enc";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("sealing error: {0}")]
    Seal(#[from] SealError),
    #[error("store is PIN-protected; a PIN is required to open it")]
    PinRequired,
    #[error("store content is corrupt: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handle to the sealed store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    master: Arc<MasterKey>,
}

impl Store {
    /// Open (or create) the store under `data_dir`.
    ///
    /// `pin` must be supplied when the master key was previously wrapped
    /// with one; opening without it fails with [`StoreError::PinRequired`].
    pub async fn open(
        data_dir: &Path,
        kek: &DeviceKek,
        pin: Option<&str>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(DB_FILE))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        tracing::info!("Running store migrations");
        MIGRATOR.run(&pool).await?;

        let master = MasterKey::load_or_create(&data_dir.join(MASTER_KEY_FILE), kek, pin)?;
        Ok(Self { pool, master: Arc::new(master) })
    }

    /// An in-memory store for tests: same schema, throwaway master key.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool, master: Arc::new(MasterKey::ephemeral()) })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn master(&self) -> &MasterKey {
        &self.master
    }
}
