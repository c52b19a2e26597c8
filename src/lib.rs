#[macro_use]
extern crate anyhow;

use anyhow::Context;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod report;
pub mod saver;
pub mod schedule;
pub mod tsschecker;
pub mod util;

pub use autotss_registry as registry;
pub use autotss_registry::{Device, DeviceStore, Ecid, SavedBlob, Scope, SqliteStore, UserId};

pub use crate::catalog::{FirmwareCatalog, FirmwareRecord, IpswApi};
pub use crate::config::Config;
pub use crate::device::DeviceBuilder;
pub use crate::error::{ApiError, SaveError, ValidationError};
pub use crate::lock::RunLock;
pub use crate::manifest::RemoteManifests;
pub use crate::report::{DeviceReport, SaveReport};
pub use crate::saver::{BlobSaver, Trigger};
pub use crate::tsschecker::{TicketSaver, Tsschecker};

/// Everything a front end needs, wired from one [`Config`].
pub struct Services {
    pub catalog: Arc<IpswApi>,
    pub store: Arc<SqliteStore>,
    pub tsschecker: Arc<Tsschecker>,
    pub saver: Arc<BlobSaver>,
}

impl Services {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        if let Some(parent) = config.database.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let store = SqliteStore::open(&config.database)
            .with_context(|| format!("failed to open {}", config.database.display()))?
            .with_max_devices(config.max_devices);
        let store = Arc::new(store);

        let catalog = Arc::new(IpswApi::new(&config.api_url, &config.beta_api_url, &config.cache_dir)?);

        let tsschecker = Arc::new(Tsschecker::new(
            config.tsschecker.clone(),
            config.blobs_dir.clone(),
            config.fallback_generators.clone(),
            config.invocation_timeout(),
            Arc::new(RemoteManifests::new()?),
        ));

        let saver = Arc::new(BlobSaver::new(
            catalog.clone(),
            store.clone(),
            tsschecker.clone(),
            config.tmp_dir.clone(),
            config.concurrency,
            RunLock::new(config.database.with_extension("lock")),
        ));

        Ok(Self {
            catalog,
            store,
            tsschecker,
            saver,
        })
    }
}

/// Checks that `program` runs at all. tsschecker prints its usage when
/// called without arguments, so only a failure to start counts.
pub async fn check_tool(program: &Path) -> anyhow::Result<()> {
    tokio::process::Command::new(program)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("failed to run {}", program.display()))?;
    Ok(())
}
