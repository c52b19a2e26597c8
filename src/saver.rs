use autotss_registry::{Device, DeviceStore, Ecid, Error as RegistryError, SavedBlob, Scope, UserId};
use futures::{stream, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::FirmwareCatalog;
use crate::error::SaveError;
use crate::lock::{RunGuard, RunLock};
use crate::report::{DeviceReport, SaveReport};
use crate::tsschecker::TicketSaver;

/// What started a save run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger {
    /// A user asked for it; fails with [`SaveError::InProgress`] instead of
    /// waiting for a running save.
    Manual,
    /// The periodic loop; waits for a running save to finish.
    Background,
}

/// Saves signing tickets for every signed firmware a device is missing.
///
/// At most one run is active at a time, whatever its trigger, across every
/// saver sharing the same [`RunLock`] file.
pub struct BlobSaver {
    catalog: Arc<dyn FirmwareCatalog>,
    store: Arc<dyn DeviceStore>,
    tickets: Arc<dyn TicketSaver>,
    tmp_dir: PathBuf,
    concurrency: usize,
    lock: RunLock,
}

impl BlobSaver {
    pub fn new(
        catalog: Arc<dyn FirmwareCatalog>,
        store: Arc<dyn DeviceStore>,
        tickets: Arc<dyn TicketSaver>,
        tmp_dir: PathBuf,
        concurrency: usize,
        lock: RunLock,
    ) -> Self {
        Self {
            catalog,
            store,
            tickets,
            tmp_dir,
            concurrency: concurrency.max(1),
            lock,
        }
    }

    /// Saves for the devices of every enabled user.
    pub async fn save_all(&self, trigger: Trigger) -> Result<SaveReport, SaveError> {
        let _guard = self.acquire(trigger).await?;
        let devices = self.store.devices(Scope::Enabled)?;
        Ok(self.save_devices(devices).await)
    }

    /// Saves for one user's devices, enabled or not.
    pub async fn save_user(&self, user: UserId, trigger: Trigger) -> Result<SaveReport, SaveError> {
        let _guard = self.acquire(trigger).await?;
        let devices = self.store.devices(Scope::User(user))?;
        Ok(self.save_devices(devices).await)
    }

    pub async fn save_device(&self, ecid: &Ecid, trigger: Trigger) -> Result<SaveReport, SaveError> {
        let _guard = self.acquire(trigger).await?;
        let device = self
            .store
            .device(ecid)?
            .ok_or_else(|| RegistryError::NotFound(ecid.clone()))?;
        Ok(self.save_devices(vec![device]).await)
    }

    async fn acquire(&self, trigger: Trigger) -> Result<RunGuard, SaveError> {
        match trigger {
            Trigger::Manual => self.lock.try_acquire()?.ok_or(SaveError::InProgress),
            Trigger::Background => {
                let guard = self.lock.acquire().await?;
                log::debug!("acquired {}", self.lock.path().display());
                Ok(guard)
            }
        }
    }

    async fn save_devices(&self, devices: Vec<Device>) -> SaveReport {
        if let Err(err) = tokio::fs::create_dir_all(&self.tmp_dir).await {
            log::warn!("failed to create {}: {}", self.tmp_dir.display(), err);
        }

        let devices = stream::iter(devices)
            .map(|device| self.save_isolated(device))
            .buffered(self.concurrency)
            .collect()
            .await;

        SaveReport { devices }
    }

    /// Turns a panic while saving one device into a failure of that device.
    async fn save_isolated(&self, device: Device) -> DeviceReport {
        let mut fallback = DeviceReport::new(device.ecid.clone(), device.name.clone());
        match AssertUnwindSafe(self.save_one(device)).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                log::error!("{} ({}): save panicked", fallback.name, fallback.ecid);
                fallback.error = Some("unexpected error while saving".to_string());
                fallback
            }
        }
    }

    async fn save_one(&self, mut device: Device) -> DeviceReport {
        let mut report = DeviceReport::new(device.ecid.clone(), device.name.clone());

        let firmwares = match self.catalog.signed_firmwares(&device.identifier).await {
            Ok(ok) => ok,
            Err(err) => {
                let err = anyhow::Error::new(err);
                log::warn!("{} ({}): failed to get signed firmwares: {:#}", device.name, device.ecid, err);
                report.error = Some(format!("{:#}", err));
                return report;
            }
        };

        let missing: Vec<_> = firmwares
            .into_iter()
            .filter(|firmware| !device.has_blob(&firmware.buildid))
            .collect();
        if missing.is_empty() {
            log::debug!("{} ({}): nothing to save", device.name, device.ecid);
            return report;
        }

        for firmware in missing {
            let blob = SavedBlob {
                version: firmware.version.clone(),
                buildid: firmware.buildid.clone(),
            };

            let tmp = match tempfile::Builder::new().prefix("autotss").tempdir_in(&self.tmp_dir) {
                Ok(ok) => ok,
                Err(err) => {
                    log::warn!("failed to create temporary directory in {}: {}", self.tmp_dir.display(), err);
                    report.failed.push(blob);
                    continue;
                }
            };

            if self.tickets.save(&device, &firmware, tmp.path()).await {
                log::info!(
                    "{} ({}): saved {} ({})",
                    device.name, device.ecid, firmware.version, firmware.buildid
                );
                device.saved_blobs.push(blob.clone());
                report.saved.push(blob);
            } else {
                report.failed.push(blob);
            }
        }

        if !report.saved.is_empty() {
            if let Err(err) = self.store.update_saved_blobs(&device.ecid, &device.saved_blobs) {
                let err = anyhow::Error::new(err);
                log::error!("{} ({}): failed to record saved blobs: {:#}", device.name, device.ecid, err);
                report.error = Some(format!("{:#}", err));
            }
        }

        report
    }
}
