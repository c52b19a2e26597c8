use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};

use crate::report::SaveReport;
use crate::saver::{BlobSaver, Trigger};

fn log_summary(report: &SaveReport) {
    if report.blobs_failed() > 0 {
        log::warn!("{} blobs failed to save", report.blobs_failed());
    }

    if report.blobs_saved() == 0 {
        log::info!("no new blobs to save");
        return;
    }

    log::info!(
        "saved {} blobs for {} devices",
        report.blobs_saved(),
        report.devices_saved_for()
    );
}

/// Saves for every enabled user's devices once per `interval`.
///
/// Nothing runs until `ready` turns true; the first run follows immediately.
/// `shutdown` is only observed between runs, so a run in progress always
/// completes. Returns early if the readiness sender is dropped first.
pub async fn run(saver: &BlobSaver, interval: Duration, mut ready: watch::Receiver<bool>, shutdown: &Notify) {
    tokio::select! {
        ok = async { ready.wait_for(|ready| *ready).await.is_ok() } => {
            if !ok {
                log::warn!("readiness signal dropped, background saving disabled");
                return;
            }
        }
        _ = shutdown.notified() => return,
    }

    log::info!("saving blobs every {}s", interval.as_secs());
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match saver.save_all(Trigger::Background).await {
                    Ok(report) => log_summary(&report),
                    Err(err) => log::error!("background save failed: {:#}", anyhow::Error::new(err)),
                }
            }
            _ = shutdown.notified() => {
                log::info!("background saving stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogDevice, DeviceInfo, FirmwareCatalog, FirmwareRecord};
    use crate::error::ApiError;
    use crate::lock::RunLock;
    use crate::tsschecker::TicketSaver;
    use async_trait::async_trait;
    use autotss_registry::{Device, DeviceStore, Ecid, SqliteStore};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Catalog;

    #[async_trait]
    impl FirmwareCatalog for Catalog {
        async fn devices(&self) -> Result<Vec<CatalogDevice>, ApiError> {
            Ok(Vec::new())
        }

        async fn device(&self, _identifier: &str) -> Result<DeviceInfo, ApiError> {
            unimplemented!()
        }

        async fn firmwares(&self, _identifier: &str) -> Result<Vec<FirmwareRecord>, ApiError> {
            Ok(vec![FirmwareRecord {
                version: "17.0".to_string(),
                buildid: "21A329".to_string(),
                url: "https://example.com/fw.ipsw".to_string(),
                signed: true,
            }])
        }
    }

    /// Never succeeds, so every run retries and counts one call.
    #[derive(Default)]
    struct Failing(AtomicUsize);

    #[async_trait]
    impl TicketSaver for Failing {
        async fn save(&self, _device: &Device, _firmware: &FirmwareRecord, _tmp: &Path) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn saver(dir: &Path, tickets: Arc<Failing>) -> Arc<BlobSaver> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add(
                1,
                &Device {
                    name: "phone".to_string(),
                    identifier: "iPhone10,6".to_string(),
                    boardconfig: "d221ap".to_string(),
                    cpid: 0x8015,
                    ecid: Ecid::parse("abcdef0123").unwrap(),
                    generator: None,
                    apnonce: None,
                    saved_blobs: Vec::new(),
                },
            )
            .unwrap();

        Arc::new(BlobSaver::new(
            Arc::new(Catalog),
            Arc::new(store),
            tickets,
            dir.join("tmp"),
            1,
            RunLock::new(dir.join("autotss.lock")),
        ))
    }

    #[tokio::test]
    async fn waits_for_readiness_then_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let tickets = Arc::new(Failing::default());
        let saver = saver(dir.path(), tickets.clone());
        let (ready_tx, ready_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());

        let task = {
            let saver = saver.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run(&saver, Duration::from_millis(20), ready_rx, &shutdown).await;
            })
        };

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tickets.0.load(Ordering::SeqCst), 0);

        ready_tx.send_replace(true);
        time::timeout(Duration::from_secs(5), async {
            while tickets.0.load(Ordering::SeqCst) < 2 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.notify_one();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stops_when_readiness_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let tickets = Arc::new(Failing::default());
        let saver = saver(dir.path(), tickets.clone());
        let (ready_tx, ready_rx) = watch::channel(false);
        drop(ready_tx);

        run(&saver, Duration::from_millis(20), ready_rx, &Notify::new()).await;
        assert_eq!(tickets.0.load(Ordering::SeqCst), 0);
    }
}
