use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ApiError;

/// How long the "all devices" listing stays fresh on disk.
const DEVICES_CACHE_SECS: u64 = 10 * 60;
const DEVICES_CACHE_FILE: &str = "devices.bin";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry of the "all devices" listing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CatalogDevice {
    pub name: String,
    pub identifier: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Board {
    pub boardconfig: String,
    pub platform: String,
    pub cpid: u32,
}

/// A device model with its boards and release firmwares.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub identifier: String,
    pub boards: Vec<Board>,
    pub firmwares: Vec<FirmwareRecord>,
}

/// A firmware as listed by the catalog. `signed` changes over time.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FirmwareRecord {
    pub version: String,
    pub buildid: String,
    pub url: String,
    pub signed: bool,
}

/// Beta listings may omit `signed`; such entries are incomplete.
#[derive(Clone, Debug, Deserialize)]
struct BetaRecord {
    version: String,
    buildid: String,
    url: String,
    signed: Option<bool>,
}

/// Source of device and firmware metadata.
#[async_trait]
pub trait FirmwareCatalog: Send + Sync {
    /// Every device model known to the catalog.
    async fn devices(&self) -> Result<Vec<CatalogDevice>, ApiError>;

    async fn device(&self, identifier: &str) -> Result<DeviceInfo, ApiError>;

    /// Release and beta firmwares merged, newest buildid first.
    async fn firmwares(&self, identifier: &str) -> Result<Vec<FirmwareRecord>, ApiError>;

    /// Firmwares Apple is currently signing for `identifier`, newest first.
    async fn signed_firmwares(&self, identifier: &str) -> Result<Vec<FirmwareRecord>, ApiError> {
        let firmwares = self.firmwares(identifier).await?;
        Ok(firmwares.into_iter().filter(|firmware| firmware.signed).collect())
    }
}

/// Combines release and beta listings.
///
/// Betas sharing a buildid with a release are dropped, as are betas without a
/// `signed` field. The result is sorted newest buildid first.
fn merge(releases: Vec<FirmwareRecord>, betas: Vec<BetaRecord>) -> Vec<FirmwareRecord> {
    let mut seen = HashSet::new();
    let mut firmwares: Vec<FirmwareRecord> = releases
        .into_iter()
        .filter(|fw| seen.insert(fw.buildid.clone()))
        .collect();

    for beta in betas {
        let signed = match beta.signed {
            Some(signed) => signed,
            None => continue,
        };
        if !seen.insert(beta.buildid.clone()) {
            continue;
        }
        firmwares.push(FirmwareRecord {
            version: beta.version,
            buildid: beta.buildid,
            url: beta.url,
            signed,
        });
    }

    firmwares.sort_by(|a, b| BuildKey::parse(&b.buildid).cmp(&BuildKey::parse(&a.buildid)));
    firmwares
}

/// Sort key for buildids such as `20H350` or `21A5248v`: major number, train
/// letter, build number, suffix.
#[derive(Debug, Eq, PartialEq)]
struct BuildKey<'a> {
    major: u32,
    train: char,
    build: u32,
    suffix: &'a str,
}

impl<'a> BuildKey<'a> {
    fn parse(buildid: &'a str) -> Self {
        let digits = |s: &'a str| -> (u32, &'a str) {
            let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
            (s[..end].parse().unwrap_or(0), &s[end..])
        };

        let (major, rest) = digits(buildid);
        let mut chars = rest.chars();
        let train = chars.next().unwrap_or('\0');
        let (build, suffix) = digits(chars.as_str());

        Self { major, train, build, suffix }
    }
}

impl Ord for BuildKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.train, self.build, self.suffix)
            .cmp(&(other.major, other.train, other.build, other.suffix))
    }
}

impl PartialOrd for BuildKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Client for the ipsw.me style metadata API plus the beta listing service.
pub struct IpswApi {
    client: reqwest::Client,
    url: String,
    beta_url: String,
    cache_dir: PathBuf,
}

impl IpswApi {
    pub fn new<P: AsRef<Path>>(url: &str, beta_url: &str, cache_dir: P) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ApiError::Request { url: url.to_string(), source })?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            beta_url: beta_url.trim_end_matches('/').to_string(),
            cache_dir: cache_dir.as_ref().to_owned(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, ApiError> {
        log::debug!("GET {}", url);
        let response = match self.client.get(&url).send().await {
            Ok(ok) => ok,
            Err(source) => return Err(ApiError::Request { url, source }),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { url, status: status.as_u16() });
        }

        response.json().await.map_err(|source| ApiError::Decode { url, source })
    }

    async fn betas(&self, identifier: &str) -> Vec<BetaRecord> {
        let url = format!("{}/{}", self.beta_url, identifier);
        match self.get_json(url).await {
            Ok(ok) => ok,
            Err(err) => {
                log::debug!("no betas for {}: {}", identifier, err);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl FirmwareCatalog for IpswApi {
    async fn devices(&self) -> Result<Vec<CatalogDevice>, ApiError> {
        let cache_path = self.cache_dir.join(DEVICES_CACHE_FILE);
        if let Some(devices) = cache::read(&cache_path, DEVICES_CACHE_SECS) {
            return Ok(devices);
        }

        let devices: Vec<CatalogDevice> = self.get_json(format!("{}/devices", self.url)).await?;
        if let Err(err) = cache::write(&cache_path, &devices) {
            log::warn!("failed to cache device list: {:#}", err);
        }
        Ok(devices)
    }

    async fn device(&self, identifier: &str) -> Result<DeviceInfo, ApiError> {
        self.get_json(format!("{}/device/{}?type=ipsw", self.url, identifier))
            .await
    }

    async fn firmwares(&self, identifier: &str) -> Result<Vec<FirmwareRecord>, ApiError> {
        let releases = self.device(identifier).await?.firmwares;
        let betas = self.betas(identifier).await;
        Ok(merge(releases, betas))
    }
}

/// Bincode snapshots on disk, considered stale by modification time.
mod cache {
    use anyhow::Context;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use std::fs::{self, File};
    use std::path::Path;

    use super::timestamp;

    /// Returns the cached value if `path` exists, is younger than `max_age`
    /// seconds and deserializes.
    pub fn read<T: DeserializeOwned>(path: &Path, max_age: u64) -> Option<T> {
        let result: anyhow::Result<T> = (|| {
            let modified = timestamp::modified_since_unix(path)
                .context("could not get modified time")?;

            if timestamp::exceeded(modified, timestamp::current(), max_age) {
                return Err(anyhow!("timestamp exceeded"));
            }

            let file = File::open(path).context("failed to read cache")?;
            bincode::deserialize_from(file).context("failed to deserialize cache")
        })();

        match result {
            Ok(value) => Some(value),
            Err(err) => {
                log::debug!("cache {} unusable: {:#}", path.display(), err);
                None
            }
        }
    }

    pub fn write<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = File::create(path).context("failed to create cache file")?;
        bincode::serialize_into(file, value).context("failed to write cache")
    }
}

mod timestamp {
    use std::{io, path::Path, time::{Duration, SystemTime}};

    pub fn current() -> u64 {
        seconds_since_unix(SystemTime::now())
    }

    pub fn modified_since_unix(path: &Path) -> io::Result<u64> {
        path.metadata()
            .and_then(|md| md.modified())
            .map(seconds_since_unix)
    }

    pub fn seconds_since_unix(time: SystemTime) -> u64 {
        time.duration_since(SystemTime::UNIX_EPOCH)
            .as_ref()
            .map(Duration::as_secs)
            .unwrap_or(0)
    }

    pub fn exceeded(last: u64, current: u64, limit: u64) -> bool {
        current == 0 || last > current || current - last > limit
    }
}
