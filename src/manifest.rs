use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use crate::catalog::FirmwareRecord;

pub const BUILD_MANIFEST: &str = "BuildManifest.plist";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Bytes fetched per range request when reading the remote archive.
const CHUNK_SIZE: u64 = 256 * 1024;

/// Produces the BuildManifest of a firmware at a local path.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, firmware: &FirmwareRecord, dest: &Path) -> anyhow::Result<()>;
}

/// Fetches manifests over HTTP.
///
/// Tries the `BuildManifest.plist` published next to the firmware first, then
/// reads it out of the firmware archive itself with range requests.
pub struct RemoteManifests {
    client: reqwest::Client,
}

impl RemoteManifests {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn fetch_direct(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let data = response.bytes().await?;
        tokio::fs::write(dest, &data)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))
    }
}

#[async_trait]
impl ManifestSource for RemoteManifests {
    async fn fetch(&self, firmware: &FirmwareRecord, dest: &Path) -> anyhow::Result<()> {
        if let Some(url) = sibling_url(&firmware.url) {
            match self.fetch_direct(&url, dest).await {
                Ok(()) => return Ok(()),
                Err(err) => log::debug!("direct manifest fetch for {} failed: {:#}", firmware.buildid, err),
            }
        }

        let url = firmware.url.clone();
        let dest = dest.to_owned();
        tokio::task::spawn_blocking(move || {
            let remote = RemoteFile::open(&url)?;
            extract(remote, &dest)
        })
        .await
        .context("manifest extraction task panicked")?
        .with_context(|| format!("failed to extract manifest from {}", firmware.url))
    }
}

/// URL of the manifest published alongside a firmware file.
fn sibling_url(url: &str) -> Option<String> {
    let (base, file) = url.rsplit_once('/')?;
    if file.is_empty() || base.ends_with('/') {
        return None;
    }
    Some(format!("{}/{}", base, BUILD_MANIFEST))
}

/// Copies the archive's BuildManifest to `dest`. OTA archives nest it, so the
/// entry is matched by file name and the shallowest match wins.
fn extract<R: Read + Seek>(reader: R, dest: &Path) -> anyhow::Result<()> {
    let mut archive = zip::ZipArchive::new(reader).context("failed to read archive")?;

    let nested = format!("/{}", BUILD_MANIFEST);
    let name = archive
        .file_names()
        .filter(|name| *name == BUILD_MANIFEST || name.ends_with(&nested))
        .min_by_key(|name| name.len())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("{} not found in archive", BUILD_MANIFEST))?;

    let mut entry = archive.by_name(&name)?;
    let mut file = File::create(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;
    io::copy(&mut entry, &mut file).context("failed to write manifest")?;
    Ok(())
}

/// Read-only random access to a remote file through HTTP range requests.
struct RemoteFile {
    client: reqwest::blocking::Client,
    url: String,
    len: u64,
    pos: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
}

impl RemoteFile {
    fn open(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        let response = client.head(url).send()?.error_for_status()?;
        let len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| anyhow!("{} did not report a length", url))?;

        Ok(Self {
            client,
            url: url.to_string(),
            len,
            pos: 0,
            buffer: Vec::new(),
            buffer_start: 0,
        })
    }

    fn buffered(&self) -> bool {
        self.pos >= self.buffer_start && self.pos < self.buffer_start + self.buffer.len() as u64
    }

    fn fill(&mut self) -> io::Result<()> {
        let end = (self.pos + CHUNK_SIZE).min(self.len) - 1;
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", self.pos, end))
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

        if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} does not support range requests", self.url),
            ));
        }

        let data = response
            .bytes()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        self.buffer = data.to_vec();
        self.buffer_start = self.pos;
        Ok(())
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }

        if !self.buffered() {
            self.fill()?;
            if self.buffer.is_empty() {
                return Ok(0);
            }
        }

        let offset = (self.pos - self.buffer_start) as usize;
        let available = &self.buffer[offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.pos += count as u64;
        Ok(count)
    }
}

impl Seek for RemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.len.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.pos.checked_add_signed(offset),
        };

        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &str)]) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn sibling_url_replaces_file_name() {
        assert_eq!(
            sibling_url("https://updates.cdn-apple.com/2023/x/iPhone_4.7_P3_16.7_20H19_Restore.ipsw").as_deref(),
            Some("https://updates.cdn-apple.com/2023/x/BuildManifest.plist")
        );
        assert_eq!(sibling_url("https://example.com/"), None);
        assert_eq!(sibling_url("no-slashes"), None);
    }

    #[test]
    fn extracts_top_level_manifest() {
        let zip = archive(&[
            ("Firmware/all_flash/BuildManifest.plist", "nested"),
            ("BuildManifest.plist", "top"),
            ("Restore.plist", "other"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join(BUILD_MANIFEST);

        extract(zip, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"top");
    }

    #[test]
    fn extracts_nested_ota_manifest() {
        let zip = archive(&[("AssetData/boot/BuildManifest.plist", "ota")]);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join(BUILD_MANIFEST);

        extract(zip, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"ota");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let zip = archive(&[("NotBuildManifest.plist.bak", "x")]);
        let dir = tempfile::tempdir().unwrap();
        assert!(extract(zip, &dir.path().join(BUILD_MANIFEST)).is_err());
    }

    mod http {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, Request, ResponseTemplate};

        fn firmware(server: &MockServer) -> FirmwareRecord {
            FirmwareRecord {
                version: "16.7.10".to_string(),
                buildid: "20H350".to_string(),
                url: format!("{}/fw/iPhone_4.7_P3_16.7.10_20H350_Restore.ipsw", server.uri()),
                signed: true,
            }
        }

        /// Serves `data` the way a CDN does: whole on HEAD or plain GET, a
        /// slice with 206 when a `Range` header is sent.
        fn ranged(data: Vec<u8>) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
            move |request: &Request| {
                let range = request
                    .headers
                    .get("range")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.strip_prefix("bytes="))
                    .and_then(|value| value.split_once('-'))
                    .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));

                match range {
                    Some((start, end)) => {
                        let end = end.min(data.len() - 1);
                        ResponseTemplate::new(206)
                            .insert_header("content-range", format!("bytes {}-{}/{}", start, end, data.len()).as_str())
                            .set_body_bytes(data[start..=end].to_vec())
                    }
                    None => ResponseTemplate::new(200).set_body_bytes(data.clone()),
                }
            }
        }

        async fn mount_missing_sibling(server: &MockServer) {
            Mock::given(path("/fw/BuildManifest.plist"))
                .respond_with(ResponseTemplate::new(404))
                .mount(server)
                .await;
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn sibling_manifest_is_preferred() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/fw/BuildManifest.plist"))
                .respond_with(ResponseTemplate::new(200).set_body_string("direct"))
                .mount(&server)
                .await;
            Mock::given(path("/fw/iPhone_4.7_P3_16.7.10_20H350_Restore.ipsw"))
                .respond_with(ResponseTemplate::new(500))
                .expect(0)
                .mount(&server)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join(BUILD_MANIFEST);
            RemoteManifests::new().unwrap().fetch(&firmware(&server), &dest).await.unwrap();
            assert_eq!(std::fs::read(&dest).unwrap(), b"direct");
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn falls_back_to_reading_the_archive() {
            let server = MockServer::start().await;
            mount_missing_sibling(&server).await;
            let zip = archive(&[
                ("Restore.plist", "other"),
                ("BuildManifest.plist", "from archive"),
            ])
            .into_inner();
            Mock::given(path("/fw/iPhone_4.7_P3_16.7.10_20H350_Restore.ipsw"))
                .respond_with(ranged(zip))
                .mount(&server)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join(BUILD_MANIFEST);
            RemoteManifests::new().unwrap().fetch(&firmware(&server), &dest).await.unwrap();
            assert_eq!(std::fs::read(&dest).unwrap(), b"from archive");
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn server_ignoring_ranges_is_an_error() {
            let server = MockServer::start().await;
            mount_missing_sibling(&server).await;
            let zip = archive(&[("BuildManifest.plist", "from archive")]).into_inner();
            Mock::given(path("/fw/iPhone_4.7_P3_16.7.10_20H350_Restore.ipsw"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(zip))
                .mount(&server)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join(BUILD_MANIFEST);
            let result = RemoteManifests::new().unwrap().fetch(&firmware(&server), &dest).await;
            assert!(result.is_err());
            assert!(!dest.exists());
        }
    }
}
