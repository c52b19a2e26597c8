use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device;

/// Firmware metadata API (release firmwares and device boards).
pub const URL: &str = "https://api.ipsw.me/v4";
/// Beta firmware listings, keyed by identifier.
pub const BETA_URL: &str = "https://api.m1sta.xyz/betas";

pub const BLOBS: &str = "Blobs";
pub const CACHE: &str = "Data/cache";
pub const DATABASE: &str = "Data/autotss.db";
pub const TSSCHECKER: &str = "tsschecker";

/// Generic generators tried for devices without a pinned ApNonce.
pub const FALLBACK_GENERATORS: &[&str] = &["0x1111111111111111", "0xbd34a880be0b53f3"];

pub const SAVE_INTERVAL_SECS: u64 = 30 * 60;
pub const INVOCATION_TIMEOUT_SECS: u64 = 5 * 60;
pub const PROMPT_TIMEOUT_SECS: u64 = 60;
pub const CONCURRENCY: usize = 4;

/// Runtime configuration, read from an optional JSON file.
///
/// Every field falls back to the constant of the same purpose above.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub blobs_dir: PathBuf,
    /// Root under which per-firmware temporary directories are created.
    pub tmp_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub database: PathBuf,
    pub tsschecker: PathBuf,
    pub api_url: String,
    pub beta_api_url: String,
    pub save_interval_secs: u64,
    pub max_devices: usize,
    pub fallback_generators: Vec<String>,
    pub concurrency: usize,
    pub invocation_timeout_secs: u64,
    pub prompt_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blobs_dir: PathBuf::from(BLOBS),
            tmp_dir: std::env::temp_dir(),
            cache_dir: PathBuf::from(CACHE),
            database: PathBuf::from(DATABASE),
            tsschecker: PathBuf::from(TSSCHECKER),
            api_url: URL.to_string(),
            beta_api_url: BETA_URL.to_string(),
            save_interval_secs: SAVE_INTERVAL_SECS,
            max_devices: autotss_registry::DEFAULT_MAX_DEVICES,
            fallback_generators: FALLBACK_GENERATORS.iter().map(|g| g.to_string()).collect(),
            concurrency: CONCURRENCY,
            invocation_timeout_secs: INVOCATION_TIMEOUT_SECS,
            prompt_timeout_secs: PROMPT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Loads the config file at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        let data = fs::read(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Self = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        if config.concurrency == 0 {
            return Err(anyhow!("concurrency must be at least 1"));
        }
        if config.save_interval_secs == 0 {
            return Err(anyhow!("save_interval_secs must be at least 1"));
        }
        if config.fallback_generators.is_empty() {
            return Err(anyhow!("fallback_generators must list at least one generator"));
        }
        config.fallback_generators = config
            .fallback_generators
            .iter()
            .map(|generator| device::validate_generator(generator))
            .collect::<Result<_, _>>()
            .context("invalid fallback_generators")?;

        Ok(config)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.save_interval(), Duration::from_secs(1800));
        assert_eq!(config.fallback_generators, FALLBACK_GENERATORS);
        assert_eq!(config.max_devices, 10);
    }

    #[test]
    fn partial_file_overrides_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_devices": 3, "save_interval_secs": 60}}"#).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.max_devices, 3);
        assert_eq!(config.save_interval(), Duration::from_secs(60));
        assert_eq!(config.api_url, URL);
    }

    #[test]
    fn rejects_unknown_fields_and_zero_concurrency() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_device": 3}}"#).unwrap();
        assert!(Config::load(Some(file.path())).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"concurrency": 0}}"#).unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn rejects_empty_or_malformed_fallback_generators() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"fallback_generators": []}}"#).unwrap();
        assert!(Config::load(Some(file.path())).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"fallback_generators": ["0x1111", "0x1111111111111111"]}}"#).unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn normalizes_fallback_generators() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"fallback_generators": [" 0xBD34A880BE0B53F3 "]}}"#).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.fallback_generators, ["0xbd34a880be0b53f3"]);
    }
}
