use autotss_registry::{Ecid, SavedBlob};
use std::fmt;

/// Outcome of one save run for a single device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceReport {
    pub ecid: Ecid,
    pub name: String,
    pub saved: Vec<SavedBlob>,
    pub failed: Vec<SavedBlob>,
    /// Set when the device could not be processed at all this run.
    pub error: Option<String>,
}

impl DeviceReport {
    pub fn new(ecid: Ecid, name: String) -> Self {
        Self {
            ecid,
            name,
            saved: Vec::new(),
            failed: Vec::new(),
            error: None,
        }
    }
}

/// Outcome of one save run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaveReport {
    pub devices: Vec<DeviceReport>,
}

impl SaveReport {
    /// Number of tickets newly saved across all devices.
    pub fn blobs_saved(&self) -> usize {
        self.devices.iter().map(|device| device.saved.len()).sum()
    }

    /// Number of devices that gained at least one ticket.
    pub fn devices_saved_for(&self) -> usize {
        self.devices
            .iter()
            .filter(|device| !device.saved.is_empty())
            .count()
    }

    /// Number of firmwares a save was attempted for and failed.
    pub fn blobs_failed(&self) -> usize {
        self.devices.iter().map(|device| device.failed.len()).sum()
    }
}

fn versions(blobs: &[SavedBlob]) -> String {
    blobs
        .iter()
        .map(|blob| format!("{} ({})", blob.version, blob.buildid))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for SaveReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let saved = self.blobs_saved();
        if saved == 0 {
            write!(f, "No new blobs were saved.")?;
        } else {
            write!(
                f,
                "Saved {} blob{} for {} device{}.",
                saved,
                if saved == 1 { "" } else { "s" },
                self.devices_saved_for(),
                if self.devices_saved_for() == 1 { "" } else { "s" },
            )?;
        }

        let failed = self.blobs_failed();
        if failed > 0 {
            write!(f, " {} failed.", failed)?;
        }

        for device in &self.devices {
            if device.saved.is_empty() && device.failed.is_empty() && device.error.is_none() {
                continue;
            }

            write!(f, "\n{} ({}):", device.name, device.ecid)?;
            if !device.saved.is_empty() {
                write!(f, "\n  saved: {}", versions(&device.saved))?;
            }
            if !device.failed.is_empty() {
                write!(f, "\n  failed: {}", versions(&device.failed))?;
            }
            if let Some(error) = &device.error {
                write!(f, "\n  error: {}", error)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(version: &str, buildid: &str) -> SavedBlob {
        SavedBlob {
            version: version.to_string(),
            buildid: buildid.to_string(),
        }
    }

    fn report() -> SaveReport {
        let mut first = DeviceReport::new(Ecid::parse("abcdef0123").unwrap(), "phone".to_string());
        first.saved = vec![blob("17.0", "21A329"), blob("16.7", "20H19")];
        first.failed = vec![blob("17.1", "21B74")];

        let mut second = DeviceReport::new(Ecid::parse("1234567890").unwrap(), "pad".to_string());
        second.error = Some("catalog unavailable".to_string());

        let third = DeviceReport::new(Ecid::parse("1234567891").unwrap(), "pod".to_string());

        SaveReport {
            devices: vec![first, second, third],
        }
    }

    #[test]
    fn counts() {
        let report = report();
        assert_eq!(report.blobs_saved(), 2);
        assert_eq!(report.blobs_failed(), 1);
        assert_eq!(report.devices_saved_for(), 1);
        assert_eq!(SaveReport::default().blobs_saved(), 0);
    }

    #[test]
    fn renders_only_devices_with_news() {
        let rendered = report().to_string();
        assert!(rendered.starts_with("Saved 2 blobs for 1 device. 1 failed.\n"));
        assert!(rendered.contains("phone (abcdef0123):\n  saved: 17.0 (21A329), 16.7 (20H19)\n  failed: 17.1 (21B74)"));
        assert!(rendered.contains("pad (1234567890):\n  error: catalog unavailable"));
        assert!(!rendered.contains("pod"));
    }

    #[test]
    fn renders_empty_run() {
        assert_eq!(SaveReport::default().to_string(), "No new blobs were saved.");
    }

    #[test]
    fn renders_failures_without_saves() {
        let mut device = DeviceReport::new(Ecid::parse("abcdef0123").unwrap(), "phone".to_string());
        device.failed = vec![blob("17.1", "21B74"), blob("17.0", "21A329")];
        let report = SaveReport { devices: vec![device] };

        assert_eq!(
            report.to_string(),
            "No new blobs were saved. 2 failed.\nphone (abcdef0123):\n  failed: 17.1 (21B74), 17.0 (21A329)"
        );
    }
}
