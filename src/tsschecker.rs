use anyhow::Context;
use async_trait::async_trait;
use autotss_registry::Device;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::{fs, process, time};

use crate::catalog::FirmwareRecord;
use crate::manifest::{ManifestSource, BUILD_MANIFEST};
use crate::util;

/// Printed by tsschecker once tickets have been written.
pub const SUCCESS_MARKER: &str = "Saved shsh blobs!";

/// Storage directory for tickets saved with the fallback generators.
pub const NO_APNONCE: &str = "no-apnonce";

/// Outcome of one run of the external tool.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub success: bool,
    pub output: String,
}

impl Invocation {
    fn failed(output: String) -> Self {
        Self { success: false, output }
    }
}

/// Runs `program` and reports whether its standard output carries
/// [`SUCCESS_MARKER`]. The exit status is not consulted. A run exceeding
/// `timeout` is killed and counts as a failure.
pub async fn invoke(program: &Path, args: &[OsString], timeout: Duration) -> Invocation {
    let mut command = process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match time::timeout(timeout, command.output()).await {
        Ok(Ok(ok)) => ok,
        Ok(Err(err)) => {
            return Invocation::failed(format!("failed to run {}: {}", program.display(), err));
        }
        Err(_) => {
            return Invocation::failed(format!(
                "{} timed out after {}s",
                program.display(),
                timeout.as_secs_f32()
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    Invocation {
        success: stdout.contains(SUCCESS_MARKER),
        output: stdout,
    }
}

/// One storage subdirectory and the nonce arguments of each run that fills it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NonceContext {
    pub dir: String,
    pub runs: Vec<Vec<String>>,
}

impl NonceContext {
    /// Ticket files a complete directory holds: one per run.
    pub fn expected(&self) -> usize {
        self.runs.len()
    }
}

/// Decides which tsschecker runs a device needs for one firmware.
///
/// A pinned ApNonce gets exactly one run. Otherwise every fallback generator
/// runs into `no-apnonce`, plus the device's own generator into a directory
/// of its own when it is not one of the fallbacks. Every context returned
/// has at least one run.
pub fn nonce_contexts(device: &Device, fallback_generators: &[String]) -> Vec<NonceContext> {
    if let Some(apnonce) = &device.apnonce {
        let mut args = vec!["--apnonce".to_string(), apnonce.clone()];
        if let Some(generator) = &device.generator {
            args.extend(["-g".to_string(), generator.clone()]);
        }
        return vec![NonceContext {
            dir: apnonce.clone(),
            runs: vec![args],
        }];
    }

    let mut contexts = Vec::new();
    if !fallback_generators.is_empty() {
        contexts.push(NonceContext {
            dir: NO_APNONCE.to_string(),
            runs: fallback_generators
                .iter()
                .map(|generator| vec!["-g".to_string(), generator.clone()])
                .collect(),
        });
    }

    if let Some(generator) = &device.generator {
        if !fallback_generators.contains(generator) {
            contexts.push(NonceContext {
                dir: generator.clone(),
                runs: vec![vec!["-g".to_string(), generator.clone()]],
            });
        }
    }

    contexts
}

/// Obtains signing tickets for one device and firmware.
#[async_trait]
pub trait TicketSaver: Send + Sync {
    /// Returns whether tickets for this firmware are now in permanent storage,
    /// either freshly saved or already present. `tmp` is a scratch directory
    /// owned by the caller for this call only.
    async fn save(&self, device: &Device, firmware: &FirmwareRecord, tmp: &Path) -> bool;
}

/// [`TicketSaver`] backed by the tsschecker executable.
///
/// Tickets are stored under `<blobs>/<ecid>/<version>/<nonce-context>/`.
pub struct Tsschecker {
    program: PathBuf,
    blobs_dir: PathBuf,
    fallback_generators: Vec<String>,
    timeout: Duration,
    manifests: Arc<dyn ManifestSource>,
}

impl Tsschecker {
    pub fn new(
        program: PathBuf,
        blobs_dir: PathBuf,
        fallback_generators: Vec<String>,
        timeout: Duration,
        manifests: Arc<dyn ManifestSource>,
    ) -> Self {
        Self {
            program,
            blobs_dir,
            fallback_generators,
            timeout,
            manifests,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn args(&self, device: &Device, manifest: &Path, save_path: &Path, nonce: &[String]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-d".into(),
            device.identifier.clone().into(),
            "-B".into(),
            device.boardconfig.clone().into(),
            "-e".into(),
            format!("0x{}", device.ecid).into(),
            "-m".into(),
            manifest.into(),
            "-s".into(),
            "--save-path".into(),
            save_path.into(),
        ];
        args.extend(nonce.iter().map(OsString::from));
        args
    }

    async fn try_save(&self, device: &Device, firmware: &FirmwareRecord, tmp: &Path) -> anyhow::Result<bool> {
        let firmware_dir = self
            .blobs_dir
            .join(device.ecid.as_str())
            .join(&firmware.version);

        let mut saved = false;
        let mut pending = Vec::new();
        for context in nonce_contexts(device, &self.fallback_generators) {
            let dest = firmware_dir.join(&context.dir);
            let existing = util::tickets(&dest).await?;

            if existing.len() == context.expected() {
                log::debug!(
                    "{} ({}): {} already saved for {}",
                    device.name, device.ecid, firmware.version, context.dir
                );
                saved = true;
                continue;
            }

            if !existing.is_empty() {
                log::info!(
                    "removing {} stale tickets in {}",
                    existing.len(),
                    dest.display()
                );
                for ticket in existing {
                    fs::remove_file(&ticket)
                        .await
                        .with_context(|| format!("failed to remove {}", ticket.display()))?;
                }
            }

            pending.push((context, dest));
        }

        if pending.is_empty() {
            return Ok(saved);
        }

        let manifest = tmp.join(BUILD_MANIFEST);
        self.manifests
            .fetch(firmware, &manifest)
            .await
            .with_context(|| format!("failed to get manifest for {}", firmware.buildid))?;

        for (context, dest) in pending {
            let save_path = tmp.join(&context.dir);
            fs::create_dir_all(&save_path)
                .await
                .with_context(|| format!("failed to create {}", save_path.display()))?;

            for nonce in &context.runs {
                let args = self.args(device, &manifest, &save_path, nonce);
                let invocation = invoke(&self.program, &args, self.timeout).await;
                if !invocation.success {
                    log::warn!(
                        "{} ({}): tsschecker failed for {} ({}) with {:?}: {}",
                        device.name,
                        device.ecid,
                        firmware.version,
                        firmware.buildid,
                        nonce,
                        invocation.output.trim()
                    );
                    continue;
                }

                let tickets = util::tickets(&save_path).await?;
                if tickets.is_empty() {
                    continue;
                }

                fs::create_dir_all(&dest)
                    .await
                    .with_context(|| format!("failed to create {}", dest.display()))?;
                for ticket in tickets {
                    let name = ticket
                        .file_name()
                        .ok_or_else(|| anyhow!("invalid ticket path {}", ticket.display()))?;
                    util::move_file(&ticket, &dest.join(name))
                        .await
                        .with_context(|| format!("failed to move {}", ticket.display()))?;
                }
                saved = true;
            }
        }

        Ok(saved)
    }
}

#[async_trait]
impl TicketSaver for Tsschecker {
    async fn save(&self, device: &Device, firmware: &FirmwareRecord, tmp: &Path) -> bool {
        match self.try_save(device, firmware, tmp).await {
            Ok(saved) => saved,
            Err(err) => {
                log::warn!(
                    "{} ({}): failed to save {} ({}): {:#}",
                    device.name, device.ecid, firmware.version, firmware.buildid, err
                );
                false
            }
        }
    }
}
