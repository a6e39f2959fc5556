//! Device-side operations: installing packages, mounting runtime-support
//! images, and attaching a debugger for JIT enablement.
//!
//! The transport is a trait so the pipeline can be exercised end to end
//! without hardware. The production transport shells out to the
//! libimobiledevice tools.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{info, warn};
use tokio::process::Command;

use crate::disk::DeveloperDiskManager;
use crate::portal::types::Device;

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Install the packaged `.ipa` at `package` onto the device.
    ///
    /// When `active_profiles` is set, the device is told to treat exactly that
    /// set of profiles as active and may remove profiles outside it. Free-tier
    /// accounts are limited in how many profiles may be active at once.
    async fn install_app(
        &self,
        package: &Path,
        device_id: &str,
        active_profiles: Option<&HashSet<String>>,
    ) -> Result<()>;

    async fn is_runtime_image_mounted(&self, device: &Device) -> Result<bool>;

    async fn install_runtime_image(
        &self,
        disk: &Path,
        signature: &Path,
        device: &Device,
    ) -> Result<()>;

    async fn start_debug_session(&self, device: &Device) -> Result<Box<dyn DebugSession>>;
}

/// A live debugger connection to the device.
#[async_trait]
pub trait DebugSession: Send + Sync {
    /// Attach to `process_name` and flip it into allowing unsigned (JIT)
    /// code, then detach without killing the process.
    async fn enable_unsigned_execution(&self, process_name: &str) -> Result<()>;
}

/// Ensure the device has a runtime-support image mounted, fetching the
/// matching image first when needed. Required before any debug session.
pub async fn prepare(
    transport: &dyn DeviceTransport,
    disks: &DeveloperDiskManager,
    device: &Device,
) -> Result<()> {
    if transport.is_runtime_image_mounted(device).await? {
        info!("runtime image already mounted on {}", device.name);
        return Ok(());
    }

    let image = disks.fetch_disk(device).await?;
    transport
        .install_runtime_image(&image.disk, &image.signature, device)
        .await
}

/// Enable JIT for an already-installed app by attaching a debugger to it.
pub async fn enable_jit(
    transport: &dyn DeviceTransport,
    disks: &DeveloperDiskManager,
    device: &Device,
    process_name: &str,
) -> Result<()> {
    prepare(transport, disks, device).await?;

    let session = transport.start_debug_session(device).await?;
    session.enable_unsigned_execution(process_name).await?;

    info!("enabled JIT for {process_name} on {}", device.name);
    Ok(())
}

/// Transport backed by the libimobiledevice command-line tools.
pub struct CliDeviceTransport;

impl CliDeviceTransport {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {program}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{program} exited with {}: {}", output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DeviceTransport for CliDeviceTransport {
    async fn install_app(
        &self,
        package: &Path,
        device_id: &str,
        active_profiles: Option<&HashSet<String>>,
    ) -> Result<()> {
        if let Some(profiles) = active_profiles {
            // The tooling has no profile-set flag; deactivation happens by
            // removing everything the device holds outside the set.
            let listed = self
                .run("ideviceprovision", &["-u", device_id, "list"])
                .await
                .unwrap_or_default();
            for line in listed.lines() {
                let identifier = line.trim();
                if !identifier.is_empty() && !profiles.contains(identifier) {
                    if let Err(error) = self
                        .run("ideviceprovision", &["-u", device_id, "remove", identifier])
                        .await
                    {
                        warn!("failed to remove profile {identifier}: {error:#}");
                    }
                }
            }
        }

        let package = package
            .to_str()
            .context("package path is not valid UTF-8")?;
        self.run("ideviceinstaller", &["-u", device_id, "-i", package])
            .await?;
        Ok(())
    }

    async fn is_runtime_image_mounted(&self, device: &Device) -> Result<bool> {
        let output = self
            .run("ideviceimagemounter", &["-u", &device.identifier, "-l"])
            .await?;
        Ok(output.contains("ImageSignature"))
    }

    async fn install_runtime_image(
        &self,
        disk: &Path,
        signature: &Path,
        device: &Device,
    ) -> Result<()> {
        let disk = disk.to_str().context("disk path is not valid UTF-8")?;
        let signature = signature
            .to_str()
            .context("signature path is not valid UTF-8")?;
        self.run(
            "ideviceimagemounter",
            &["-u", &device.identifier, disk, signature],
        )
        .await?;
        Ok(())
    }

    async fn start_debug_session(&self, device: &Device) -> Result<Box<dyn DebugSession>> {
        Ok(Box::new(CliDebugSession {
            device_id: device.identifier.clone(),
        }))
    }
}

struct CliDebugSession {
    device_id: String,
}

#[async_trait]
impl DebugSession for CliDebugSession {
    async fn enable_unsigned_execution(&self, process_name: &str) -> Result<()> {
        let output = Command::new("idevicedebug")
            .args(["-u", &self.device_id, "--detach", "attach", process_name])
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to run idevicedebug")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("could not attach to {process_name}: {}", stderr.trim());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Directories;
    use crate::mock::MockTransport;

    #[tokio::test]
    async fn prepare_skips_fetch_when_already_mounted() {
        let transport = MockTransport {
            image_mounted: true,
            ..MockTransport::default()
        };
        // Unroutable feed URL: a fetch attempt would fail the test.
        let dirs = Directories::rooted_at(tempfile::tempdir().unwrap().path().to_path_buf());
        let disks = crate::disk::DeveloperDiskManager::with_feed_url(
            dirs.developer_disks,
            "http://127.0.0.1:1/feed.json".into(),
        );

        prepare(&transport, &disks, &crate::mock::device())
            .await
            .unwrap();
        assert!(transport.mounted_images.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prepare_mounts_cached_image() {
        let cache = tempfile::tempdir().unwrap();
        let version_dir = cache.path().join("iOS").join("17.2");
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join("DeveloperDiskImage.dmg"), b"disk").unwrap();
        std::fs::write(
            version_dir.join("DeveloperDiskImage.dmg.signature"),
            b"sig",
        )
        .unwrap();

        let transport = MockTransport::default();
        let disks = crate::disk::DeveloperDiskManager::with_feed_url(
            cache.path().to_path_buf(),
            "http://127.0.0.1:1/feed.json".into(),
        );

        prepare(&transport, &disks, &crate::mock::device())
            .await
            .unwrap();

        let mounted = transport.mounted_images.lock().unwrap();
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0], version_dir.join("DeveloperDiskImage.dmg"));
    }

    #[tokio::test]
    async fn enable_jit_attaches_after_preparing() {
        let transport = MockTransport {
            image_mounted: true,
            ..MockTransport::default()
        };
        let disks = crate::disk::DeveloperDiskManager::with_feed_url(
            tempfile::tempdir().unwrap().path().to_path_buf(),
            "http://127.0.0.1:1/feed.json".into(),
        );

        enable_jit(&transport, &disks, &crate::mock::device(), "Example")
            .await
            .unwrap();
    }
}
