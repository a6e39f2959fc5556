//! Runtime-support (developer disk) image retrieval.
//!
//! Image downloads are resolved through a JSON feed mapping OS versions to
//! download URLs. Fetched images are cached per OS version under the data
//! directory, so each version is downloaded at most once per machine.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use tokio::fs;
use walkdir::WalkDir;

use crate::error::DeveloperDiskError;
use crate::portal::types::{Device, DeviceKind, OsVersion};

const FEED_URL: &str = "https://cdn.sideloadd.io/developer-disks/feed.json";

const DISK_FILE: &str = "DeveloperDiskImage.dmg";
const SIGNATURE_FILE: &str = "DeveloperDiskImage.dmg.signature";

/// A fetched image pair on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeveloperDiskImage {
    pub disk: PathBuf,
    pub signature: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DiskFeed {
    #[allow(dead_code)]
    version: u32,
    disks: DiskCatalog,
}

#[derive(Debug, Deserialize)]
struct DiskCatalog {
    #[serde(rename = "iOS", default)]
    ios: std::collections::HashMap<String, DiskUrl>,
    #[serde(rename = "tvOS", default)]
    tvos: std::collections::HashMap<String, DiskUrl>,
}

/// Feed entries either point at a zip archive containing both files or at the
/// two files directly.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DiskUrl {
    Archive { archive: String },
    Separate { disk: String, signature: String },
}

pub struct DeveloperDiskManager {
    client: reqwest::Client,
    cache_dir: PathBuf,
    feed_url: String,
}

impl DeveloperDiskManager {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self::with_feed_url(cache_dir, FEED_URL.to_string())
    }

    pub fn with_feed_url(cache_dir: PathBuf, feed_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir,
            feed_url,
        }
    }

    /// Fetch the disk image pair matching `device`'s OS, from cache when
    /// available.
    pub async fn fetch_disk(&self, device: &Device) -> Result<DeveloperDiskImage, DeveloperDiskError> {
        let os_version = device
            .os_version
            .ok_or(DeveloperDiskError::UnsupportedOperatingSystem)?;

        let os_name = match device.kind {
            DeviceKind::Appletv => "tvOS",
            DeviceKind::Iphone | DeviceKind::Ipad => "iOS",
        };

        let version_dir = self
            .cache_dir
            .join(os_name)
            .join(os_version.to_string());
        let cached = DeveloperDiskImage {
            disk: version_dir.join(DISK_FILE),
            signature: version_dir.join(SIGNATURE_FILE),
        };
        if cached.disk.is_file() && cached.signature.is_file() {
            debug!("using cached developer disk for {os_name} {os_version}");
            return Ok(cached);
        }

        let url = self.lookup_download_url(device.kind, os_version).await?;

        fs::create_dir_all(&version_dir).await?;
        match url {
            DiskUrl::Archive { archive } => {
                self.fetch_archive(&archive, &cached).await?;
            }
            DiskUrl::Separate { disk, signature } => {
                let (disk_bytes, signature_bytes) =
                    tokio::try_join!(self.download(&disk), self.download(&signature))?;
                fs::write(&cached.disk, disk_bytes).await?;
                fs::write(&cached.signature, signature_bytes).await?;
            }
        }

        info!("fetched developer disk for {os_name} {os_version}");
        Ok(cached)
    }

    async fn lookup_download_url(
        &self,
        kind: DeviceKind,
        os_version: OsVersion,
    ) -> Result<DiskUrl, DeveloperDiskError> {
        let feed: DiskFeed = serde_json::from_slice(&self.download(&self.feed_url).await?)?;

        let catalog = match kind {
            DeviceKind::Appletv => feed.disks.tvos,
            DeviceKind::Iphone | DeviceKind::Ipad => feed.disks.ios,
        };

        catalog
            .into_iter()
            .find_map(|(version, url)| (version == os_version.to_string()).then_some(url))
            .ok_or(DeveloperDiskError::UnknownDownloadUrl)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, DeveloperDiskError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Download a zip archive and extract the disk and signature out of it,
    /// wherever they sit in the archive's directory structure.
    async fn fetch_archive(
        &self,
        url: &str,
        target: &DeveloperDiskImage,
    ) -> Result<(), DeveloperDiskError> {
        let bytes = self.download(url).await?;

        let staging = tempfile::tempdir()?;
        let mut archive = zip::ZipArchive::new(io::Cursor::new(bytes))?;
        archive.extract(staging.path())?;

        let disk = find_file(staging.path(), DISK_FILE)
            .ok_or(DeveloperDiskError::DownloadedImageNotFound)?;
        let signature = find_file(staging.path(), SIGNATURE_FILE)
            .ok_or(DeveloperDiskError::DownloadedImageNotFound)?;

        fs::copy(&disk, &target.disk).await?;
        fs::copy(&signature, &target.signature).await?;
        Ok(())
    }
}

fn find_file(root: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;

    #[tokio::test]
    async fn cached_image_short_circuits_the_feed() {
        let cache = tempfile::tempdir().unwrap();
        let version_dir = cache.path().join("iOS").join("17.2");
        std_fs::create_dir_all(&version_dir).unwrap();
        std_fs::write(version_dir.join(DISK_FILE), b"disk").unwrap();
        std_fs::write(version_dir.join(SIGNATURE_FILE), b"sig").unwrap();

        // Unroutable feed URL: any network access would fail the test.
        let manager = DeveloperDiskManager::with_feed_url(
            cache.path().to_path_buf(),
            "http://127.0.0.1:1/feed.json".into(),
        );

        let image = manager.fetch_disk(&crate::mock::device()).await.unwrap();
        assert_eq!(image.disk, version_dir.join(DISK_FILE));
        assert_eq!(image.signature, version_dir.join(SIGNATURE_FILE));
    }

    #[tokio::test]
    async fn missing_os_version_is_unsupported() {
        let cache = tempfile::tempdir().unwrap();
        let manager = DeveloperDiskManager::new(cache.path().to_path_buf());

        let mut device = crate::mock::device();
        device.os_version = None;

        let error = manager.fetch_disk(&device).await.unwrap_err();
        assert!(matches!(error, DeveloperDiskError::UnsupportedOperatingSystem));
    }

    #[test]
    fn feed_accepts_both_url_shapes() {
        let feed: DiskFeed = serde_json::from_str(
            r#"{
                "version": 1,
                "disks": {
                    "iOS": {
                        "17.2": {
                            "disk": "https://example.com/d.dmg",
                            "signature": "https://example.com/d.dmg.signature"
                        },
                        "16.4": { "archive": "https://example.com/16.4.zip" }
                    },
                    "tvOS": {}
                }
            }"#,
        )
        .unwrap();

        assert!(matches!(feed.disks.ios["17.2"], DiskUrl::Separate { .. }));
        assert!(matches!(feed.disks.ios["16.4"], DiskUrl::Archive { .. }));
    }

    #[test]
    fn nested_archive_layout_is_searched() {
        let staging = tempfile::tempdir().unwrap();
        let nested = staging.path().join("17.2").join("inner");
        std_fs::create_dir_all(&nested).unwrap();
        std_fs::write(nested.join(DISK_FILE), b"disk").unwrap();

        let found = find_file(staging.path(), DISK_FILE).unwrap();
        assert_eq!(found, nested.join(DISK_FILE));
        assert!(find_file(staging.path(), SIGNATURE_FILE).is_none());
    }
}
