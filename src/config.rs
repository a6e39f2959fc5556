//! On-disk layout for persisted artifacts.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Cache roots used across runs: one encrypted certificate blob per team and
/// one runtime-support image pair per OS version. Everything else lives in
/// run-scoped temporary directories.
#[derive(Debug, Clone)]
pub struct Directories {
    pub certificates: PathBuf,
    pub developer_disks: PathBuf,
}

impl Directories {
    pub fn resolve() -> Result<Self> {
        let root = dirs::data_dir()
            .context("could not determine data directory")?
            .join("sideloadd");

        Ok(Self::rooted_at(root))
    }

    pub fn rooted_at(root: PathBuf) -> Self {
        Self {
            certificates: root.join("certificates"),
            developer_disks: root.join("developer-disks"),
        }
    }
}
