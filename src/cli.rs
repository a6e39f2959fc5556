use clap::{Parser, Subcommand, ValueEnum};

use crate::portal::types::{DeviceKind, OsVersion};

#[derive(Parser, Debug)]
#[command(version, about = "sideloadd app installer")]
pub struct Args {
    #[command(subcommand)]
    pub sub: Cmd,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AccountArgs {
    /// Developer-account identifier (email address)
    #[arg(long)]
    pub apple_id: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Hardware identifier (UDID) of the target device
    #[arg(long, short = 'u')]
    pub device_id: String,

    /// Display name registered for the device
    #[arg(long, default_value = "Device")]
    pub device_name: String,

    /// Device family
    #[arg(long, value_enum, default_value = "iphone")]
    pub device_kind: DeviceKindArg,

    /// OS version of the device, e.g. 17.2 (needed for JIT support)
    #[arg(long, value_parser = parse_os_version)]
    pub os_version: Option<OsVersion>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum DeviceKindArg {
    Iphone,
    Ipad,
    Appletv,
}

impl From<DeviceKindArg> for DeviceKind {
    fn from(kind: DeviceKindArg) -> Self {
        match kind {
            DeviceKindArg::Iphone => DeviceKind::Iphone,
            DeviceKindArg::Ipad => DeviceKind::Ipad,
            DeviceKindArg::Appletv => DeviceKind::Appletv,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Install an app package (a local .ipa path or an https URL)
    Install {
        /// Path or URL of the package to install
        package: String,

        #[command(flatten)]
        account: AccountArgs,

        #[command(flatten)]
        device: DeviceArgs,

        /// External code-signing tool to invoke
        #[arg(long, default_value = "zsign")]
        signer: String,
    },
    /// Download and install the companion app
    InstallCompanion {
        #[command(flatten)]
        account: AccountArgs,

        #[command(flatten)]
        device: DeviceArgs,

        /// External code-signing tool to invoke
        #[arg(long, default_value = "zsign")]
        signer: String,
    },
    /// Enable JIT for an installed app by attaching a debugger to it
    Jit {
        /// Process name of the installed app
        process: String,

        #[command(flatten)]
        device: DeviceArgs,
    },
}

fn parse_os_version(value: &str) -> Result<OsVersion, String> {
    let (major, minor) = value
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got {value}"))?;
    Ok(OsVersion {
        major: major.parse().map_err(|_| format!("invalid major version in {value}"))?,
        minor: minor.parse().map_err(|_| format!("invalid minor version in {value}"))?,
    })
}
