use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use url::Url;

use sideloadd::anisette::sources::{DEFAULT_SERVICE_URL, NullPluginBus, ServiceSource};
use sideloadd::anisette::AnisetteBroker;
use sideloadd::app::COMPANION_DOWNLOAD_URL;
use sideloadd::certificates::{CertificateCache, CertificateManager};
use sideloadd::cli;
use sideloadd::config::Directories;
use sideloadd::device::{self, CliDeviceTransport, DeviceTransport};
use sideloadd::disk::DeveloperDiskManager;
use sideloadd::error::is_silent_failure;
use sideloadd::interaction::{CliInteractor, Interactor};
use sideloadd::notify::{LogNotifier, Notifier};
use sideloadd::pipeline::{InstallPipeline, InstallRequest, LogObserver, PackageSource};
use sideloadd::portal::http::GatewayClient;
use sideloadd::portal::types::Device;
use sideloadd::portal::PortalClient;
use sideloadd::signer::{AppSigner, CommandSigner};

fn main() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        if is_silent_failure(&e) {
            info!("cancelled");
            std::process::exit(0);
        }
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    match args.sub {
        cli::Cmd::Install {
            package,
            account,
            device,
            signer,
        } => {
            let source = package_source(&package)?;
            install(source, account, device, signer).await
        }
        cli::Cmd::InstallCompanion {
            account,
            device,
            signer,
        } => {
            let url = Url::parse(COMPANION_DOWNLOAD_URL)
                .context("invalid companion download URL")?;
            install(PackageSource::Remote(url), account, device, signer).await
        }
        cli::Cmd::Jit { process, device } => jit(process, device).await,
    }
}

/// A package argument is a URL when it parses as one with an http scheme,
/// otherwise a local path.
fn package_source(package: &str) -> Result<PackageSource> {
    if let Ok(url) = Url::parse(package) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(PackageSource::Remote(url));
        }
    }

    let path = std::path::PathBuf::from(package);
    if !path.is_file() {
        anyhow::bail!("no package found at {}", path.display());
    }
    Ok(PackageSource::Local(path))
}

fn device_from_args(args: &cli::DeviceArgs) -> Device {
    Device {
        name: args.device_name.clone(),
        identifier: args.device_id.clone(),
        kind: args.device_kind.into(),
        os_version: args.os_version,
    }
}

async fn install(
    source: PackageSource,
    account: cli::AccountArgs,
    device_args: cli::DeviceArgs,
    signer_program: String,
) -> Result<()> {
    let directories = Directories::resolve()?;
    let server_id = load_server_id(&directories)?;

    let portal: Arc<dyn PortalClient> = Arc::new(GatewayClient::new());
    let interactor: Arc<dyn Interactor> = Arc::new(CliInteractor);
    let transport: Arc<dyn DeviceTransport> = Arc::new(CliDeviceTransport);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let service_url = Url::parse(DEFAULT_SERVICE_URL).context("invalid service URL")?;
    let anisette = Arc::new(AnisetteBroker::new(
        Arc::new(ServiceSource::new(service_url).context("failed to build anisette client")?),
        Arc::new(NullPluginBus),
    ));
    let certificates = Arc::new(CertificateManager::new(
        Arc::clone(&portal),
        Arc::clone(&interactor),
        CertificateCache::new(directories.certificates.clone()),
    ));
    let disks = Arc::new(DeveloperDiskManager::new(
        directories.developer_disks.clone(),
    ));

    let pipeline = InstallPipeline::new(
        portal,
        interactor,
        transport,
        notifier,
        anisette,
        certificates,
        disks,
        Box::new(move |certificate| {
            Arc::new(CommandSigner::new(signer_program.clone(), certificate.clone()))
                as Arc<dyn AppSigner>
        }),
        server_id,
    );

    let password = prompt_password(&account.apple_id).await?;
    let request = InstallRequest {
        apple_id: account.apple_id,
        password,
        device: device_from_args(&device_args),
        source,
    };

    pipeline.run(&request, &LogObserver).await
}

async fn jit(process: String, device_args: cli::DeviceArgs) -> Result<()> {
    let directories = Directories::resolve()?;
    let transport = CliDeviceTransport;
    let disks = DeveloperDiskManager::new(directories.developer_disks);

    device::enable_jit(&transport, &disks, &device_from_args(&device_args), &process).await
}

async fn prompt_password(apple_id: &str) -> Result<String> {
    let prompt = format!("Password for {apple_id}:");
    tokio::task::spawn_blocking(move || {
        inquire::Password::new(&prompt)
            .without_confirmation()
            .prompt()
            .context("failed to read password")
    })
    .await
    .context("password prompt interrupted")?
}

/// A stable per-installation identifier, generated on first use and recorded
/// into companion apps so they can recognize this installation later.
fn load_server_id(directories: &Directories) -> Result<String> {
    let path = directories
        .certificates
        .parent()
        .unwrap_or(&directories.certificates)
        .join("server-id");

    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, &id).context("failed to persist server id")?;
    Ok(id)
}
