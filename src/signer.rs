//! Package preparation and re-signing.
//!
//! Preparation rewrites each bundle's Info.plist for its newly-issued
//! profile and records enough metadata inside the package for the app to
//! refresh itself later. Signing proper is behind a trait; the production
//! signer shells out to an external signing tool with the certificate
//! material written to a run-scoped temporary directory.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::app::{self, Application, info_keys};
use crate::certificates::encrypted_certificate_blob;
use crate::portal::types::{Certificate, Device, ProvisioningProfile, entitlements};

/// File name of the certificate blob embedded into the companion app.
const EMBEDDED_CERTIFICATE_FILE: &str = "certificate.p12";

const EMBEDDED_PROFILE_FILE: &str = "embedded.mobileprovision";

#[async_trait]
pub trait AppSigner: Send + Sync {
    /// Sign the unpacked `.app` bundle at `app_path` (including nested
    /// extensions) against the given profiles.
    async fn sign(&self, app_path: &Path, profiles: &[ProvisioningProfile]) -> Result<()>;
}

/// Run-scoped context recorded into the package during preparation.
pub struct PackageMetadata<'a> {
    pub device: &'a Device,
    /// Stable identifier of this installation, so the companion app can find
    /// its way back to the server that installed it.
    pub server_id: &'a str,
    pub certificate: &'a Certificate,
}

/// Rewrite `app` and its extensions in place for their issued profiles.
///
/// Each bundle gets the profile's adjusted bundle identifier, its original
/// identifier under a private key, the granted app-group list, and the raw
/// profile embedded. The main app additionally gets a callback URL scheme,
/// and the companion app gets the device, server, and certificate metadata it
/// needs to re-sign apps on its own.
pub fn prepare_package(
    app: &Application,
    profiles: &HashMap<String, ProvisioningProfile>,
    metadata: &PackageMetadata<'_>,
) -> Result<()> {
    prepare_bundle(app, profiles, metadata, true)?;
    for extension in &app.extensions {
        prepare_bundle(extension, profiles, metadata, false)?;
    }
    Ok(())
}

fn prepare_bundle(
    bundle: &Application,
    profiles: &HashMap<String, ProvisioningProfile>,
    metadata: &PackageMetadata<'_>,
    is_main_app: bool,
) -> Result<()> {
    let profile = profiles.get(&bundle.bundle_identifier).ok_or_else(|| {
        anyhow!("no profile resolved for {}", bundle.bundle_identifier)
    })?;

    let mut info = app::read_info_plist(&bundle.path)?;

    info.insert(
        "CFBundleIdentifier".into(),
        plist::Value::from(profile.bundle_identifier.as_str()),
    );
    info.insert(
        info_keys::ORIGINAL_BUNDLE_ID.into(),
        plist::Value::from(bundle.bundle_identifier.as_str()),
    );
    info.insert(
        info_keys::APP_GROUPS.into(),
        plist::Value::Array(
            granted_app_groups(profile)
                .into_iter()
                .map(plist::Value::from)
                .collect(),
        ),
    );

    if is_main_app {
        append_url_scheme(&mut info, &bundle.bundle_identifier);
    }

    if is_main_app && bundle.is_companion() {
        info.insert(
            info_keys::DEVICE_ID.into(),
            plist::Value::from(metadata.device.identifier.as_str()),
        );
        info.insert(
            info_keys::SERVER_ID.into(),
            plist::Value::from(metadata.server_id),
        );
        info.insert(
            info_keys::CERTIFICATE_ID.into(),
            plist::Value::from(metadata.certificate.serial_number.as_str()),
        );

        if let Some(blob) = encrypted_certificate_blob(metadata.certificate) {
            fs::write(bundle.path.join(EMBEDDED_CERTIFICATE_FILE), blob)
                .context("failed to embed certificate into companion app")?;
        }
    }

    app::write_info_plist(&bundle.path, &info)?;

    fs::write(bundle.path.join(EMBEDDED_PROFILE_FILE), &profile.data)
        .with_context(|| format!("failed to embed profile in {}", bundle.path.display()))?;

    debug!(
        "prepared {} as {}",
        bundle.bundle_identifier, profile.bundle_identifier
    );
    Ok(())
}

/// App groups granted by the profile's entitlement set.
fn granted_app_groups(profile: &ProvisioningProfile) -> Vec<String> {
    match profile.entitlements.get(entitlements::APP_GROUPS) {
        Some(serde_json::Value::Array(groups)) => groups
            .iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Register a `sideload-{bundle id}` URL scheme so the installed app can be
/// opened by callback, preserving any schemes the app already declares.
fn append_url_scheme(info: &mut plist::Dictionary, original_bundle_id: &str) {
    let scheme = plist::Value::from(format!("sideload-{original_bundle_id}"));

    let mut url_type = plist::Dictionary::new();
    url_type.insert(
        "CFBundleURLSchemes".into(),
        plist::Value::Array(vec![scheme]),
    );

    match info.get_mut(info_keys::URL_TYPES) {
        Some(plist::Value::Array(url_types)) => {
            url_types.push(plist::Value::Dictionary(url_type));
        }
        _ => {
            info.insert(
                info_keys::URL_TYPES.into(),
                plist::Value::Array(vec![plist::Value::Dictionary(url_type)]),
            );
        }
    }
}

/// Signer shelling out to an external code-signing tool.
///
/// The tool is expected to accept a certificate, a private key, and one
/// profile per bundle, and to recursively sign the bundle in place.
pub struct CommandSigner {
    program: String,
    certificate: Certificate,
}

impl CommandSigner {
    pub fn new(program: impl Into<String>, certificate: Certificate) -> Self {
        Self {
            program: program.into(),
            certificate,
        }
    }
}

#[async_trait]
impl AppSigner for CommandSigner {
    async fn sign(&self, app_path: &Path, profiles: &[ProvisioningProfile]) -> Result<()> {
        let staging = tempfile::tempdir()?;

        let certificate_path = staging.path().join("certificate.der");
        let key_path = staging.path().join("private.key");
        fs::write(
            &certificate_path,
            self.certificate
                .data
                .as_deref()
                .context("certificate has no data to sign with")?,
        )?;
        fs::write(
            &key_path,
            self.certificate
                .private_key
                .as_deref()
                .context("certificate has no private key to sign with")?,
        )?;

        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(&certificate_path)
            .arg("-k")
            .arg(&key_path)
            .stdin(Stdio::null());

        for (index, profile) in profiles.iter().enumerate() {
            let profile_path = staging.path().join(format!("{index}.mobileprovision"));
            fs::write(&profile_path, &profile.data)?;
            command.arg("-m").arg(&profile_path);
        }

        let output = command
            .arg(app_path)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }
}
