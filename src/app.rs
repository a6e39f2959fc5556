//! Unpacked application packages.
//!
//! An [`Application`] is read-only once loaded: bundle identifier and display
//! name come from `Info.plist`, entitlements from the archived expanded
//! entitlements file, and sub-components from `PlugIns/*.appex`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

/// Bundle identifier of this tool's own companion app. The companion gets
/// legacy bundle-identifier treatment and extra runtime metadata when signed.
pub const COMPANION_BUNDLE_ID: &str = "io.sideloadd.store";

/// Download URL for the companion `.ipa` used by `install-companion`.
pub const COMPANION_DOWNLOAD_URL: &str = "https://cdn.sideloadd.io/store/store.ipa";

/// Info.plist keys this tool writes into re-signed packages.
pub mod info_keys {
    /// The package's original bundle identifier, before adjustment.
    pub const ORIGINAL_BUNDLE_ID: &str = "SLBundleID";
    /// App-group identifiers granted by the embedded profile.
    pub const APP_GROUPS: &str = "SLAppGroups";
    /// Hardware identifier of the device the package was installed to.
    pub const DEVICE_ID: &str = "SLDeviceID";
    /// Identifier of the server installation that performed the install.
    pub const SERVER_ID: &str = "SLServerID";
    /// Serial number of the certificate embedded for runtime use.
    pub const CERTIFICATE_ID: &str = "SLCertificateID";
    /// Standard URL-types array key.
    pub const URL_TYPES: &str = "CFBundleURLTypes";
}

const ENTITLEMENTS_FILE: &str = "archived-expanded-entitlements.xcent";

#[derive(Debug, Clone)]
pub struct Application {
    pub path: PathBuf,
    pub name: String,
    pub bundle_identifier: String,
    pub entitlements: HashMap<String, Value>,
    pub extensions: Vec<Application>,
}

impl Application {
    /// Load an unpacked `.app` bundle from disk, including its extensions.
    pub fn load(bundle_path: &Path) -> Result<Self> {
        let mut application = Self::load_single(bundle_path)?;

        let plugins_dir = bundle_path.join("PlugIns");
        if plugins_dir.is_dir() {
            for entry in fs::read_dir(&plugins_dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "appex") {
                    application.extensions.push(Self::load_single(&path)?);
                }
            }
        }

        Ok(application)
    }

    fn load_single(bundle_path: &Path) -> Result<Self> {
        let info: plist::Dictionary = plist::from_file(bundle_path.join("Info.plist"))
            .with_context(|| format!("failed to read Info.plist in {}", bundle_path.display()))?;

        let bundle_identifier = info
            .get("CFBundleIdentifier")
            .and_then(plist::Value::as_string)
            .ok_or_else(|| anyhow!("bundle at {} has no CFBundleIdentifier", bundle_path.display()))?
            .to_string();

        let name = info
            .get("CFBundleDisplayName")
            .or_else(|| info.get("CFBundleName"))
            .and_then(plist::Value::as_string)
            .unwrap_or(&bundle_identifier)
            .to_string();

        Ok(Self {
            path: bundle_path.to_path_buf(),
            name,
            bundle_identifier,
            entitlements: read_entitlements(bundle_path)?,
            extensions: Vec::new(),
        })
    }

    /// Whether this package is the tool's own companion app.
    pub fn is_companion(&self) -> bool {
        self.bundle_identifier == COMPANION_BUNDLE_ID
    }

    /// App-group identifiers declared in the entitlement set.
    pub fn app_groups(&self) -> Vec<String> {
        match self.entitlements.get(crate::portal::types::entitlements::APP_GROUPS) {
            Some(Value::Array(groups)) => groups
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn info_plist_path(&self) -> PathBuf {
        self.path.join("Info.plist")
    }

    /// Construct an in-memory application for tests, without touching disk.
    pub fn for_tests(
        bundle_identifier: &str,
        name: &str,
        entitlements: HashMap<String, Value>,
    ) -> Self {
        Self {
            path: PathBuf::from(format!("/tmp/{name}.app")),
            name: name.to_string(),
            bundle_identifier: bundle_identifier.to_string(),
            entitlements,
            extensions: Vec::new(),
        }
    }
}

fn read_entitlements(bundle_path: &Path) -> Result<HashMap<String, Value>> {
    let path = bundle_path.join(ENTITLEMENTS_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let dict: plist::Dictionary = plist::from_file(&path)
        .with_context(|| format!("failed to read entitlements at {}", path.display()))?;

    dict.into_iter()
        .map(|(key, value)| {
            let json = serde_json::to_value(&value)
                .with_context(|| format!("unsupported entitlement value for {key}"))?;
            Ok((key, json))
        })
        .collect()
}

/// Unpack an `.ipa` archive into `destination` and return the path of the
/// `.app` bundle inside its `Payload` directory.
pub fn unpack_ipa(ipa_path: &Path, destination: &Path) -> Result<PathBuf> {
    let file = fs::File::open(ipa_path)
        .with_context(|| format!("failed to open package at {}", ipa_path.display()))?;
    let mut archive = zip::ZipArchive::new(io::BufReader::new(file))?;
    archive.extract(destination)?;

    let payload = destination.join("Payload");
    for entry in fs::read_dir(&payload)
        .with_context(|| format!("no Payload directory in {}", ipa_path.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "app") {
            return Ok(path);
        }
    }

    bail!("no .app bundle found in {}", ipa_path.display());
}

/// Pack an unpacked `.app` bundle back into an `.ipa` at `ipa_path`, under
/// the standard `Payload` directory.
pub fn pack_ipa(app_bundle: &Path, ipa_path: &Path) -> Result<()> {
    let bundle_name = app_bundle
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid bundle path {}", app_bundle.display()))?;

    let file = fs::File::create(ipa_path)
        .with_context(|| format!("failed to create {}", ipa_path.display()))?;
    let mut writer = zip::ZipWriter::new(io::BufWriter::new(file));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(app_bundle) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(app_bundle)
            .map_err(|_| anyhow!("entry escapes bundle root"))?;
        let archived = format!("Payload/{bundle_name}/{}", relative.display());

        if entry.file_type().is_dir() {
            writer.add_directory(archived, options)?;
        } else {
            writer.start_file(archived, options)?;
            let mut source = fs::File::open(entry.path())?;
            io::copy(&mut source, &mut writer)?;
        }
    }

    writer.finish()?;
    Ok(())
}

/// Read a bundle's Info.plist as a mutable dictionary.
pub fn read_info_plist(bundle_path: &Path) -> Result<plist::Dictionary> {
    plist::from_file(bundle_path.join("Info.plist"))
        .with_context(|| format!("failed to read Info.plist in {}", bundle_path.display()))
}

/// Write a bundle's Info.plist back to disk.
pub fn write_info_plist(bundle_path: &Path, info: &plist::Dictionary) -> Result<()> {
    plist::to_file_xml(bundle_path.join("Info.plist"), info)
        .with_context(|| format!("failed to write Info.plist in {}", bundle_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn write_bundle(
        dir: &Path,
        name: &str,
        bundle_id: &str,
        groups: &[&str],
    ) -> PathBuf {
        let bundle = dir.join(format!("{name}.app"));
        fs::create_dir_all(&bundle).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert("CFBundleIdentifier".into(), plist::Value::from(bundle_id));
        info.insert("CFBundleName".into(), plist::Value::from(name));
        plist::to_file_xml(bundle.join("Info.plist"), &info).unwrap();

        if !groups.is_empty() {
            let mut entitlements = plist::Dictionary::new();
            entitlements.insert(
                crate::portal::types::entitlements::APP_GROUPS.into(),
                plist::Value::Array(groups.iter().map(|g| plist::Value::from(*g)).collect()),
            );
            plist::to_file_xml(bundle.join(ENTITLEMENTS_FILE), &entitlements).unwrap();
        }

        bundle
    }

    #[test]
    fn loads_identity_and_entitlements() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), "Example", "com.example.app", &["group.com.example"]);

        let app = Application::load(&bundle).unwrap();
        assert_eq!(app.bundle_identifier, "com.example.app");
        assert_eq!(app.name, "Example");
        assert_eq!(app.app_groups(), vec!["group.com.example".to_string()]);
        assert!(!app.is_companion());
    }

    #[test]
    fn loads_extensions_from_plugins_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), "Example", "com.example.app", &[]);

        let plugins = bundle.join("PlugIns");
        fs::create_dir_all(&plugins).unwrap();
        let appex = plugins.join("Widget.appex");
        fs::create_dir_all(&appex).unwrap();
        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleIdentifier".into(),
            plist::Value::from("com.example.app.Widget"),
        );
        info.insert("CFBundleName".into(), plist::Value::from("Widget"));
        plist::to_file_xml(appex.join("Info.plist"), &info).unwrap();

        let app = Application::load(&bundle).unwrap();
        assert_eq!(app.extensions.len(), 1);
        assert_eq!(app.extensions[0].bundle_identifier, "com.example.app.Widget");
    }

    #[test]
    fn packed_ipa_unpacks_to_the_same_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), "Example", "com.example.app", &[]);

        let ipa = dir.path().join("Example.ipa");
        pack_ipa(&bundle, &ipa).unwrap();

        let unpacked = dir.path().join("unpacked");
        let app_path = unpack_ipa(&ipa, &unpacked).unwrap();
        let app = Application::load(&app_path).unwrap();
        assert_eq!(app.bundle_identifier, "com.example.app");
    }

    #[test]
    fn missing_entitlements_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), "Example", "com.example.app", &[]);

        let app = Application::load(&bundle).unwrap();
        assert!(app.entitlements.is_empty());
        assert!(app.app_groups().is_empty());
    }
}
