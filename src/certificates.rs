//! Signing-certificate resolution.
//!
//! The portal allows at most one certificate per team, so resolution is
//! revoke-before-create. A successfully created certificate is cached on disk
//! as an encrypted blob keyed by its machine identifier; later runs on the
//! same installation take the fast path and never revoke anything.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::error::InstallError;
use crate::interaction::Interactor;
use crate::portal::types::{Certificate, Session, Team, TeamKind};
use crate::portal::PortalClient;

/// Machine-name label identifying certificates created by this tool family.
pub const MACHINE_NAME: &str = "Sideload";

const CACHE_ENTRY: &str = "certificate.json";

/// Two concurrent runs against the same team must not both pass the
/// "no existing certificate" check; resolution is serialized per team.
static TEAM_LOCKS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

fn team_lock(team_identifier: &str) -> Arc<Mutex<()>> {
    TEAM_LOCKS
        .entry(team_identifier.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Encrypted on-disk cache, one blob per team identifier. The blob is a
/// single AES-encrypted archive entry keyed by the certificate's machine
/// identifier; a blob that fails to open or parse is treated as absent.
pub struct CertificateCache {
    dir: PathBuf,
}

impl CertificateCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn blob_path(&self, team_identifier: &str) -> PathBuf {
        self.dir.join(format!("{team_identifier}.p12"))
    }

    pub fn load(&self, team_identifier: &str, machine_identifier: &str) -> Option<Certificate> {
        let path = self.blob_path(team_identifier);
        let file = fs::File::open(&path).ok()?;

        let mut archive = zip::ZipArchive::new(file).ok()?;
        let mut entry = archive
            .by_name_decrypt(CACHE_ENTRY, machine_identifier.as_bytes())
            .ok()?;

        let mut payload = Vec::new();
        entry.read_to_end(&mut payload).ok()?;

        let mut certificate: Certificate = serde_json::from_slice(&payload).ok()?;
        // Restore the decryption key so the blob can be re-encrypted and
        // embedded into the companion app later.
        certificate.machine_identifier = Some(machine_identifier.to_string());
        Some(certificate)
    }

    /// Persist the certificate, encrypted with its machine identifier.
    /// Writes are atomic replaces so concurrent runs only ever observe a
    /// complete blob.
    pub fn store(&self, team_identifier: &str, certificate: &Certificate) -> Result<()> {
        let machine_identifier = certificate
            .machine_identifier
            .as_deref()
            .context("certificate has no machine identifier to encrypt with")?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let payload = serde_json::to_vec(certificate)?;
        let encrypted = encrypt_blob(&payload, machine_identifier)?;

        let path = self.blob_path(team_identifier);
        let temp = path.with_extension("p12.tmp");
        fs::write(&temp, &encrypted)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        fs::rename(&temp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;

        Ok(())
    }
}

/// Produce the encrypted archive bytes for a certificate payload. Also used
/// when embedding the blob into the companion app bundle.
pub fn encrypt_blob(payload: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .with_aes_encryption(zip::AesMode::Aes256, password);

    writer.start_file(CACHE_ENTRY, options)?;
    writer.write_all(payload)?;
    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

/// Serialize and encrypt a certificate for embedding, keyed by its machine
/// identifier. Returns `None` when no machine identifier is known.
pub fn encrypted_certificate_blob(certificate: &Certificate) -> Option<Vec<u8>> {
    let machine_identifier = certificate.machine_identifier.as_deref()?;
    let payload = serde_json::to_vec(certificate).ok()?;
    encrypt_blob(&payload, machine_identifier).ok()
}

pub struct CertificateManager {
    portal: Arc<dyn PortalClient>,
    interactor: Arc<dyn Interactor>,
    cache: CertificateCache,
}

impl CertificateManager {
    pub fn new(
        portal: Arc<dyn PortalClient>,
        interactor: Arc<dyn Interactor>,
        cache: CertificateCache,
    ) -> Self {
        Self {
            portal,
            interactor,
            cache,
        }
    }

    /// Resolve the single active signing certificate for `team`.
    ///
    /// Policy, in order: cached fast path for a same-tool certificate; an
    /// interactive gate when a same-tool certificate exists without a usable
    /// cache (the account was used with a different installation); a second
    /// gate when the team is above the free tier (creating will revoke the
    /// general development certificate); revoke any existing certificate and
    /// re-run; otherwise create, re-fetch for the server-assigned record,
    /// attach the private key, and cache.
    pub async fn resolve(&self, team: &Team, session: &Session) -> Result<Certificate> {
        let lock = team_lock(&team.identifier);
        let _guard = lock.lock().await;

        // Each interactive gate fires at most once per run, even though the
        // policy re-runs after a revoke.
        let mut confirmed_other_install = false;
        let mut confirmed_revocation = false;

        loop {
            let certificates = self.portal.fetch_certificates(team, session).await?;

            if let Some(previous) = certificates.iter().find(|certificate| {
                certificate
                    .machine_name
                    .as_deref()
                    .is_some_and(|name| name.starts_with(MACHINE_NAME))
            }) {
                if let Some(machine_identifier) = previous.machine_identifier.as_deref() {
                    if let Some(cached) = self.cache.load(&team.identifier, machine_identifier) {
                        debug!("using cached certificate for team {}", team.identifier);
                        return Ok(cached);
                    }
                }

                // A same-tool certificate exists but we have no cache for it:
                // this account was used with a different installation, and
                // continuing will revoke that installation's certificate.
                if !confirmed_other_install {
                    let confirmed = self
                        .interactor
                        .confirm(
                            "Multiple Installations Not Supported",
                            "Please use the same installation you previously used with this \
                             account, or apps installed with it will stop working. Continue?",
                        )
                        .await;
                    if !confirmed {
                        return Err(InstallError::Cancelled.into());
                    }
                    confirmed_other_install = true;
                }
            }

            if team.kind != TeamKind::Free && !confirmed_revocation {
                let confirmed = self
                    .interactor
                    .confirm(
                        "Installing this app will revoke your development certificate.",
                        "This will not affect apps you've submitted to the store, but apps \
                         installed to your devices with your own tooling may stop working \
                         until you reinstall them. Continue?",
                    )
                    .await;
                if !confirmed {
                    return Err(InstallError::Cancelled.into());
                }
                confirmed_revocation = true;
            }

            if let Some(existing) = certificates.first() {
                // At most one certificate can exist per team, so this loop
                // revokes at most once before reaching the create path.
                info!(
                    "revoking existing certificate {} for team {}",
                    existing.serial_number, team.identifier
                );
                self.portal
                    .revoke_certificate(existing, team, session)
                    .await?;
                continue;
            }

            return self.create_certificate(team, session).await;
        }
    }

    async fn create_certificate(&self, team: &Team, session: &Session) -> Result<Certificate> {
        let created = self
            .portal
            .add_certificate(MACHINE_NAME, team, session)
            .await?;

        let private_key = created
            .private_key
            .clone()
            .ok_or(InstallError::MissingPrivateKey)?;

        // The create call does not return the private key bound to the
        // server-assigned record; re-fetch and match by serial number.
        let certificates = self.portal.fetch_certificates(team, session).await?;
        let mut certificate = certificates
            .into_iter()
            .find(|certificate| certificate.serial_number == created.serial_number)
            .ok_or(InstallError::MissingCertificate)?;

        certificate.private_key = Some(private_key);

        if let Err(error) = self.cache.store(&team.identifier, &certificate) {
            // Non-fatal: the next run will just take the slow path.
            warn!("failed to cache certificate: {error:#}");
        }

        Ok(certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockPortal, PortalCall, ScriptedInteractor};
    use crate::portal::types::TeamKind;

    fn foreign_certificate() -> Certificate {
        Certificate {
            serial_number: "XCODE1".into(),
            machine_name: Some("Xcode iOS Development".into()),
            machine_identifier: None,
            data: None,
            private_key: None,
        }
    }

    fn manager(portal: Arc<MockPortal>, interactor: ScriptedInteractor) -> CertificateManager {
        let dir = tempfile::tempdir().unwrap();
        CertificateManager::new(
            portal,
            Arc::new(interactor),
            CertificateCache::new(dir.path().to_path_buf()),
        )
    }

    #[tokio::test]
    async fn existing_foreign_certificate_is_revoked_then_one_created() {
        let portal = Arc::new(MockPortal::new().with_certificate(foreign_certificate()));
        let manager = manager(Arc::clone(&portal), ScriptedInteractor::accepting());

        let team = mock::team(TeamKind::Free);
        let certificate = manager.resolve(&team, &mock::session()).await.unwrap();

        assert_eq!(portal.count(PortalCall::RevokeCertificate), 1);
        assert_eq!(portal.count(PortalCall::AddCertificate), 1);
        assert!(certificate.private_key.is_some());
        assert_eq!(certificate.machine_name.as_deref(), Some(MACHINE_NAME));
    }

    #[tokio::test]
    async fn no_existing_certificate_creates_without_revoking() {
        let portal = Arc::new(MockPortal::new());
        let manager = manager(Arc::clone(&portal), ScriptedInteractor::accepting());

        let team = mock::team(TeamKind::Free);
        manager.resolve(&team, &mock::session()).await.unwrap();

        assert_eq!(portal.count(PortalCall::RevokeCertificate), 0);
        assert_eq!(portal.count(PortalCall::AddCertificate), 1);
    }

    #[tokio::test]
    async fn paid_team_prompts_before_revoking() {
        let portal = Arc::new(MockPortal::new());
        let interactor = ScriptedInteractor::with_confirmations(vec![false]);
        let manager = manager(Arc::clone(&portal), interactor);

        let team = mock::team(TeamKind::Organization);
        let error = manager
            .resolve(&team, &mock::session())
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<InstallError>(),
            Some(InstallError::Cancelled)
        ));
        assert_eq!(portal.count(PortalCall::AddCertificate), 0);
    }

    #[tokio::test]
    async fn same_tool_certificate_without_cache_requires_confirmation() {
        let previous = Certificate {
            serial_number: "OLD1".into(),
            machine_name: Some("Sideload".into()),
            machine_identifier: Some("OLDMACHINE".into()),
            data: None,
            private_key: None,
        };
        let portal = Arc::new(MockPortal::new().with_certificate(previous));
        let interactor = ScriptedInteractor::with_confirmations(vec![false]);
        let manager = manager(Arc::clone(&portal), interactor);

        let team = mock::team(TeamKind::Free);
        let error = manager
            .resolve(&team, &mock::session())
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<InstallError>(),
            Some(InstallError::Cancelled)
        ));
        assert_eq!(portal.count(PortalCall::RevokeCertificate), 0);
    }

    #[tokio::test]
    async fn cached_certificate_short_circuits_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path().to_path_buf());

        let certificate = Certificate {
            serial_number: "CACHED1".into(),
            machine_name: Some("Sideload".into()),
            machine_identifier: Some("MACHINE9".into()),
            data: Some(vec![1, 2, 3]),
            private_key: Some(b"key".to_vec()),
        };
        cache.store("ABC123XYZ0", &certificate).unwrap();

        let portal = Arc::new(MockPortal::new().with_certificate(Certificate {
            private_key: None,
            ..certificate.clone()
        }));
        let manager = CertificateManager::new(
            portal.clone() as Arc<dyn PortalClient>,
            Arc::new(ScriptedInteractor::with_confirmations(vec![false])),
            CertificateCache::new(dir.path().to_path_buf()),
        );

        let team = mock::team(TeamKind::Free);
        let resolved = manager.resolve(&team, &mock::session()).await.unwrap();

        // Fast path: no prompts, no revocation, key restored from cache.
        assert_eq!(resolved.serial_number, "CACHED1");
        assert_eq!(resolved.private_key.as_deref(), Some(b"key".as_slice()));
        assert_eq!(portal.count(PortalCall::RevokeCertificate), 0);
        assert_eq!(portal.count(PortalCall::AddCertificate), 0);
    }

    #[test]
    fn cache_load_fails_with_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path().to_path_buf());

        let certificate = Certificate {
            serial_number: "CACHED1".into(),
            machine_name: Some("Sideload".into()),
            machine_identifier: Some("RIGHTKEY".into()),
            data: None,
            private_key: None,
        };
        cache.store("ABC123XYZ0", &certificate).unwrap();

        assert!(cache.load("ABC123XYZ0", "WRONGKEY").is_none());
        assert!(cache.load("ABC123XYZ0", "RIGHTKEY").is_some());
    }
}
