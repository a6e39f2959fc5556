//! The installation pipeline.
//!
//! A run is a fixed sequence of stages driven by one loop; each stage reads
//! and extends a shared context, and a stage failure is wrapped with that
//! stage's display title so the surfaced error names what was being attempted
//! while the cause is preserved underneath. Observers get structured stage
//! events rather than anything printed inline.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{info, warn};
use tempfile::TempDir;
use url::Url;

use crate::anisette::AnisetteBroker;
use crate::app::{self, Application};
use crate::certificates::CertificateManager;
use crate::device::{self, DeviceTransport};
use crate::disk::DeveloperDiskManager;
use crate::error::InstallError;
use crate::interaction::Interactor;
use crate::notify::Notifier;
use crate::portal::registration::register_device;
use crate::portal::types::{Account, Certificate, Device, ProvisioningProfile, Session, Team, TeamKind};
use crate::portal::PortalClient;
use crate::profiles::resolve_profiles;
use crate::signer::{AppSigner, PackageMetadata, prepare_package};

/// Where the package to install comes from.
#[derive(Debug, Clone)]
pub enum PackageSource {
    Local(PathBuf),
    Remote(Url),
}

/// One installation request.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub apple_id: String,
    pub password: String,
    pub device: Device,
    pub source: PackageSource,
}

/// The stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authenticate,
    FetchTeam,
    RegisterDevice,
    FetchCertificate,
    PrepareDevice,
    StagePackage,
    RefreshAnisette,
    FetchProfiles,
    Sign,
    Install,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Authenticate,
        Stage::FetchTeam,
        Stage::RegisterDevice,
        Stage::FetchCertificate,
        Stage::PrepareDevice,
        Stage::StagePackage,
        Stage::RefreshAnisette,
        Stage::FetchProfiles,
        Stage::Sign,
        Stage::Install,
    ];

    /// Display title used when the stage fails.
    pub fn title(self) -> &'static str {
        match self {
            Stage::Authenticate => "Failed to Authenticate",
            Stage::FetchTeam => "Failed to Fetch Team",
            Stage::RegisterDevice => "Failed to Register Device",
            Stage::FetchCertificate => "Failed to Fetch Certificate",
            Stage::PrepareDevice => "Failed to Prepare Device",
            Stage::StagePackage => "Failed to Stage App",
            Stage::RefreshAnisette => "Failed to Refresh Session",
            Stage::FetchProfiles => "Failed to Fetch Provisioning Profiles",
            Stage::Sign => "Failed to Sign App",
            Stage::Install => "Failed to Install App",
        }
    }
}

/// Structured progress events for a run.
pub trait PipelineObserver: Send + Sync {
    fn stage_started(&self, stage: Stage);
}

/// Observer that reports stage transitions to the log.
pub struct LogObserver;

impl PipelineObserver for LogObserver {
    fn stage_started(&self, stage: Stage) {
        info!("stage {stage:?}");
    }
}

/// State accumulated across stages. Fields are filled in execution order;
/// each stage only reads fields that earlier stages produced.
#[derive(Default)]
struct RunContext {
    account: Option<Account>,
    session: Option<Session>,
    team: Option<Team>,
    device: Option<Device>,
    certificate: Option<Certificate>,
    /// Keeps the unpacked package alive until install completes.
    staging: Option<TempDir>,
    app: Option<Application>,
    profiles: HashMap<String, ProvisioningProfile>,
    active_profiles: Option<HashSet<String>>,
}

impl RunContext {
    fn session(&self) -> Result<&Session> {
        self.session.as_ref().context("no authenticated session")
    }

    fn team(&self) -> Result<&Team> {
        self.team.as_ref().context("no team resolved")
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().context("no device registered")
    }

    fn app(&self) -> Result<&Application> {
        self.app.as_ref().context("no package staged")
    }
}

pub struct InstallPipeline {
    portal: Arc<dyn PortalClient>,
    interactor: Arc<dyn Interactor>,
    transport: Arc<dyn DeviceTransport>,
    notifier: Arc<dyn Notifier>,
    anisette: Arc<AnisetteBroker>,
    certificates: Arc<CertificateManager>,
    disks: Arc<DeveloperDiskManager>,
    /// Produces a signer bound to the run's resolved certificate.
    signer_factory: Box<dyn Fn(&Certificate) -> Arc<dyn AppSigner> + Send + Sync>,
    http: reqwest::Client,
    /// Stable identifier of this installation, recorded into companion apps.
    server_id: String,
}

impl InstallPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portal: Arc<dyn PortalClient>,
        interactor: Arc<dyn Interactor>,
        transport: Arc<dyn DeviceTransport>,
        notifier: Arc<dyn Notifier>,
        anisette: Arc<AnisetteBroker>,
        certificates: Arc<CertificateManager>,
        disks: Arc<DeveloperDiskManager>,
        signer_factory: Box<dyn Fn(&Certificate) -> Arc<dyn AppSigner> + Send + Sync>,
        server_id: String,
    ) -> Self {
        Self {
            portal,
            interactor,
            transport,
            notifier,
            anisette,
            certificates,
            disks,
            signer_factory,
            http: reqwest::Client::new(),
            server_id,
        }
    }

    /// Run the full installation for `request`, reporting stage transitions
    /// to `observer`.
    pub async fn run(&self, request: &InstallRequest, observer: &dyn PipelineObserver) -> Result<()> {
        let mut context = RunContext::default();

        for stage in Stage::ALL {
            observer.stage_started(stage);
            self.run_stage(stage, request, &mut context)
                .await
                .map_err(|error| InstallError::stage(stage.title(), error))?;
        }

        let app = context.app()?;
        let device = context.device()?;
        self.notifier.notify(
            "Installation Succeeded",
            &format!("{} was successfully installed to {}.", app.name, device.name),
        );
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: Stage,
        request: &InstallRequest,
        context: &mut RunContext,
    ) -> Result<()> {
        match stage {
            Stage::Authenticate => {
                let anisette = self.anisette.acquire().await?;
                let (account, session) = self
                    .portal
                    .authenticate(
                        &request.apple_id,
                        &request.password,
                        &anisette,
                        self.interactor.as_ref(),
                    )
                    .await?;
                info!("authenticated as {}", account.apple_id);
                context.account = Some(account);
                context.session = Some(session);
            }

            Stage::FetchTeam => {
                let account = context.account.as_ref().context("no account")?;
                let teams = self
                    .portal
                    .fetch_teams(account, context.session()?)
                    .await?;
                let team = teams.into_iter().next().ok_or(InstallError::NoTeam)?;
                info!("using team {} ({})", team.name, team.identifier);
                context.team = Some(team);
            }

            Stage::RegisterDevice => {
                let registered = register_device(
                    self.portal.as_ref(),
                    &request.device,
                    context.team()?,
                    context.session()?,
                )
                .await?;
                context.device = Some(registered);
            }

            Stage::FetchCertificate => {
                let certificate = self
                    .certificates
                    .resolve(context.team()?, context.session()?)
                    .await?;
                context.certificate = Some(certificate);
            }

            Stage::PrepareDevice => {
                // For a remote package the installation is announced here,
                // before the download makes the user wait; the app name is
                // not known yet. Local packages announce after loading, when
                // the name is.
                if let PackageSource::Remote(url) = &request.source {
                    self.notifier.notify(
                        "Installing App",
                        &format!("Downloading package from {url}."),
                    );
                }

                // Mounting the runtime image is best-effort: a failure here
                // must not abort the installation.
                if let Err(error) =
                    device::prepare(self.transport.as_ref(), &self.disks, context.device()?).await
                {
                    warn!("could not prepare device: {error:#}");
                }
            }

            Stage::StagePackage => {
                let (staging, app) = self.stage_package(request).await?;
                context.staging = Some(staging);
                context.app = Some(app);
            }

            Stage::RefreshAnisette => {
                // Profile issuance is one of the calls the portal considers
                // sensitive and validates against fresh attestation data.
                let anisette = self.anisette.acquire().await?;
                context
                    .session
                    .as_mut()
                    .context("no authenticated session")?
                    .refresh_anisette(anisette);
            }

            Stage::FetchProfiles => {
                let app = context.app.take().context("no package staged")?;
                let team = context.team()?;

                let profiles = resolve_profiles(
                    self.portal.as_ref(),
                    &app,
                    context.device()?.kind,
                    team,
                    context.session()?,
                )
                .await?;

                // Free-tier accounts are limited in active provisioning
                // profiles, but only the companion app is allowed to displace
                // the profiles of other installed apps.
                if team.kind == TeamKind::Free && app.is_companion() {
                    context.active_profiles = Some(
                        profiles
                            .values()
                            .map(|profile| profile.bundle_identifier.clone())
                            .collect(),
                    );
                }

                context.profiles = profiles;
                context.app = Some(app);
            }

            Stage::Sign => {
                let app = context.app()?;
                let certificate = context
                    .certificate
                    .as_ref()
                    .context("no certificate resolved")?;

                let metadata = PackageMetadata {
                    device: context.device()?,
                    server_id: &self.server_id,
                    certificate,
                };
                prepare_package(app, &context.profiles, &metadata)?;

                let signer = (self.signer_factory)(certificate);
                let profiles: Vec<ProvisioningProfile> =
                    context.profiles.values().cloned().collect();
                signer.sign(&app.path, &profiles).await?;
            }

            Stage::Install => {
                let app = context.app()?;
                let device = context.device()?;

                let staging = context.staging.as_ref().context("no package staged")?;
                let package = staging.path().join("signed.ipa");
                app::pack_ipa(&app.path, &package)?;

                self.transport
                    .install_app(&package, &device.identifier, context.active_profiles.as_ref())
                    .await?;
                info!("installed {} to {}", app.name, device.name);
            }
        }

        Ok(())
    }

    /// Obtain the package, unpack it into a run-scoped staging directory, and
    /// load it. The remote announcement already happened before device
    /// preparation; local packages announce here, once the name is known.
    async fn stage_package(&self, request: &InstallRequest) -> Result<(TempDir, Application)> {
        let staging = tempfile::tempdir()?;

        let ipa_path = match &request.source {
            PackageSource::Local(path) => path.clone(),
            PackageSource::Remote(url) => {
                let response = self.http.get(url.clone()).send().await?.error_for_status()?;
                let bytes = response.bytes().await?;

                let path = staging.path().join("package.ipa");
                tokio::fs::write(&path, &bytes).await?;
                path
            }
        };

        let unpack_dir = staging.path().join("unpacked");
        let app_path = app::unpack_ipa(&ipa_path, &unpack_dir)?;
        let app = Application::load(&app_path)?;

        if matches!(request.source, PackageSource::Local(_)) {
            self.notifier.notify(
                "Installing App",
                &format!("Installing {} to {}.", app.name, request.device.name),
            );
        }

        Ok((staging, app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anisette::sources::NullPluginBus;
    use crate::anisette::{AnisetteData, PrimarySource};
    use crate::certificates::CertificateCache;
    use crate::error::AnisetteError;
    use crate::mock::{self, MockPortal, MockSigner, MockTransport, RecordingNotifier, ScriptedInteractor};
    use std::fs;
    use std::sync::Mutex;

    struct FixedPrimary;

    #[async_trait::async_trait]
    impl PrimarySource for FixedPrimary {
        fn bundle_id(&self) -> &str {
            "io.sideloadd.svc"
        }

        async fn request(&self) -> Result<AnisetteData, AnisetteError> {
            Ok(mock::anisette())
        }
    }

    struct Harness {
        portal: Arc<MockPortal>,
        transport: Arc<MockTransport>,
        signer: Arc<MockSigner>,
        notifier: Arc<RecordingNotifier>,
        pipeline: InstallPipeline,
        _root: tempfile::TempDir,
    }

    fn harness(portal: MockPortal) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let portal = Arc::new(portal);
        let transport = Arc::new(MockTransport {
            image_mounted: true,
            ..MockTransport::default()
        });
        let signer = Arc::new(MockSigner::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let anisette = Arc::new(AnisetteBroker::new(
            Arc::new(FixedPrimary),
            Arc::new(NullPluginBus),
        ));
        let certificates = Arc::new(CertificateManager::new(
            portal.clone() as Arc<dyn PortalClient>,
            Arc::new(ScriptedInteractor::accepting()),
            CertificateCache::new(root.path().join("certificates")),
        ));
        let disks = Arc::new(DeveloperDiskManager::with_feed_url(
            root.path().join("developer-disks"),
            "http://127.0.0.1:1/feed.json".into(),
        ));

        let signer_factory: Box<dyn Fn(&Certificate) -> Arc<dyn AppSigner> + Send + Sync> = {
            let signer = signer.clone();
            Box::new(move |_| signer.clone() as Arc<dyn AppSigner>)
        };

        let pipeline = InstallPipeline::new(
            portal.clone() as Arc<dyn PortalClient>,
            Arc::new(ScriptedInteractor::accepting()),
            transport.clone() as Arc<dyn DeviceTransport>,
            notifier.clone() as Arc<dyn Notifier>,
            anisette,
            certificates,
            disks,
            signer_factory,
            "SERVER1".into(),
        );

        Harness {
            portal,
            transport,
            signer,
            notifier,
            pipeline,
            _root: root,
        }
    }

    fn local_ipa(dir: &std::path::Path, bundle_id: &str, name: &str) -> PathBuf {
        let bundle = dir.join(format!("{name}.app"));
        fs::create_dir_all(&bundle).unwrap();
        let mut info = plist::Dictionary::new();
        info.insert("CFBundleIdentifier".into(), plist::Value::from(bundle_id));
        info.insert("CFBundleName".into(), plist::Value::from(name));
        plist::to_file_xml(bundle.join("Info.plist"), &info).unwrap();

        let ipa = dir.join(format!("{name}.ipa"));
        app::pack_ipa(&bundle, &ipa).unwrap();
        ipa
    }

    /// Observer recording the stage order.
    #[derive(Default)]
    struct RecordingObserver {
        stages: Mutex<Vec<Stage>>,
    }

    impl PipelineObserver for RecordingObserver {
        fn stage_started(&self, stage: Stage) {
            self.stages.lock().unwrap().push(stage);
        }
    }

    #[tokio::test]
    async fn local_package_installs_end_to_end() {
        use crate::portal::types::TeamKind;

        let dir = tempfile::tempdir().unwrap();
        let ipa = local_ipa(dir.path(), "com.example.app", "Example");

        let h = harness(MockPortal::new().with_team(mock::team(TeamKind::Free)));
        let request = InstallRequest {
            apple_id: "tester@example.com".into(),
            password: "secret".into(),
            device: mock::device(),
            source: PackageSource::Local(ipa),
        };

        let observer = RecordingObserver::default();
        h.pipeline.run(&request, &observer).await.unwrap();

        assert_eq!(*observer.stages.lock().unwrap(), Stage::ALL.to_vec());

        // One signed install, no active-profile restriction for a regular app.
        let installs = h.transport.installs.lock().unwrap();
        assert_eq!(installs.len(), 1);
        assert!(installs[0].2.is_none());

        let signed = h.signer.signed.lock().unwrap();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].1, vec!["com.example.app.ABC123XYZ0".to_string()]);

        let notifications = h.notifier.notifications.lock().unwrap();
        assert!(notifications.contains(&"Installing App".to_string()));
        assert!(notifications.contains(&"Installation Succeeded".to_string()));
    }

    #[tokio::test]
    async fn companion_on_free_team_restricts_active_profiles() {
        use crate::app::COMPANION_BUNDLE_ID;
        use crate::portal::types::TeamKind;

        let dir = tempfile::tempdir().unwrap();
        let ipa = local_ipa(dir.path(), COMPANION_BUNDLE_ID, "Store");

        let h = harness(MockPortal::new().with_team(mock::team(TeamKind::Free)));
        let request = InstallRequest {
            apple_id: "tester@example.com".into(),
            password: "secret".into(),
            device: mock::device(),
            source: PackageSource::Local(ipa),
        };

        h.pipeline.run(&request, &LogObserver).await.unwrap();

        let installs = h.transport.installs.lock().unwrap();
        let active = installs[0].2.as_ref().unwrap();
        assert!(active.contains(&format!("com.ABC123XYZ0.{COMPANION_BUNDLE_ID}")));
    }

    #[tokio::test]
    async fn no_team_fails_with_the_stage_title() {
        let dir = tempfile::tempdir().unwrap();
        let ipa = local_ipa(dir.path(), "com.example.app", "Example");

        let h = harness(MockPortal::new());
        let request = InstallRequest {
            apple_id: "tester@example.com".into(),
            password: "secret".into(),
            device: mock::device(),
            source: PackageSource::Local(ipa),
        };

        let error = h.pipeline.run(&request, &LogObserver).await.unwrap_err();
        assert_eq!(error.to_string(), "Failed to Fetch Team");
        assert_eq!(h.portal.count(crate::mock::PortalCall::RegisterDevice), 0);
    }

    #[tokio::test]
    async fn two_factor_refusal_is_a_silent_authentication_failure() {
        use crate::portal::types::TeamKind;

        let dir = tempfile::tempdir().unwrap();
        let ipa = local_ipa(dir.path(), "com.example.app", "Example");

        let mut portal = MockPortal::new().with_team(mock::team(TeamKind::Free));
        portal.required_verification_code = Some("123456".into());

        let h = harness(portal);
        let request = InstallRequest {
            apple_id: "tester@example.com".into(),
            password: "secret".into(),
            device: mock::device(),
            source: PackageSource::Local(ipa),
        };

        // ScriptedInteractor::accepting has no verification code to give.
        let error = h.pipeline.run(&request, &LogObserver).await.unwrap_err();
        assert!(crate::error::is_silent_failure(&error));
    }
}
