//! Scripted in-process collaborators for tests.
//!
//! The mock portal is stateful: registrations mutate its object store the way
//! the real portal would, and every call is recorded so tests can assert on
//! exact call counts (idempotence properties live and die by those counts).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::anisette::AnisetteData;
use crate::device::{DebugSession, DeviceTransport};
use crate::interaction::Interactor;
use crate::notify::Notifier;
use crate::portal::types::{
    Account, AppGroup, AppId, Certificate, Device, DeviceKind, OsVersion, ProvisioningProfile,
    Session, Team, TeamKind,
};
use crate::portal::{PortalClient, PortalError};
use crate::signer::AppSigner;

pub fn anisette() -> AnisetteData {
    AnisetteData {
        machine_id: "machine".into(),
        one_time_password: "otp".into(),
        local_user_id: "local-user".into(),
        routing_info: "17106176".into(),
        device_unique_identifier: "device".into(),
        device_description: "<MacBookPro18,3> <macOS;13.1;22C65> <(com.apple.dt.Xcode/3594.4.19)>"
            .into(),
        date: "2026-08-30T12:00:00Z".into(),
        locale: "en_US".into(),
        time_zone: "UTC".into(),
    }
}

pub fn session() -> Session {
    Session {
        dsid: "12345".into(),
        auth_token: "token".into(),
        anisette: anisette(),
    }
}

pub fn account() -> Account {
    Account {
        apple_id: "tester@example.com".into(),
        identifier: "ACCOUNT1".into(),
        first_name: "Test".into(),
        last_name: "User".into(),
    }
}

pub fn team(kind: TeamKind) -> Team {
    Team {
        name: "Test Team".into(),
        identifier: "ABC123XYZ0".into(),
        kind,
    }
}

pub fn device() -> Device {
    Device {
        name: "Test iPhone".into(),
        identifier: "00008101-000A1B2C3D4E5F".into(),
        kind: DeviceKind::Iphone,
        os_version: Some(OsVersion { major: 17, minor: 2 }),
    }
}

/// Remote operations the mock portal counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalCall {
    Authenticate,
    FetchTeams,
    FetchDevices,
    RegisterDevice,
    FetchCertificates,
    AddCertificate,
    RevokeCertificate,
    FetchAppIds,
    AddAppId,
    UpdateAppId,
    FetchAppGroups,
    AddAppGroup,
    AssignAppIdToGroups,
    FetchProvisioningProfile,
}

#[derive(Default)]
struct PortalState {
    teams: Vec<Team>,
    devices: Vec<Device>,
    certificates: Vec<Certificate>,
    app_ids: Vec<AppId>,
    groups: Vec<AppGroup>,
    created_groups: Vec<AppGroup>,
}

/// Stateful scripted portal.
pub struct MockPortal {
    state: Mutex<PortalState>,
    calls: Mutex<HashMap<PortalCall, u32>>,
    next_id: AtomicU32,
    /// When set, `authenticate` demands a verification code equal to this.
    pub required_verification_code: Option<String>,
}

impl MockPortal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortalState::default()),
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            required_verification_code: None,
        }
    }

    pub fn with_team(self, team: Team) -> Self {
        self.state.lock().unwrap().teams.push(team);
        self
    }

    pub fn with_certificate(self, certificate: Certificate) -> Self {
        self.state.lock().unwrap().certificates.push(certificate);
        self
    }

    pub fn count(&self, call: PortalCall) -> u32 {
        *self.calls.lock().unwrap().get(&call).unwrap_or(&0)
    }

    pub fn created_groups(&self) -> Vec<AppGroup> {
        self.state.lock().unwrap().created_groups.clone()
    }

    pub fn certificates(&self) -> Vec<Certificate> {
        self.state.lock().unwrap().certificates.clone()
    }

    fn record(&self, call: PortalCall) {
        *self.calls.lock().unwrap().entry(call).or_insert(0) += 1;
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for MockPortal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortalClient for MockPortal {
    async fn authenticate(
        &self,
        apple_id: &str,
        _password: &str,
        _anisette: &AnisetteData,
        interactor: &dyn Interactor,
    ) -> Result<(Account, Session), PortalError> {
        self.record(PortalCall::Authenticate);

        if let Some(expected) = &self.required_verification_code {
            match interactor.request_verification_code().await {
                Some(code) if &code == expected => {}
                Some(_) => {
                    return Err(PortalError::Api {
                        code: "-22406".into(),
                        title: "Incorrect Verification Code".into(),
                        detail: "The verification code was incorrect.".into(),
                    });
                }
                None => return Err(PortalError::RequiresTwoFactor),
            }
        }

        let mut account = account();
        account.apple_id = apple_id.to_string();
        Ok((account, session()))
    }

    async fn fetch_teams(
        &self,
        _account: &Account,
        _session: &Session,
    ) -> Result<Vec<Team>, PortalError> {
        self.record(PortalCall::FetchTeams);
        Ok(self.state.lock().unwrap().teams.clone())
    }

    async fn fetch_devices(
        &self,
        kind: DeviceKind,
        _team: &Team,
        _session: &Session,
    ) -> Result<Vec<Device>, PortalError> {
        self.record(PortalCall::FetchDevices);
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .filter(|device| device.kind == kind)
            .cloned()
            .collect())
    }

    async fn register_device(
        &self,
        name: &str,
        identifier: &str,
        kind: DeviceKind,
        _team: &Team,
        _session: &Session,
    ) -> Result<Device, PortalError> {
        self.record(PortalCall::RegisterDevice);
        let device = Device {
            name: name.to_string(),
            identifier: identifier.to_string(),
            kind,
            os_version: None,
        };
        self.state.lock().unwrap().devices.push(device.clone());
        Ok(device)
    }

    async fn fetch_certificates(
        &self,
        _team: &Team,
        _session: &Session,
    ) -> Result<Vec<Certificate>, PortalError> {
        self.record(PortalCall::FetchCertificates);
        // List calls never include private keys.
        Ok(self
            .state
            .lock()
            .unwrap()
            .certificates
            .iter()
            .map(|certificate| Certificate {
                private_key: None,
                ..certificate.clone()
            })
            .collect())
    }

    async fn add_certificate(
        &self,
        machine_name: &str,
        _team: &Team,
        _session: &Session,
    ) -> Result<Certificate, PortalError> {
        self.record(PortalCall::AddCertificate);
        let serial = self.fresh_id("SERIAL");
        let certificate = Certificate {
            serial_number: serial.clone(),
            machine_name: Some(machine_name.to_string()),
            machine_identifier: Some(self.fresh_id("MACHINE")),
            data: Some(vec![0x30, 0x82, 0x01, 0x0a]),
            private_key: Some(b"private-key".to_vec()),
        };
        self.state.lock().unwrap().certificates.push(certificate.clone());
        Ok(certificate)
    }

    async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        _team: &Team,
        _session: &Session,
    ) -> Result<(), PortalError> {
        self.record(PortalCall::RevokeCertificate);
        self.state
            .lock()
            .unwrap()
            .certificates
            .retain(|existing| existing.serial_number != certificate.serial_number);
        Ok(())
    }

    async fn fetch_app_ids(
        &self,
        _team: &Team,
        _session: &Session,
    ) -> Result<Vec<AppId>, PortalError> {
        self.record(PortalCall::FetchAppIds);
        Ok(self.state.lock().unwrap().app_ids.clone())
    }

    async fn add_app_id(
        &self,
        name: &str,
        bundle_identifier: &str,
        _team: &Team,
        _session: &Session,
    ) -> Result<AppId, PortalError> {
        self.record(PortalCall::AddAppId);
        let app_id = AppId {
            identifier: self.fresh_id("APPID"),
            name: name.to_string(),
            bundle_identifier: bundle_identifier.to_string(),
            features: HashMap::new(),
        };
        self.state.lock().unwrap().app_ids.push(app_id.clone());
        Ok(app_id)
    }

    async fn update_app_id(
        &self,
        app_id: &AppId,
        _team: &Team,
        _session: &Session,
    ) -> Result<AppId, PortalError> {
        self.record(PortalCall::UpdateAppId);
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .app_ids
            .iter_mut()
            .find(|existing| existing.identifier == app_id.identifier)
        {
            *existing = app_id.clone();
        }
        Ok(app_id.clone())
    }

    async fn fetch_app_groups(
        &self,
        _team: &Team,
        _session: &Session,
    ) -> Result<Vec<AppGroup>, PortalError> {
        self.record(PortalCall::FetchAppGroups);
        Ok(self.state.lock().unwrap().groups.clone())
    }

    async fn add_app_group(
        &self,
        name: &str,
        group_identifier: &str,
        _team: &Team,
        _session: &Session,
    ) -> Result<AppGroup, PortalError> {
        self.record(PortalCall::AddAppGroup);
        let group = AppGroup {
            identifier: self.fresh_id("GROUP"),
            name: name.to_string(),
            group_identifier: group_identifier.to_string(),
        };
        let mut state = self.state.lock().unwrap();
        state.groups.push(group.clone());
        state.created_groups.push(group.clone());
        Ok(group)
    }

    async fn assign_app_id_to_groups(
        &self,
        _app_id: &AppId,
        _groups: &[AppGroup],
        _team: &Team,
        _session: &Session,
    ) -> Result<(), PortalError> {
        self.record(PortalCall::AssignAppIdToGroups);
        Ok(())
    }

    async fn fetch_provisioning_profile(
        &self,
        app_id: &AppId,
        _device_kind: DeviceKind,
        _team: &Team,
        _session: &Session,
    ) -> Result<ProvisioningProfile, PortalError> {
        self.record(PortalCall::FetchProvisioningProfile);
        let mut entitlements = HashMap::new();
        entitlements.insert(
            crate::portal::types::entitlements::APP_GROUPS.to_string(),
            serde_json::Value::Array(Vec::new()),
        );
        Ok(ProvisioningProfile {
            identifier: self.fresh_id("PROFILE"),
            bundle_identifier: app_id.bundle_identifier.clone(),
            data: b"profile-blob".to_vec(),
            entitlements,
        })
    }
}

/// Interactor with pre-scripted answers.
pub struct ScriptedInteractor {
    pub confirmations: Mutex<Vec<bool>>,
    pub verification_code: Option<String>,
    pub confirm_requests: Mutex<Vec<String>>,
}

impl ScriptedInteractor {
    pub fn accepting() -> Self {
        Self {
            confirmations: Mutex::new(Vec::new()),
            verification_code: None,
            confirm_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_confirmations(answers: Vec<bool>) -> Self {
        Self {
            confirmations: Mutex::new(answers),
            verification_code: None,
            confirm_requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Interactor for ScriptedInteractor {
    async fn confirm(&self, title: &str, _message: &str) -> bool {
        self.confirm_requests.lock().unwrap().push(title.to_string());
        let mut answers = self.confirmations.lock().unwrap();
        if answers.is_empty() { true } else { answers.remove(0) }
    }

    async fn request_verification_code(&self) -> Option<String> {
        self.verification_code.clone()
    }
}

/// Transport that records installs instead of talking to hardware.
#[derive(Default)]
pub struct MockTransport {
    pub installs: Mutex<Vec<(PathBuf, String, Option<HashSet<String>>)>>,
    pub image_mounted: bool,
    pub mounted_images: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn install_app(
        &self,
        package: &Path,
        device_id: &str,
        active_profiles: Option<&HashSet<String>>,
    ) -> anyhow::Result<()> {
        self.installs.lock().unwrap().push((
            package.to_path_buf(),
            device_id.to_string(),
            active_profiles.cloned(),
        ));
        Ok(())
    }

    async fn is_runtime_image_mounted(&self, _device: &Device) -> anyhow::Result<bool> {
        Ok(self.image_mounted)
    }

    async fn install_runtime_image(
        &self,
        disk: &Path,
        _signature: &Path,
        _device: &Device,
    ) -> anyhow::Result<()> {
        self.mounted_images.lock().unwrap().push(disk.to_path_buf());
        Ok(())
    }

    async fn start_debug_session(&self, _device: &Device) -> anyhow::Result<Box<dyn DebugSession>> {
        Ok(Box::new(MockDebugSession))
    }
}

pub struct MockDebugSession;

#[async_trait]
impl DebugSession for MockDebugSession {
    async fn enable_unsigned_execution(&self, _process_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Signer that records what it was asked to sign.
#[derive(Default)]
pub struct MockSigner {
    pub signed: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

#[async_trait]
impl AppSigner for MockSigner {
    async fn sign(
        &self,
        app_path: &Path,
        profiles: &[ProvisioningProfile],
    ) -> anyhow::Result<()> {
        self.signed.lock().unwrap().push((
            app_path.to_path_buf(),
            profiles
                .iter()
                .map(|profile| profile.bundle_identifier.clone())
                .collect(),
        ));
        Ok(())
    }
}

/// Notifier that records titles.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, _body: &str) {
        self.notifications.lock().unwrap().push(title.to_string());
    }
}
