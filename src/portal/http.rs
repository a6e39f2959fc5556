//! Production portal transport.
//!
//! Calls go through a JSON gateway: every operation is a POST with the
//! session and attestation data carried in headers. Responses use a uniform
//! envelope; a structured error body is decoded into [`PortalError::Api`],
//! except for the verification-required code which drives the two-factor
//! exchange during authentication.

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::types::{
    Account, AppGroup, AppId, Certificate, Device, DeviceKind, ProvisioningProfile, Session, Team,
};
use super::{PortalClient, PortalError};
use crate::anisette::AnisetteData;
use crate::interaction::Interactor;

const DEFAULT_GATEWAY_URL: &str = "https://gateway.sideloadd.io/v1";

/// Gateway error code demanding a one-time verification code.
const CODE_VERIFICATION_REQUIRED: &str = "-22421";

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    title: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Error { error: ApiErrorBody },
    Ok(T),
}

pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_GATEWAY_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        anisette: &AnisetteData,
        session: Option<&Session>,
        body: serde_json::Value,
    ) -> Result<T, PortalError> {
        debug!("POST {endpoint}");

        let mut request = self
            .client
            .post(format!("{}/{endpoint}", self.base_url))
            .header("X-Apple-I-MD", &anisette.one_time_password)
            .header("X-Apple-I-MD-M", &anisette.machine_id)
            .header("X-Apple-I-MD-LU", &anisette.local_user_id)
            .header("X-Apple-I-MD-RINFO", &anisette.routing_info)
            .header("X-Mme-Device-Id", &anisette.device_unique_identifier)
            .header("X-Mme-Client-Info", &anisette.device_description)
            .header("X-Apple-I-Client-Time", &anisette.date)
            .header("X-Apple-Locale", &anisette.locale)
            .header("X-Apple-I-TimeZone", &anisette.time_zone)
            .json(&body);

        if let Some(session) = session {
            request = request
                .header("X-Dsid", &session.dsid)
                .header("X-Auth-Token", &session.auth_token);
        }

        let response = request.send().await?.error_for_status()?;
        let envelope: Envelope<T> = serde_json::from_slice(&response.bytes().await?)?;

        match envelope {
            Envelope::Ok(payload) => Ok(payload),
            Envelope::Error { error } => Err(PortalError::Api {
                code: error.code,
                title: error.title,
                detail: error.detail,
            }),
        }
    }
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    account: Account,
    dsid: String,
    auth_token: String,
}

#[derive(Debug, Deserialize)]
struct TeamsResponse {
    teams: Vec<Team>,
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    device: Device,
}

#[derive(Debug, Deserialize)]
struct CertificatesResponse {
    certificates: Vec<Certificate>,
}

#[derive(Debug, Deserialize)]
struct CertificateResponse {
    certificate: Certificate,
}

#[derive(Debug, Deserialize)]
struct AppIdsResponse {
    app_ids: Vec<AppId>,
}

#[derive(Debug, Deserialize)]
struct AppIdResponse {
    app_id: AppId,
}

#[derive(Debug, Deserialize)]
struct AppGroupsResponse {
    app_groups: Vec<AppGroup>,
}

#[derive(Debug, Deserialize)]
struct AppGroupResponse {
    app_group: AppGroup,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    provisioning_profile: ProvisioningProfile,
}

#[derive(Debug, Deserialize)]
struct EmptyResponse {}

fn device_kind_value(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Iphone => "iphone",
        DeviceKind::Ipad => "ipad",
        DeviceKind::Appletv => "appletv",
    }
}

#[async_trait]
impl PortalClient for GatewayClient {
    async fn authenticate(
        &self,
        apple_id: &str,
        password: &str,
        anisette: &AnisetteData,
        interactor: &dyn Interactor,
    ) -> Result<(Account, Session), PortalError> {
        // Only a digest of the password leaves the process.
        let password_hash = hex::encode(Sha256::digest(password.as_bytes()));

        let mut verification_code: Option<String> = None;
        loop {
            let mut body = json!({
                "appleId": apple_id,
                "passwordHash": password_hash,
            });
            if let Some(code) = &verification_code {
                body["verificationCode"] = json!(code);
            }

            match self
                .post::<AuthResponse>("auth/login", anisette, None, body)
                .await
            {
                Ok(response) => {
                    info!("authenticated {apple_id}");
                    let session = Session {
                        dsid: response.dsid,
                        auth_token: response.auth_token,
                        anisette: anisette.clone(),
                    };
                    return Ok((response.account, session));
                }
                Err(PortalError::Api { code, .. })
                    if code == CODE_VERIFICATION_REQUIRED && verification_code.is_none() =>
                {
                    // One retry with a code; a second demand means the code
                    // was consumed and rejected, which surfaces as-is.
                    match interactor.request_verification_code().await {
                        Some(code) => verification_code = Some(code),
                        None => return Err(PortalError::RequiresTwoFactor),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn fetch_teams(
        &self,
        _account: &Account,
        session: &Session,
    ) -> Result<Vec<Team>, PortalError> {
        let response: TeamsResponse = self
            .post("teams/list", &session.anisette, Some(session), json!({}))
            .await?;
        Ok(response.teams)
    }

    async fn fetch_devices(
        &self,
        kind: DeviceKind,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<Device>, PortalError> {
        let response: DevicesResponse = self
            .post(
                "devices/list",
                &session.anisette,
                Some(session),
                json!({ "teamId": team.identifier, "deviceKind": device_kind_value(kind) }),
            )
            .await?;
        Ok(response.devices)
    }

    async fn register_device(
        &self,
        name: &str,
        identifier: &str,
        kind: DeviceKind,
        team: &Team,
        session: &Session,
    ) -> Result<Device, PortalError> {
        let response: DeviceResponse = self
            .post(
                "devices/register",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "name": name,
                    "deviceId": identifier,
                    "deviceKind": device_kind_value(kind),
                }),
            )
            .await?;
        Ok(response.device)
    }

    async fn fetch_certificates(
        &self,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<Certificate>, PortalError> {
        let response: CertificatesResponse = self
            .post(
                "certificates/list",
                &session.anisette,
                Some(session),
                json!({ "teamId": team.identifier }),
            )
            .await?;
        Ok(response.certificates)
    }

    async fn add_certificate(
        &self,
        machine_name: &str,
        team: &Team,
        session: &Session,
    ) -> Result<Certificate, PortalError> {
        let response: CertificateResponse = self
            .post(
                "certificates/create",
                &session.anisette,
                Some(session),
                json!({ "teamId": team.identifier, "machineName": machine_name }),
            )
            .await?;
        Ok(response.certificate)
    }

    async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        team: &Team,
        session: &Session,
    ) -> Result<(), PortalError> {
        let _: EmptyResponse = self
            .post(
                "certificates/revoke",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "serialNumber": certificate.serial_number,
                }),
            )
            .await?;
        Ok(())
    }

    async fn fetch_app_ids(
        &self,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<AppId>, PortalError> {
        let response: AppIdsResponse = self
            .post(
                "app-ids/list",
                &session.anisette,
                Some(session),
                json!({ "teamId": team.identifier }),
            )
            .await?;
        Ok(response.app_ids)
    }

    async fn add_app_id(
        &self,
        name: &str,
        bundle_identifier: &str,
        team: &Team,
        session: &Session,
    ) -> Result<AppId, PortalError> {
        let response: AppIdResponse = self
            .post(
                "app-ids/create",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "name": name,
                    "bundleId": bundle_identifier,
                }),
            )
            .await?;
        Ok(response.app_id)
    }

    async fn update_app_id(
        &self,
        app_id: &AppId,
        team: &Team,
        session: &Session,
    ) -> Result<AppId, PortalError> {
        let response: AppIdResponse = self
            .post(
                "app-ids/update",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "appIdId": app_id.identifier,
                    "features": app_id.features,
                }),
            )
            .await?;
        Ok(response.app_id)
    }

    async fn fetch_app_groups(
        &self,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<AppGroup>, PortalError> {
        let response: AppGroupsResponse = self
            .post(
                "app-groups/list",
                &session.anisette,
                Some(session),
                json!({ "teamId": team.identifier }),
            )
            .await?;
        Ok(response.app_groups)
    }

    async fn add_app_group(
        &self,
        name: &str,
        group_identifier: &str,
        team: &Team,
        session: &Session,
    ) -> Result<AppGroup, PortalError> {
        let response: AppGroupResponse = self
            .post(
                "app-groups/create",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "name": name,
                    "groupId": group_identifier,
                }),
            )
            .await?;
        Ok(response.app_group)
    }

    async fn assign_app_id_to_groups(
        &self,
        app_id: &AppId,
        groups: &[AppGroup],
        team: &Team,
        session: &Session,
    ) -> Result<(), PortalError> {
        let group_ids: Vec<&str> = groups
            .iter()
            .map(|group| group.identifier.as_str())
            .collect();
        let _: EmptyResponse = self
            .post(
                "app-groups/assign",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "appIdId": app_id.identifier,
                    "groupIds": group_ids,
                }),
            )
            .await?;
        Ok(())
    }

    async fn fetch_provisioning_profile(
        &self,
        app_id: &AppId,
        device_kind: DeviceKind,
        team: &Team,
        session: &Session,
    ) -> Result<ProvisioningProfile, PortalError> {
        let response: ProfileResponse = self
            .post(
                "profiles/download",
                &session.anisette,
                Some(session),
                json!({
                    "teamId": team.identifier,
                    "appIdId": app_id.identifier,
                    "deviceKind": device_kind_value(device_kind),
                }),
            )
            .await?;
        Ok(response.provisioning_profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_decodes_to_api_error() {
        let envelope: Envelope<TeamsResponse> = serde_json::from_str(
            r#"{"error":{"code":"-22406","title":"Incorrect Verification Code","detail":"Try again."}}"#,
        )
        .unwrap();

        assert!(matches!(
            envelope,
            Envelope::Error { ref error } if error.code == "-22406"
        ));
    }

    #[test]
    fn success_envelope_decodes_payload() {
        let envelope: Envelope<ProfileResponse> = serde_json::from_str(
            r#"{
                "provisioning_profile": {
                    "identifier": "PROFILE1",
                    "bundle_identifier": "com.example.app.ABC123XYZ0",
                    "data": "cHJvZmlsZQ=="
                }
            }"#,
        )
        .unwrap();

        let Envelope::Ok(response) = envelope else {
            panic!("expected success envelope");
        };
        assert_eq!(response.provisioning_profile.data, b"profile");
    }
}
