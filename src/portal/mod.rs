//! Typed contract with the external developer portal.
//!
//! The portal itself is an external service; this module defines the
//! operations the pipeline needs ([`PortalClient`]), the object model
//! ([`types`]), and the idempotent fetch-or-create wrappers layered on top
//! ([`registration`]). The production transport lives in [`http`].

pub mod http;
pub mod registration;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

use crate::anisette::AnisetteData;
use crate::interaction::Interactor;
use types::{
    Account, AppGroup, AppId, Certificate, Device, DeviceKind, ProvisioningProfile, Session, Team,
};

/// Errors surfaced by the portal boundary.
#[derive(Debug, Error)]
pub enum PortalError {
    /// The account requires a verification code and the user declined to
    /// provide one. Filtered silently at the outermost caller.
    #[error("This account requires two-factor authentication.")]
    RequiresTwoFactor,

    /// Structured error payload returned by the portal.
    #[error("{title}: {detail}")]
    Api {
        code: String,
        title: String,
        detail: String,
    },

    #[error("portal request failed")]
    Http(#[from] reqwest::Error),

    #[error("unexpected portal response")]
    Decode(#[from] serde_json::Error),
}

/// Operations against the developer portal, one method per remote call.
///
/// Implementations are request-scoped and stateless; idempotence is layered
/// on in [`registration`], not here.
#[async_trait]
pub trait PortalClient: Send + Sync {
    /// Authenticate with the given credentials and attestation data. The
    /// portal may demand a one-time verification code mid-call; it is
    /// requested through `interactor` and a declined prompt fails with
    /// [`PortalError::RequiresTwoFactor`].
    async fn authenticate(
        &self,
        apple_id: &str,
        password: &str,
        anisette: &AnisetteData,
        interactor: &dyn Interactor,
    ) -> Result<(Account, Session), PortalError>;

    async fn fetch_teams(
        &self,
        account: &Account,
        session: &Session,
    ) -> Result<Vec<Team>, PortalError>;

    async fn fetch_devices(
        &self,
        kind: DeviceKind,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<Device>, PortalError>;

    async fn register_device(
        &self,
        name: &str,
        identifier: &str,
        kind: DeviceKind,
        team: &Team,
        session: &Session,
    ) -> Result<Device, PortalError>;

    async fn fetch_certificates(
        &self,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<Certificate>, PortalError>;

    async fn add_certificate(
        &self,
        machine_name: &str,
        team: &Team,
        session: &Session,
    ) -> Result<Certificate, PortalError>;

    async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        team: &Team,
        session: &Session,
    ) -> Result<(), PortalError>;

    async fn fetch_app_ids(
        &self,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<AppId>, PortalError>;

    async fn add_app_id(
        &self,
        name: &str,
        bundle_identifier: &str,
        team: &Team,
        session: &Session,
    ) -> Result<AppId, PortalError>;

    /// Push the AppID's current local feature set to the portal.
    async fn update_app_id(
        &self,
        app_id: &AppId,
        team: &Team,
        session: &Session,
    ) -> Result<AppId, PortalError>;

    async fn fetch_app_groups(
        &self,
        team: &Team,
        session: &Session,
    ) -> Result<Vec<AppGroup>, PortalError>;

    async fn add_app_group(
        &self,
        name: &str,
        group_identifier: &str,
        team: &Team,
        session: &Session,
    ) -> Result<AppGroup, PortalError>;

    async fn assign_app_id_to_groups(
        &self,
        app_id: &AppId,
        groups: &[AppGroup],
        team: &Team,
        session: &Session,
    ) -> Result<(), PortalError>;

    async fn fetch_provisioning_profile(
        &self,
        app_id: &AppId,
        device_kind: DeviceKind,
        team: &Team,
        session: &Session,
    ) -> Result<ProvisioningProfile, PortalError>;
}

/// Serde helper for binary blobs carried as base64 strings in portal payloads.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
