//! Data model for developer-portal objects.
//!
//! Everything here is created fresh per pipeline run and discarded at run end;
//! the only state that outlives a run is the encrypted certificate blob cached
//! on disk (see `certificates`).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::anisette::AnisetteData;

/// Authenticated identity. Immutable once obtained.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub apple_id: String,
    pub identifier: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Short-lived authentication token bound to an [`Account`] plus the
/// attestation data used to obtain it. Must be refreshed with new anisette
/// data before calls the portal considers sensitive.
#[derive(Debug, Clone)]
pub struct Session {
    pub dsid: String,
    pub auth_token: String,
    pub anisette: AnisetteData,
}

impl Session {
    /// Merge fresh attestation data into the session before a sensitive call.
    pub fn refresh_anisette(&mut self, anisette: AnisetteData) {
        self.anisette = anisette;
    }
}

/// Developer-account team tier. Drives certificate-revocation prompts and the
/// free-tier active-profile restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamKind {
    Free,
    Individual,
    Organization,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    pub name: String,
    pub identifier: String,
    pub kind: TeamKind,
}

/// Declared device family. The portal issues separate device records and
/// profiles per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Iphone,
    Ipad,
    Appletv,
}

/// OS version pair used to key the runtime-support image cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Target device, identified by its stable hardware identifier (UDID).
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub name: String,
    pub identifier: String,
    pub kind: DeviceKind,
    /// Known locally, not returned by the portal; carried onto the registered
    /// record after fetch-or-create.
    #[serde(default)]
    pub os_version: Option<OsVersion>,
}

/// The single signing identity for a team.
///
/// `machine_identifier` doubles as the key for the encrypted on-disk cache
/// blob. At most one certificate may exist per team on the portal at a time;
/// the certificate manager enforces revoke-before-create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub serial_number: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub machine_identifier: Option<String>,
    /// DER-encoded certificate, when the portal returned it.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    /// Locally-held private key. Never returned by list calls; attached after
    /// a create by matching serial numbers.
    #[serde(default)]
    pub private_key: Option<Vec<u8>>,
}

/// Portal registration binding a bundle identifier to a team and a set of
/// enabled capability values.
#[derive(Debug, Clone, Deserialize)]
pub struct AppId {
    pub identifier: String,
    pub name: String,
    pub bundle_identifier: String,
    #[serde(default)]
    pub features: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppGroup {
    pub identifier: String,
    pub name: String,
    pub group_identifier: String,
}

/// Portal-issued artifact binding an AppID, a device family, and a team.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningProfile {
    pub identifier: String,
    /// The adjusted bundle identifier the profile was issued for.
    pub bundle_identifier: String,
    /// Raw profile blob, embedded into the package by the signer.
    #[serde(with = "crate::portal::base64_bytes")]
    pub data: Vec<u8>,
    /// Entitlements granted by the profile; the signer copies the granted
    /// app-group list into the package metadata.
    #[serde(default)]
    pub entitlements: HashMap<String, serde_json::Value>,
}

/// Entitlement keys the resolver understands.
pub mod entitlements {
    pub const APP_GROUPS: &str = "com.apple.security.application-groups";
    pub const INTER_APP_AUDIO: &str = "inter-app-audio";
    pub const PUSH: &str = "aps-environment";
}

/// Portal feature identifiers for AppID capability synchronization.
pub mod features {
    pub const APP_GROUPS: &str = "APG3427HIY";
    pub const INTER_APP_AUDIO: &str = "IAD53UNK2F";
    pub const PUSH: &str = "push";
}

/// Maps an entitlement key to the portal feature it enables, if any.
pub fn feature_for_entitlement(entitlement: &str) -> Option<&'static str> {
    match entitlement {
        entitlements::APP_GROUPS => Some(features::APP_GROUPS),
        entitlements::INTER_APP_AUDIO => Some(features::INTER_APP_AUDIO),
        entitlements::PUSH => Some(features::PUSH),
        _ => None,
    }
}
