//! Idempotent fetch-or-create wrappers over the raw portal operations.
//!
//! Every registration first lists existing objects and returns a match by its
//! natural key, so re-running a pipeline never creates duplicates. Feature
//! synchronization only writes when something actually changed, to avoid
//! needless portal writes and the rate-limit risk that comes with them.

use log::debug;
use serde_json::Value;
use tokio::sync::Mutex;

use super::types::{AppId, Device, Session, Team, feature_for_entitlement};
use super::{PortalClient, PortalError};
use crate::app::Application;

/// Serializes group resolution across concurrent runs targeting the same
/// portal account, so two runs cannot race to create the same group twice.
static APP_GROUPS_LOCK: Mutex<()> = Mutex::const_new(());

/// Display-name prefix for groups this tool creates.
const GROUP_NAME_PREFIX: &str = "Sideload";

/// Ensure `device` is registered with the team, returning the portal record
/// with the locally-known OS version carried over.
pub async fn register_device(
    portal: &dyn PortalClient,
    device: &Device,
    team: &Team,
    session: &Session,
) -> Result<Device, PortalError> {
    let devices = portal.fetch_devices(device.kind, team, session).await?;

    let mut registered = match devices
        .into_iter()
        .find(|existing| existing.identifier == device.identifier)
    {
        Some(existing) => existing,
        None => {
            portal
                .register_device(&device.name, &device.identifier, device.kind, team, session)
                .await?
        }
    };

    // The portal does not track OS versions; the disk-image lookup needs it.
    registered.os_version = device.os_version;
    Ok(registered)
}

/// Ensure an AppID exists for `bundle_identifier`, returning the existing one
/// when present.
pub async fn register_app_id(
    portal: &dyn PortalClient,
    name: &str,
    bundle_identifier: &str,
    team: &Team,
    session: &Session,
) -> Result<AppId, PortalError> {
    let app_ids = portal.fetch_app_ids(team, session).await?;

    match app_ids
        .into_iter()
        .find(|app_id| app_id.bundle_identifier == bundle_identifier)
    {
        Some(app_id) => Ok(app_id),
        None => {
            portal
                .add_app_id(name, bundle_identifier, team, session)
                .await
        }
    }
}

/// Capabilities `app` requires from its entitlement set, as portal feature
/// values. Declaring any app group implies the groups feature.
fn required_features(app: &Application) -> Vec<(&'static str, Value)> {
    let mut features: Vec<(&'static str, Value)> = app
        .entitlements
        .iter()
        .filter_map(|(entitlement, value)| {
            feature_for_entitlement(entitlement).map(|feature| (feature, value.clone()))
        })
        .collect();

    if !app.app_groups().is_empty() {
        features.retain(|(feature, _)| *feature != super::types::features::APP_GROUPS);
        features.push((super::types::features::APP_GROUPS, Value::Bool(true)));
    }

    features
}

/// Synchronize the AppID's enabled features with what `app` requires.
///
/// Issues an update call only if at least one required capability is missing
/// or has a different value; otherwise this is a no-op and the AppID is
/// returned unchanged.
pub async fn update_features(
    portal: &dyn PortalClient,
    app_id: AppId,
    app: &Application,
    team: &Team,
    session: &Session,
) -> Result<AppId, PortalError> {
    let required = required_features(app);

    let out_of_date = required
        .iter()
        .any(|(feature, value)| app_id.features.get(*feature) != Some(value));

    if !out_of_date {
        debug!("features for {} already up to date", app_id.bundle_identifier);
        return Ok(app_id);
    }

    let mut updated = app_id;
    for (feature, value) in required {
        updated.features.insert(feature.to_string(), value);
    }

    portal.update_app_id(&updated, team, session).await
}

/// Synchronize application groups declared in `app`'s entitlements onto the
/// AppID, creating missing groups under the run-wide group lock.
///
/// When the app declares no groups and the AppID does not have the groups
/// feature enabled this is a no-op. When the feature is already enabled we
/// proceed with the (possibly empty) set so stale assignments get removed.
pub async fn update_app_groups(
    portal: &dyn PortalClient,
    app_id: AppId,
    app: &Application,
    team: &Team,
    session: &Session,
) -> Result<AppId, PortalError> {
    let declared_groups = app.app_groups();

    if declared_groups.is_empty() {
        let groups_enabled = matches!(
            app_id.features.get(super::types::features::APP_GROUPS),
            Some(Value::Bool(true))
        );
        if !groups_enabled {
            debug!("no app groups for {}", app_id.bundle_identifier);
            return Ok(app_id);
        }
    }

    // Callers must not hold a per-request completion queue here: the lock is
    // shared across concurrent resolutions for the whole process.
    let _guard = APP_GROUPS_LOCK.lock().await;

    let existing = portal.fetch_app_groups(team, session).await?;

    let mut resolved = Vec::with_capacity(declared_groups.len());
    for group_identifier in &declared_groups {
        let adjusted_identifier = format!("{group_identifier}.{}", team.identifier);

        if let Some(group) = existing
            .iter()
            .find(|group| group.group_identifier == adjusted_identifier)
        {
            resolved.push(group.clone());
            continue;
        }

        // Not all characters are allowed in group names; periods become spaces.
        let name = format!("{GROUP_NAME_PREFIX} {}", group_identifier.replace('.', " "));
        let group = portal
            .add_app_group(&name, &adjusted_identifier, team, session)
            .await?;
        resolved.push(group);
    }

    portal
        .assign_app_id_to_groups(&app_id, &resolved, team, session)
        .await?;

    Ok(app_id)
}
