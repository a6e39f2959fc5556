//! Provisioning-profile resolution.
//!
//! Free-tier AppIDs are scoped to the team, so every bundle identifier in the
//! package is adjusted with the team identifier before any portal object is
//! created. Profiles are resolved per identity (main app plus each extension)
//! and returned keyed by the identity's original, on-disk bundle identifier,
//! since that is what the package still carries until re-signing.

use std::collections::HashMap;

use futures::future::try_join_all;
use log::info;

use crate::app::Application;
use crate::portal::registration::{register_app_id, update_app_groups, update_features};
use crate::portal::types::{DeviceKind, ProvisioningProfile, Session, Team};
use crate::portal::{PortalClient, PortalError};

/// One signable identity inside a package: the main app or an extension.
#[derive(Debug, Clone)]
pub struct SigningIdentity {
    /// Bundle identifier as it appears on disk, before adjustment.
    pub original_bundle_identifier: String,
    /// Team-scoped bundle identifier used for all portal objects.
    pub adjusted_bundle_identifier: String,
    /// AppID display name.
    pub name: String,
}

/// Team-scoped bundle identifier for the package's main app.
///
/// The companion app keeps the legacy scheme with the team identifier in
/// front, so reinstalling it on the same team reuses its historical AppID.
pub fn adjusted_bundle_identifier(app: &Application, team: &Team) -> String {
    if app.is_companion() {
        format!("com.{}.{}", team.identifier, app.bundle_identifier)
    } else {
        format!("{}.{}", app.bundle_identifier, team.identifier)
    }
}

/// Enumerate the identities of `app`, with adjusted identifiers applied
/// consistently across the main app and its extensions.
///
/// Extension identifiers share the main app's identifier as a prefix; the
/// adjusted extension identifier is produced by swapping that prefix so the
/// parent/child relationship survives adjustment.
pub fn signing_identities(app: &Application, team: &Team) -> Vec<SigningIdentity> {
    let parent_adjusted = adjusted_bundle_identifier(app, team);

    let mut identities = vec![SigningIdentity {
        original_bundle_identifier: app.bundle_identifier.clone(),
        adjusted_bundle_identifier: parent_adjusted.clone(),
        name: app.name.clone(),
    }];

    for extension in &app.extensions {
        identities.push(SigningIdentity {
            original_bundle_identifier: extension.bundle_identifier.clone(),
            adjusted_bundle_identifier: extension
                .bundle_identifier
                .replacen(&app.bundle_identifier, &parent_adjusted, 1),
            name: format!("{} {}", app.name, extension.name),
        });
    }

    identities
}

async fn resolve_identity(
    portal: &dyn PortalClient,
    identity: &SigningIdentity,
    app: &Application,
    device_kind: DeviceKind,
    team: &Team,
    session: &Session,
) -> Result<(String, ProvisioningProfile), PortalError> {
    let app_id = register_app_id(
        portal,
        &identity.name,
        &identity.adjusted_bundle_identifier,
        team,
        session,
    )
    .await?;

    let app_id = update_features(portal, app_id, app, team, session).await?;
    let app_id = update_app_groups(portal, app_id, app, team, session).await?;

    let profile = portal
        .fetch_provisioning_profile(&app_id, device_kind, team, session)
        .await?;

    info!(
        "resolved profile {} for {}",
        profile.identifier, identity.adjusted_bundle_identifier
    );

    Ok((identity.original_bundle_identifier.clone(), profile))
}

/// Resolve a provisioning profile for every identity in `app`, keyed by the
/// identity's original bundle identifier.
///
/// The main app is resolved first so its AppID and groups exist before the
/// extensions (which reference the same groups) are resolved concurrently.
pub async fn resolve_profiles(
    portal: &dyn PortalClient,
    app: &Application,
    device_kind: DeviceKind,
    team: &Team,
    session: &Session,
) -> Result<HashMap<String, ProvisioningProfile>, PortalError> {
    let identities = signing_identities(app, team);
    let Some((main, extensions)) = identities.split_first() else {
        return Ok(HashMap::new());
    };

    let mut profiles = HashMap::with_capacity(identities.len());

    let (original, profile) =
        resolve_identity(portal, main, app, device_kind, team, session).await?;
    profiles.insert(original, profile);

    let extension_lookup: HashMap<&str, &Application> = app
        .extensions
        .iter()
        .map(|extension| (extension.bundle_identifier.as_str(), extension))
        .collect();

    let resolved = try_join_all(extensions.iter().map(|identity| {
        let extension = extension_lookup[identity.original_bundle_identifier.as_str()];
        resolve_identity(portal, identity, extension, device_kind, team, session)
    }))
    .await?;

    for (original, profile) in resolved {
        profiles.insert(original, profile);
    }

    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::COMPANION_BUNDLE_ID;
    use crate::mock::{self, MockPortal, PortalCall};
    use crate::portal::types::TeamKind;

    fn team() -> Team {
        mock::team(TeamKind::Free)
    }

    #[test]
    fn regular_apps_get_team_suffix() {
        let app = Application::for_tests("com.example.app", "Example", HashMap::new());
        assert_eq!(
            adjusted_bundle_identifier(&app, &team()),
            "com.example.app.ABC123XYZ0"
        );
    }

    #[test]
    fn companion_app_gets_team_prefix() {
        let app = Application::for_tests(COMPANION_BUNDLE_ID, "Store", HashMap::new());
        assert_eq!(
            adjusted_bundle_identifier(&app, &team()),
            format!("com.ABC123XYZ0.{COMPANION_BUNDLE_ID}")
        );
    }

    #[test]
    fn extension_identifiers_follow_the_parent() {
        let mut app = Application::for_tests("com.example.app", "Example", HashMap::new());
        app.extensions.push(Application::for_tests(
            "com.example.app.Widget",
            "Widget",
            HashMap::new(),
        ));

        let identities = signing_identities(&app, &team());
        assert_eq!(identities.len(), 2);
        assert_eq!(
            identities[1].adjusted_bundle_identifier,
            "com.example.app.ABC123XYZ0.Widget"
        );
        assert_eq!(identities[1].name, "Example Widget");
    }

    #[tokio::test]
    async fn profiles_are_keyed_by_original_identifier() {
        let mut app = Application::for_tests("com.example.app", "Example", HashMap::new());
        app.extensions.push(Application::for_tests(
            "com.example.app.Widget",
            "Widget",
            HashMap::new(),
        ));

        let portal = MockPortal::new();
        let profiles = resolve_profiles(
            &portal,
            &app,
            DeviceKind::Iphone,
            &team(),
            &mock::session(),
        )
        .await
        .unwrap();

        assert_eq!(profiles.len(), 2);
        assert_eq!(
            profiles["com.example.app"].bundle_identifier,
            "com.example.app.ABC123XYZ0"
        );
        assert_eq!(
            profiles["com.example.app.Widget"].bundle_identifier,
            "com.example.app.ABC123XYZ0.Widget"
        );
        assert_eq!(portal.count(PortalCall::FetchProvisioningProfile), 2);
    }

    #[tokio::test]
    async fn resolution_is_idempotent_across_runs() {
        let app = Application::for_tests("com.example.app", "Example", HashMap::new());
        let portal = MockPortal::new();

        for _ in 0..2 {
            resolve_profiles(
                &portal,
                &app,
                DeviceKind::Iphone,
                &team(),
                &mock::session(),
            )
            .await
            .unwrap();
        }

        assert_eq!(portal.count(PortalCall::AddAppId), 1);
    }
}
