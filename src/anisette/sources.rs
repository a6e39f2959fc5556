//! Concrete attestation sources.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use url::Url;
use uuid::Uuid;

use super::{AnisetteData, PluginBus, PrimarySource};
use crate::error::AnisetteError;

/// Identifier of the privileged helper service, stripped from its responses.
pub const SERVICE_BUNDLE_ID: &str = "io.sideloadd.svc";

/// Identifier of the mail-plugin data source, stripped from its responses.
pub const PLUGIN_BUNDLE_ID: &str = "com.apple.mail";

/// Default endpoint of the local helper service.
pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:6969/v3/anisette";

const SERVICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SERVICE_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Primary source backed by the local helper service's HTTP endpoint.
///
/// A connect failure means the channel is absent or interrupted and maps to
/// [`AnisetteError::Unavailable`], which triggers the plugin fallback.
pub struct ServiceSource {
    client: reqwest::Client,
    url: Url,
}

impl ServiceSource {
    pub fn new(url: Url) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(SERVICE_CONNECT_TIMEOUT)
            .timeout(SERVICE_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl PrimarySource for ServiceSource {
    fn bundle_id(&self) -> &str {
        SERVICE_BUNDLE_ID
    }

    async fn request(&self) -> Result<AnisetteData, AnisetteError> {
        let response = match self.client.get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(error) if error.is_connect() || error.is_timeout() => {
                return Err(AnisetteError::Unavailable(error.to_string()));
            }
            Err(error) => return Err(AnisetteError::Unavailable(error.to_string())),
        };

        if !response.status().is_success() {
            return Err(AnisetteError::InvalidAnisetteData);
        }

        response
            .json::<AnisetteData>()
            .await
            .map_err(|_| AnisetteError::InvalidAnisetteData)
    }
}

/// Bus used when no plugin host is wired in. Broadcasts go nowhere, so the
/// fallback deadline elapses and acquisition fails with `PluginNotFound`,
/// which is the correct answer when no plugin exists.
pub struct NullPluginBus;

impl PluginBus for NullPluginBus {
    fn bundle_id(&self) -> &str {
        PLUGIN_BUNDLE_ID
    }

    fn broadcast(&self, request_id: Uuid) {
        debug!("no plugin bus configured; dropping anisette request {request_id}");
    }
}
