//! Machine-attestation (anisette) data acquisition.
//!
//! The broker tries a privileged local service first and falls back to
//! broadcasting a request to any listening plugin, raced against a fixed
//! one-second deadline. Requests are independent, keyed by fresh identifiers,
//! and completed atomically so a late duplicate delivery is a no-op.

pub mod sources;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::AnisetteError;

/// How long the plugin fallback waits before failing with
/// [`AnisetteError::PluginNotFound`]. This is the only explicit timeout in
/// the workflow; everything else relies on transport timeouts.
pub const PLUGIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Replacement signature written over the tail of the device description so
/// consumers cannot fingerprint which source produced the data.
const SANITIZED_CLIENT_SIGNATURE: &str = "(com.apple.dt.Xcode/3594.4.19)>";

/// Opaque attestation descriptor required by the portal's authentication
/// endpoint. Values are carried verbatim into request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnisetteData {
    pub machine_id: String,
    pub one_time_password: String,
    pub local_user_id: String,
    pub routing_info: String,
    pub device_unique_identifier: String,
    pub device_description: String,
    pub date: String,
    pub locale: String,
    pub time_zone: String,
}

impl AnisetteData {
    /// Strips identifying traces of the acquisition source from the device
    /// description: everything from `(<source bundle id>` onward is rewritten
    /// to a generic client signature. ASCII-case-insensitive match, no-op
    /// when the source identifier is absent.
    ///
    /// Matching runs over raw bytes; the match starts at an ASCII `(`, which
    /// never occurs inside a multibyte sequence, so the cut index is always a
    /// character boundary even for descriptions with non-ASCII content.
    pub fn sanitize(&mut self, source_bundle_id: &str) {
        let needle = format!("({source_bundle_id}");
        let Some(index) = self
            .device_description
            .as_bytes()
            .windows(needle.len())
            .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
        else {
            return;
        };

        self.device_description.truncate(index);
        self.device_description.push_str(SANITIZED_CLIENT_SIGNATURE);
    }
}

/// Primary acquisition source: a privileged local service reached over an
/// inter-process channel.
#[async_trait::async_trait]
pub trait PrimarySource: Send + Sync {
    /// Identifier stripped from successful responses during sanitization.
    fn bundle_id(&self) -> &str;

    async fn request(&self) -> Result<AnisetteData, AnisetteError>;
}

/// Fallback broadcast channel to any listening local plugin. Responses are
/// delivered back through [`AnisetteBroker::handle_plugin_response`].
pub trait PluginBus: Send + Sync {
    /// Identifier stripped from plugin responses during sanitization.
    fn bundle_id(&self) -> &str;

    fn broadcast(&self, request_id: Uuid);
}

type Completion = oneshot::Sender<Result<AnisetteData, AnisetteError>>;

/// Coordinates concurrent acquisitions. In-flight requests live in a
/// concurrency-safe registry keyed by request identifier; completing a
/// request removes its completion handler atomically, so exactly one of a
/// plugin response and the deadline resolves any given request.
pub struct AnisetteBroker {
    primary: Arc<dyn PrimarySource>,
    plugin_bus: Arc<dyn PluginBus>,
    pending: DashMap<Uuid, Completion>,
}

impl AnisetteBroker {
    pub fn new(primary: Arc<dyn PrimarySource>, plugin_bus: Arc<dyn PluginBus>) -> Self {
        Self {
            primary,
            plugin_bus,
            pending: DashMap::new(),
        }
    }

    /// Acquire fresh, sanitized attestation data.
    ///
    /// Falls back to the plugin path only when the primary source reports its
    /// channel unavailable; any other primary failure is surfaced directly.
    pub async fn acquire(&self) -> Result<AnisetteData, AnisetteError> {
        match self.primary.request().await {
            Ok(mut data) => {
                data.sanitize(self.primary.bundle_id());
                Ok(data)
            }
            Err(AnisetteError::Unavailable(reason)) => {
                debug!("anisette service unavailable ({reason}), falling back to plugin");
                self.request_from_plugin().await
            }
            Err(error) => Err(error),
        }
    }

    async fn request_from_plugin(&self) -> Result<AnisetteData, AnisetteError> {
        let request_id = Uuid::new_v4();
        let (completion, response) = oneshot::channel();

        // Registered before the broadcast, so a plugin that answers
        // immediately always finds its entry.
        self.pending.insert(request_id, completion);
        self.plugin_bus.broadcast(request_id);

        match tokio::time::timeout(PLUGIN_RESPONSE_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            // Completion sender dropped without a send; treat as no plugin.
            Ok(Err(_)) => Err(AnisetteError::PluginNotFound),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(AnisetteError::PluginNotFound)
            }
        }
    }

    /// Deliver a plugin response payload (a serialized [`AnisetteData`]) for
    /// the given request. Malformed payloads fail the request with
    /// [`AnisetteError::InvalidAnisetteData`]; unknown or already-completed
    /// request identifiers are ignored.
    pub fn handle_plugin_response(&self, request_id: Uuid, payload: &[u8]) {
        // Claiming the entry first makes completion atomic: a duplicate or
        // late delivery finds nothing and is dropped.
        let Some((_, completion)) = self.pending.remove(&request_id) else {
            return;
        };

        let result = match serde_json::from_slice::<AnisetteData>(payload) {
            Ok(mut data) => {
                data.sanitize(self.plugin_bus.bundle_id());
                Ok(data)
            }
            Err(error) => {
                warn!("discarding malformed anisette plugin response: {error}");
                Err(AnisetteError::InvalidAnisetteData)
            }
        };

        let _ = completion.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_data(description: &str) -> AnisetteData {
        AnisetteData {
            machine_id: "machine".into(),
            one_time_password: "otp".into(),
            local_user_id: "local-user".into(),
            routing_info: "17106176".into(),
            device_unique_identifier: "device".into(),
            device_description: description.into(),
            date: "2026-08-30T12:00:00Z".into(),
            locale: "en_US".into(),
            time_zone: "UTC".into(),
        }
    }

    struct UnavailablePrimary;

    #[async_trait::async_trait]
    impl PrimarySource for UnavailablePrimary {
        fn bundle_id(&self) -> &str {
            "io.sideloadd.svc"
        }

        async fn request(&self) -> Result<AnisetteData, AnisetteError> {
            Err(AnisetteError::Unavailable("connection refused".into()))
        }
    }

    struct WorkingPrimary;

    #[async_trait::async_trait]
    impl PrimarySource for WorkingPrimary {
        fn bundle_id(&self) -> &str {
            "io.sideloadd.svc"
        }

        async fn request(&self) -> Result<AnisetteData, AnisetteError> {
            Ok(sample_data(
                "<MacBookPro18,3> <macOS;13.1;22C65> <(io.sideloadd.svc/1.0)>",
            ))
        }
    }

    /// Records broadcast request ids so tests can answer them.
    #[derive(Default)]
    struct RecordingBus {
        broadcasts: Mutex<Vec<Uuid>>,
        count: AtomicUsize,
    }

    impl PluginBus for RecordingBus {
        fn bundle_id(&self) -> &str {
            "com.apple.mail"
        }

        fn broadcast(&self, request_id: Uuid) {
            self.broadcasts.lock().unwrap().push(request_id);
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sanitize_rewrites_tail_from_source_bundle_id() {
        let mut data = sample_data("<MacBookPro18,3> <macOS;13.1;22C65> <(com.apple.mail/3654)>");
        data.sanitize("com.apple.mail");
        assert_eq!(
            data.device_description,
            "<MacBookPro18,3> <macOS;13.1;22C65> <(com.apple.dt.Xcode/3594.4.19)>"
        );
    }

    #[test]
    fn sanitize_handles_multibyte_text_before_the_marker() {
        let mut data = sample_data("ẞ(com.apple.mail/3654)>");
        data.sanitize("com.apple.mail");
        assert_eq!(data.device_description, "ẞ(com.apple.dt.Xcode/3594.4.19)>");
    }

    #[test]
    fn sanitize_matches_regardless_of_ascii_case() {
        let mut data = sample_data("<MacBookPro18,3> <(COM.APPLE.MAIL/3654)>");
        data.sanitize("com.apple.mail");
        assert_eq!(
            data.device_description,
            "<MacBookPro18,3> <(com.apple.dt.Xcode/3594.4.19)>"
        );
    }

    #[test]
    fn sanitize_is_a_noop_without_the_source_marker() {
        let mut data = sample_data("<MacBookPro18,3> <macOS;13.1;22C65>");
        data.sanitize("com.apple.mail");
        assert_eq!(data.device_description, "<MacBookPro18,3> <macOS;13.1;22C65>");
    }

    #[tokio::test]
    async fn primary_result_is_sanitized() {
        let broker = AnisetteBroker::new(
            Arc::new(WorkingPrimary),
            Arc::new(RecordingBus::default()),
        );

        let data = broker.acquire().await.unwrap();
        assert!(!data.device_description.contains("io.sideloadd.svc"));
        assert!(data.device_description.ends_with(SANITIZED_CLIENT_SIGNATURE));
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_timeout_fails_with_plugin_not_found() {
        let bus = Arc::new(RecordingBus::default());
        let broker = AnisetteBroker::new(Arc::new(UnavailablePrimary), bus.clone());

        let result = broker.acquire().await;
        assert!(matches!(result, Err(AnisetteError::PluginNotFound)));
        assert_eq!(bus.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_response_before_deadline_wins() {
        let bus = Arc::new(RecordingBus::default());
        let broker = Arc::new(AnisetteBroker::new(Arc::new(UnavailablePrimary), bus.clone()));

        let responder = {
            let broker = Arc::clone(&broker);
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                let request_id = bus.broadcasts.lock().unwrap()[0];
                let payload = serde_json::to_vec(&sample_data(
                    "<MacBookPro18,3> <macOS;13.1;22C65> <(com.apple.mail/3654)>",
                ))
                .unwrap();
                broker.handle_plugin_response(request_id, &payload);
            })
        };

        let data = broker.acquire().await.unwrap();
        assert!(data.device_description.ends_with(SANITIZED_CLIENT_SIGNATURE));
        responder.await.unwrap();

        // The registry is empty again, so a duplicate delivery is a no-op.
        let stale_id = bus.broadcasts.lock().unwrap()[0];
        broker.handle_plugin_response(stale_id, b"not even json");
        assert!(broker.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn plugin_response_delivered_immediately_after_broadcast_is_routed() {
        let bus = Arc::new(RecordingBus::default());
        let broker = Arc::new(AnisetteBroker::new(Arc::new(UnavailablePrimary), bus.clone()));

        let acquisition = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.acquire().await }
        });

        // Let the acquisition register its request and broadcast, without
        // advancing time at all.
        while bus.broadcasts.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let request_id = bus.broadcasts.lock().unwrap()[0];
        let payload = serde_json::to_vec(&sample_data(
            "<MacBookPro18,3> <macOS;13.1;22C65> <(com.apple.mail/3654)>",
        ))
        .unwrap();
        broker.handle_plugin_response(request_id, &payload);

        assert!(acquisition.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_plugin_response_fails_with_invalid_data() {
        let bus = Arc::new(RecordingBus::default());
        let broker = Arc::new(AnisetteBroker::new(Arc::new(UnavailablePrimary), bus.clone()));

        let responder = {
            let broker = Arc::clone(&broker);
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let request_id = bus.broadcasts.lock().unwrap()[0];
                broker.handle_plugin_response(request_id, b"{\"garbage\":true}");
            })
        };

        let result = broker.acquire().await;
        assert!(matches!(result, Err(AnisetteError::InvalidAnisetteData)));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquisitions_resolve_independently() {
        let bus = Arc::new(RecordingBus::default());
        let broker = Arc::new(AnisetteBroker::new(Arc::new(UnavailablePrimary), bus.clone()));

        let first = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.acquire().await }
        });
        let second = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.acquire().await }
        });

        // Let both requests register and broadcast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ids: Vec<Uuid> = bus.broadcasts.lock().unwrap().clone();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        // Answer only the first; the second must time out on its own.
        let payload = serde_json::to_vec(&sample_data(
            "<MacBookPro18,3> <macOS;13.1;22C65> <(com.apple.mail/3654)>",
        ))
        .unwrap();
        broker.handle_plugin_response(ids[0], &payload);

        assert!(first.await.unwrap().is_ok());
        assert!(matches!(
            second.await.unwrap(),
            Err(AnisetteError::PluginNotFound)
        ));
    }
}
