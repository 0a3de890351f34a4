//! Revision-ordered topology publication.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use reef_core::error::Result;

use super::config::BucketConfig;
use crate::events::{CoreEvent, EventBus, EventContext};

/// Ingests config documents and publishes the newest revision.
///
/// The current config is a single shared immutable value replaced
/// atomically per revision; readers take a snapshot per request.
#[derive(Debug)]
pub struct ConfigProvider {
    core_id: Uuid,
    bus: Arc<dyn EventBus>,
    sender: watch::Sender<Option<Arc<BucketConfig>>>,
}

impl ConfigProvider {
    /// Creates an empty provider.
    pub fn new(core_id: Uuid, bus: Arc<dyn EventBus>) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            core_id,
            bus,
            sender,
        }
    }

    /// Returns the current topology snapshot.
    pub fn current(&self) -> Option<Arc<BucketConfig>> {
        self.sender.borrow().clone()
    }

    /// Subscribes to topology replacements.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<BucketConfig>>> {
        self.sender.subscribe()
    }

    /// Parses and possibly installs a config document.
    ///
    /// Returns `Ok(true)` when the document carried a strictly newer
    /// revision and was installed; older or equal revisions are silently
    /// dropped. Parse failures emit an event and propagate the error.
    pub fn ingest(&self, json: &[u8], origin: &str) -> Result<bool> {
        let parsed = match BucketConfig::parse(json, origin) {
            Ok(config) => config,
            Err(e) => {
                self.bus.publish(CoreEvent::ConfigParsingFailure {
                    ctx: EventContext {
                        core_id: Some(self.core_id),
                        ..Default::default()
                    },
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let rev = parsed.rev();
        let mut installed = false;
        self.sender.send_if_modified(|current| {
            let newer = match current.as_deref() {
                Some(existing) => rev > existing.rev(),
                None => true,
            };
            if newer {
                *current = Some(Arc::new(parsed.clone()));
                installed = true;
            }
            newer
        });

        if installed {
            tracing::debug!(
                bucket = %parsed.name(),
                epoch = rev.epoch,
                rev = rev.rev,
                "installed topology revision"
            );
            self.bus.publish(CoreEvent::ConfigUpdated {
                ctx: EventContext {
                    core_id: Some(self.core_id),
                    ..Default::default()
                },
                rev_epoch: rev.epoch,
                rev_id: rev.rev,
            });
        } else {
            tracing::trace!(
                epoch = rev.epoch,
                rev = rev.rev,
                "dropped stale topology revision"
            );
        }
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventBus;

    fn config_json(epoch: u64, rev: u64) -> String {
        format!(
            r#"{{
                "rev": {rev}, "revEpoch": {epoch}, "name": "b",
                "bucketCapabilities": ["couchapi"],
                "nodes": [{{"hostname": "10.0.0.1:8091", "ports": {{"direct": 11210}}}}],
                "nodesExt": [{{"hostname": "10.0.0.1", "services": {{"kv": 11210}}}}]
            }}"#
        )
    }

    fn provider_with_bus() -> (ConfigProvider, Arc<CollectingEventBus>) {
        let bus = Arc::new(CollectingEventBus::new());
        let provider = ConfigProvider::new(Uuid::new_v4(), bus.clone());
        (provider, bus)
    }

    #[test]
    fn test_first_config_installed() {
        let (provider, _bus) = provider_with_bus();
        assert!(provider.current().is_none());

        let installed = provider
            .ingest(config_json(1, 5).as_bytes(), "10.0.0.1")
            .unwrap();
        assert!(installed);
        assert_eq!(provider.current().unwrap().rev().rev, 5);
    }

    #[test]
    fn test_older_revision_dropped() {
        let (provider, _bus) = provider_with_bus();
        provider
            .ingest(config_json(1, 5).as_bytes(), "10.0.0.1")
            .unwrap();

        let installed = provider
            .ingest(config_json(1, 4).as_bytes(), "10.0.0.1")
            .unwrap();
        assert!(!installed);
        assert_eq!(provider.current().unwrap().rev().rev, 5);
    }

    #[test]
    fn test_equal_revision_dropped() {
        let (provider, _bus) = provider_with_bus();
        provider
            .ingest(config_json(1, 5).as_bytes(), "10.0.0.1")
            .unwrap();
        let installed = provider
            .ingest(config_json(1, 5).as_bytes(), "10.0.0.1")
            .unwrap();
        assert!(!installed);
    }

    #[test]
    fn test_epoch_dominates_rev() {
        let (provider, _bus) = provider_with_bus();
        provider
            .ingest(config_json(1, 900).as_bytes(), "10.0.0.1")
            .unwrap();
        let installed = provider
            .ingest(config_json(2, 1).as_bytes(), "10.0.0.1")
            .unwrap();
        assert!(installed);
        assert_eq!(provider.current().unwrap().rev().epoch, 2);
    }

    #[test]
    fn test_update_event_published() {
        let (provider, bus) = provider_with_bus();
        provider
            .ingest(config_json(1, 7).as_bytes(), "10.0.0.1")
            .unwrap();

        let events = bus.events();
        assert!(events.iter().any(|e| matches!(
            e,
            CoreEvent::ConfigUpdated { rev_epoch: 1, rev_id: 7, .. }
        )));
    }

    #[test]
    fn test_parse_failure_emits_event() {
        let (provider, bus) = provider_with_bus();
        assert!(provider.ingest(b"not json", "10.0.0.1").is_err());

        let events = bus.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, CoreEvent::ConfigParsingFailure { .. })));
    }

    #[tokio::test]
    async fn test_subscription_sees_replacement() {
        let (provider, _bus) = provider_with_bus();
        let mut receiver = provider.subscribe();
        provider
            .ingest(config_json(1, 1).as_bytes(), "10.0.0.1")
            .unwrap();

        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().as_ref().unwrap().rev().rev, 1);
    }
}
