//! Kubernetes Event publishing
//!
//! Events are fire-and-forget: a failed or slow publish is logged and never
//! holds up a reconcile pass.

use crate::domain::ports::{EventPublisher, EventPublisherRef, EventType, PoolEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::warn;

/// Event reasons recorded against a pool cluster
pub mod reasons {
    pub const CREATE: &str = "Create";
    pub const UPDATE: &str = "Update";
    pub const DELETE: &str = "Delete";
    pub const DOWN_SCALE: &str = "DownScale";
    pub const POOL_DEPLOYMENT_CREATE: &str = "PoolDeploymentCreate";
    pub const GETTING_NAMESPACE: &str = "Getting Namespace";
}

/// Production publisher wrapping `kube::runtime::events::Recorder`.
///
/// Each event is written from its own task, so `publish` returns at once.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
    timeout: Duration,
}

impl KubeEventPublisher {
    /// `controller` appears as the reporting component on every event
    pub fn new(client: Client, controller: &str, instance: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance,
            },
            timeout,
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: PoolEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let object = regarding.name.clone();
        let timeout = self.timeout;
        let type_ = match event.type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };

        tokio::spawn(async move {
            let write = recorder.publish(Event {
                type_,
                reason: event.reason.clone(),
                note: Some(event.note),
                action: event.action,
                secondary: None,
            });
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    reason = %event.reason,
                    object = ?object,
                    error = %e,
                    "Failed to publish event"
                ),
                Err(_) => warn!(
                    reason = %event.reason,
                    object = ?object,
                    ?timeout,
                    "Timed out publishing event"
                ),
            }
        });
    }
}

/// Puts a deadline on every publish of the wrapped publisher
pub struct BoundedPublisher {
    inner: EventPublisherRef,
    deadline: Duration,
}

impl BoundedPublisher {
    pub fn new(inner: EventPublisherRef, deadline: Duration) -> Self {
        Self { inner, deadline }
    }
}

#[async_trait]
impl EventPublisher for BoundedPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: PoolEvent) {
        let reason = event.reason.clone();
        let publish = self.inner.publish(regarding, event);
        if tokio::time::timeout(self.deadline, publish).await.is_err() {
            warn!(
                reason = %reason,
                object = ?regarding.name,
                deadline = ?self.deadline,
                "Dropped event, publisher did not respond in time"
            );
        }
    }
}

/// Publisher keeping every event in memory, used by tests and dry runs
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(ObjectReference, PoolEvent)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Events with the given reason
    pub fn with_reason(&self, reason: &str) -> Vec<PoolEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| e.reason == reason)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Events recorded against the named object
    pub fn for_object(&self, name: &str) -> Vec<PoolEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(r, _)| r.name.as_deref() == Some(name))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: PoolEvent) {
        self.events.lock().push((regarding.clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    /// Never completes a publish
    struct StalledPublisher;

    #[async_trait]
    impl EventPublisher for StalledPublisher {
        async fn publish(&self, _regarding: &ObjectReference, _event: PoolEvent) {
            futures::future::pending::<()>().await
        }
    }

    #[test]
    fn test_publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KubeEventPublisher>();
        assert_send_sync::<RecordingPublisher>();
        assert_send_sync::<BoundedPublisher>();
    }

    #[tokio::test]
    async fn test_bounded_publisher_drops_stalled_event() {
        let bounded = BoundedPublisher::new(Arc::new(StalledPublisher), Duration::from_millis(20));
        let regarding = ObjectReference::default();
        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            bounded.publish(&regarding, PoolEvent::normal(reasons::CREATE, "Pool Provisioned 1/1")),
        )
        .await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_bounded_publisher_forwards() {
        let recording = Arc::new(RecordingPublisher::new());
        let bounded = BoundedPublisher::new(recording.clone(), Duration::from_secs(1));
        bounded
            .publish(&ObjectReference::default(), PoolEvent::warning(reasons::UPDATE, "x"))
            .await;
        assert_eq!(recording.with_reason(reasons::UPDATE).len(), 1);
    }

    #[test]
    fn test_recording_publisher() {
        let publisher = RecordingPublisher::new();
        let cspc = ObjectReference {
            name: Some("cspc-a".into()),
            ..Default::default()
        };
        tokio_test::block_on(async {
            publisher
                .publish(&cspc, PoolEvent::normal(reasons::CREATE, "Pool Provisioned 1/1"))
                .await;
            publisher
                .publish(&cspc, PoolEvent::warning(reasons::DOWN_SCALE, "failed"))
                .await;
        });

        assert_eq!(publisher.events().len(), 2);
        assert_eq!(publisher.with_reason(reasons::CREATE).len(), 1);
        assert_eq!(publisher.for_object("cspc-a").len(), 2);
        assert!(publisher.for_object("cspc-b").is_empty());

        publisher.clear();
        assert!(publisher.events().is_empty());
    }
}
