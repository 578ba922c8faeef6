//! Kubernetes Events for recoverable anomalies.
//!
//! Recording is fire-and-forget: a failed publish is logged and never fails the
//! reconciliation that raised it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Service};
use kube::api::{Api, PostParams};
use kube::{Client, Resource, ResourceExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// A recorded event, as kept by [`MemoryEventRecorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub service: String,
    pub event_type: String,
    pub reason: String,
    pub message: String,
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, service: &Service, event_type: &str, reason: &str, message: &str);

    async fn warn(&self, service: &Service, reason: &str, message: &str) {
        self.publish(service, EVENT_TYPE_WARNING, reason, message)
            .await
    }

    async fn normal(&self, service: &Service, reason: &str, message: &str) {
        self.publish(service, EVENT_TYPE_NORMAL, reason, message)
            .await
    }
}

/// Publishes `core/v1` Events against the service.
pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, service: &Service, event_type: &str, reason: &str, message: &str) {
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-lb-event-", service.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: service.object_ref(&()),
            first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
            last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

/// Keeps events in memory; used by tests and the standalone binary mode.
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn publish(&self, service: &Service, event_type: &str, reason: &str, message: &str) {
        let name = super::service::service_name(service);
        debug!(service = %name, event_type, reason, message, "event recorded");
        self.events.lock().push(RecordedEvent {
            service: name,
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
