use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

/// Fire-and-forget observability sink handed to every installable. Delivery
/// failures must never block or fail the pipeline.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn event(&self, event_type: EventType, reason: &str, message: &str);
}

/// Publishes installable events as Kubernetes events attached to the CFAPI
/// object being reconciled.
pub struct CfApiEventRecorder {
    recorder: Recorder,
    reference: ObjectReference,
}

impl CfApiEventRecorder {
    pub fn new(recorder: Recorder, reference: ObjectReference) -> Self {
        Self {
            recorder,
            reference,
        }
    }
}

#[async_trait]
impl EventRecorder for CfApiEventRecorder {
    async fn event(&self, event_type: EventType, reason: &str, message: &str) {
        let result = self
            .recorder
            .publish(
                &Event {
                    type_: event_type,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &self.reference,
            )
            .await;

        if let Err(err) = result {
            warn!("failed to publish event {reason}: {err}");
        }
    }
}
