use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::Occurrence;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceEventKind {
    Created,
    Updated,
    Deleted,
    /// A series lost every member from `start_time` on.
    SeriesTruncated,
}

/// Published after a mutation reaches the store. Reminder and messaging
/// systems consume these; the scheduling core never waits on them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OccurrenceEvent {
    pub kind: OccurrenceEventKind,
    pub occurrence_id: Option<Uuid>,
    pub series_id: Option<Uuid>,
    pub therapist_id: Uuid,
    pub patient_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub emitted_at: DateTime<Utc>,
}

impl OccurrenceEvent {
    pub fn for_occurrence(kind: OccurrenceEventKind, occurrence: &Occurrence) -> Self {
        Self {
            kind,
            occurrence_id: Some(occurrence.id),
            series_id: occurrence.series_id,
            therapist_id: occurrence.therapist_id,
            patient_id: occurrence.patient_id,
            start_time: occurrence.start_time,
            emitted_at: Utc::now(),
        }
    }

    pub fn series_truncated(series_id: Uuid, therapist_id: Uuid, patient_id: Uuid, pivot: DateTime<Utc>) -> Self {
        Self {
            kind: OccurrenceEventKind::SeriesTruncated,
            occurrence_id: None,
            series_id: Some(series_id),
            therapist_id,
            patient_id,
            start_time: pivot,
            emitted_at: Utc::now(),
        }
    }
}

/// Fire-and-forget sink for occurrence events.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, event: OccurrenceEvent);
}

/// Publishes events on a broadcast channel. Sending with no subscriber is not an error.
pub struct BroadcastNotificationDispatcher {
    sender: broadcast::Sender<OccurrenceEvent>,
}

impl BroadcastNotificationDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OccurrenceEvent> {
        self.sender.subscribe()
    }

    /// Forwards every event to `webhook_url` as JSON until the dispatcher is dropped.
    /// Delivery failures are logged and dropped.
    pub fn spawn_webhook_forwarder(&self, webhook_url: String) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        let client = reqwest::Client::new();

        tokio::spawn(async move {
            info!("Forwarding occurrence events to {}", webhook_url);
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        match client.post(&webhook_url).json(&event).send().await {
                            Ok(response) if response.status().is_success() => {
                                debug!("Delivered {:?} event for {:?}", event.kind, event.occurrence_id);
                            }
                            Ok(response) => {
                                warn!("Webhook rejected {:?} event: {}", event.kind, response.status());
                            }
                            Err(e) => {
                                error!("Webhook delivery failed: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Webhook forwarder lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for BroadcastNotificationDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationDispatcher for BroadcastNotificationDispatcher {
    fn dispatch(&self, event: OccurrenceEvent) {
        if self.sender.send(event).is_err() {
            debug!("No notification subscribers; event dropped");
        }
    }
}

impl<T: NotificationDispatcher + ?Sized> NotificationDispatcher for Arc<T> {
    fn dispatch(&self, event: OccurrenceEvent) {
        (**self).dispatch(event)
    }
}
