use crate::models::{DerivedFile, FileRecord};
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Payload of an `abort` notification.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortPayload {
    Record(FileRecord),
    Error(String),
}

/// Notifications published while uploads are staged, processed and deleted.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Begin(FileRecord),
    /// A custom processing step produced an additional file.
    File(FileRecord),
    /// An image version was generated.
    Image(DerivedFile),
    End(FileRecord),
    Processed {
        record: FileRecord,
        derived: Vec<DerivedFile>,
    },
    Abort(AbortPayload),
    Error(String),
    Delete(String),
}

impl UploadEvent {
    /// Notification name as seen by listeners.
    pub fn name(&self) -> &'static str {
        match self {
            UploadEvent::Begin(_) => "begin",
            UploadEvent::File(_) => "file",
            UploadEvent::Image(_) => "image",
            UploadEvent::End(_) => "end",
            UploadEvent::Processed { .. } => "processed",
            UploadEvent::Abort(_) => "abort",
            UploadEvent::Error(_) => "error",
            UploadEvent::Delete(_) => "delete",
        }
    }
}

/// Broadcast channel for [`UploadEvent`]s.
///
/// Emitting never blocks and never fails. With no subscriber the event is
/// dropped. A subscriber more than `capacity` events behind loses the oldest
/// ones, `end` and `processed` included, and its next `recv` returns
/// `RecvError::Lagged` with the number skipped. Size the buffer with
/// `UploadConfig::event_buffer` when listeners must see every file.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UploadEvent) {
        tracing::debug!(event = event.name(), "upload event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Drains a subscription into the log. Used by the server binary.
pub async fn log_events(mut rx: broadcast::Receiver<UploadEvent>) {
    loop {
        match rx.recv().await {
            Ok(UploadEvent::Begin(record)) => {
                tracing::info!("📥 begin {}", record.name)
            }
            Ok(UploadEvent::End(record)) => match record.error() {
                Some(err) => tracing::warn!("⚠️ end {} with error: {}", record.name, err),
                None => tracing::info!("✅ end {}", record.name),
            },
            Ok(UploadEvent::Processed { record, derived }) => {
                tracing::info!(
                    "🖼️ processed {} ({} derived files)",
                    record.name,
                    derived.len()
                )
            }
            Ok(UploadEvent::Abort(AbortPayload::Record(record))) => {
                tracing::warn!("🛑 aborted {}", record.name)
            }
            Ok(UploadEvent::Abort(AbortPayload::Error(err))) => {
                tracing::warn!("🛑 aborted: {}", err)
            }
            Ok(UploadEvent::Error(err)) => tracing::error!("❌ upload error: {}", err),
            Ok(UploadEvent::Delete(name)) => tracing::info!("🗑️ deleted {}", name),
            Ok(event) => tracing::debug!(event = event.name(), "upload event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    skipped,
                    "⚠️ event log fell behind, {} events dropped; raise EVENT_BUFFER",
                    skipped
                )
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(UploadEvent::Begin(FileRecord::new("a.png", 1, None)));
        bus.emit(UploadEvent::Delete("a.png".to_string()));

        assert_eq!(rx.recv().await.unwrap().name(), "begin");
        assert_eq!(
            rx.recv().await.unwrap(),
            UploadEvent::Delete("a.png".to_string())
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_dropped_count() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for name in ["a.png", "b.png", "c.png"] {
            bus.emit(UploadEvent::End(FileRecord::new(name, 1, None)));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        match rx.recv().await.unwrap() {
            UploadEvent::End(record) => assert_eq!(record.name, "b.png"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.emit(UploadEvent::Delete("a.png".to_string()));
        assert_eq!(rx.try_recv().unwrap().name(), "delete");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(UploadEvent::Error("boom".to_string()));
    }
}
