//! Integration tests for events

#[cfg(test)]
mod tests {
    use buildops_events::*;
    use buildops_types::{OperationKind, Sequence};
    use std::sync::Arc;

    fn started(seq: u64, id: u64) -> EventMessage {
        let descriptor = OperationDescriptor::builder(OperationKind::Task, format!("task-{id}"))
            .build(OperationId::from_raw(id), None);
        EventMessage::new(
            EventMeta::new(
                Sequence::from_raw(seq),
                descriptor.id,
                chrono::Utc::now(),
                EventLevel::Info,
                descriptor.kind,
            ),
            OperationEvent::Started { descriptor },
        )
    }

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let dispatcher = ListenerDispatcher::new();
        let (listener, mut rx) = channel();
        dispatcher.register(Arc::new(listener), Interest::all());

        dispatcher.dispatch(&started(1, 10));
        dispatcher.dispatch(&started(2, 11));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.meta.sequence, Sequence::from_raw(1));
        assert_eq!(second.event.operation_id(), OperationId::from_raw(11));
        assert_eq!(first.meta.source, EventSource::TASK);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_a_listener_failure() {
        let dispatcher = ListenerDispatcher::new();
        let (listener, rx) = channel();
        dispatcher.register(Arc::new(listener), Interest::all());
        drop(rx);

        // Should not panic when receiver is dropped
        let report = dispatcher.dispatch(&started(1, 1));
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_tracing_listener_accepts_every_kind() {
        let listener = TracingListener;
        assert!(listener.on_event(&started(1, 1)).is_ok());
    }

    #[test]
    fn test_event_message_serialization() {
        let json = serde_json::to_value(started(7, 3)).unwrap();
        assert_eq!(json["meta"]["sequence"], 7);
        assert_eq!(json["meta"]["operationId"], 3);
        assert_eq!(json["event"]["type"], "started");
        assert_eq!(json["event"]["descriptor"]["kind"], "task");
    }
}
