//! # Event Fan-Out
//!
//! A published event is delivered to the local event service and posted to
//! every other node. API events answer asynchronous API messages the same way,
//! so the caller's node sees the event no matter where the handler ran.

#[cfg(test)]
mod tests {
    use crate::integration::support::*;
    use cloud_bus::error::codes;
    use cloud_bus::{BeforePublishInterceptor, Message, StopRouting, Tag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn collect(node: &TestNode, key: &str) -> mpsc::UnboundedReceiver<(String, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node_id = node.node_id().to_string();
        node.bus.subscribe_event(
            Arc::new(move |evt: &Message| {
                let _ = tx.send((node_id.clone(), evt.type_name.clone()));
                false
            }),
            &[key],
        );
        rx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_event_reaches_listeners_on_every_node() {
        let mut nodes = cluster(3, |_, _| {}).await;
        let mut receivers: Vec<_> = nodes.iter().map(|n| collect(n, "VmStateChangedEvent")).collect();

        nodes[1]
            .bus
            .publish(Message::event("VmStateChangedEvent").with_value("vm", serde_json::json!("vm-1")))
            .await
            .unwrap();

        for (i, rx) in receivers.iter_mut().enumerate() {
            let (seen_on, type_name) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(seen_on, node_name(i));
            assert_eq!(type_name, "VmStateChangedEvent");
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        for rx in receivers.iter_mut() {
            assert!(rx.try_recv().is_err(), "event delivered twice");
        }
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listener_returning_true_stops_after_first_event() {
        let mut nodes = cluster(2, |_, _| {}).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        nodes[0].bus.subscribe_event(
            Arc::new(move |_: &Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
            &["HostDisconnectedEvent"],
        );

        nodes[1].bus.publish(Message::event("HostDisconnectedEvent")).await.unwrap();
        timeout(WAIT, async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        nodes[1].bus.publish(Message::event("HostDisconnectedEvent")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_api_failure_returns_as_api_event() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], FailingService);

        let msg = Message::api("APIStopVmMsg").with_service_id("mn-1:::failing");
        let api_id = msg.id;
        let evt = timeout(WAIT, nodes[0].bus.call_api(msg)).await.unwrap().unwrap();
        assert_eq!(evt.api_id(), Some(api_id));
        assert_eq!(evt.error().unwrap().code, codes::OPERATION_ERROR);
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_unknown_api_message_returns_as_api_event() {
        let mut nodes = cluster(2, |_, _| {}).await;

        let msg = Message::api("APIStartVmMsg").with_service_id("mn-1:::nobody");
        let evt = timeout(WAIT, nodes[0].bus.call_api(msg)).await.unwrap().unwrap();
        assert!(evt.error().unwrap().is_unknown_message());
        shutdown_all(&mut nodes).await;
    }

    struct Veto;

    impl BeforePublishInterceptor for Veto {
        fn before_publish(&self, _event: &mut Message) -> Result<(), StopRouting> {
            Err(StopRouting::new("suppressed during maintenance"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_vetoed_event_reaches_no_node() {
        let mut nodes = cluster(2, |_, _| {}).await;
        let mut local = collect(&nodes[0], "NoisyEvent");
        let mut remote = collect(&nodes[1], "NoisyEvent");
        nodes[0]
            .bus
            .install_before_publish_interceptor(Arc::new(Veto), &[Tag::of_type("NoisyEvent")]);

        nodes[0].bus.publish(Message::event("NoisyEvent")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(local.try_recv().is_err());
        assert!(remote.try_recv().is_err());
        shutdown_all(&mut nodes).await;
    }
}
