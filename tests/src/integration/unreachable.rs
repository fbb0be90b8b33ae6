//! # Dead Peers
//!
//! Delivery to a node that does not answer is retried, then the sender gets
//! an error: an error reply for tracked requests, an `Err` for API messages
//! nobody tracks. Events still reach the nodes that are up.

#[cfg(test)]
mod tests {
    use crate::integration::support::*;
    use cloud_bus::error::codes;
    use cloud_bus::{BusError, Message};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_call_to_stopped_node_fails_after_retries() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], EchoService);
        nodes[1].shutdown().await;

        let reply = timeout(WAIT, nodes[0].bus.call(echo_to("mn-1", 1)))
            .await
            .unwrap()
            .unwrap();
        let error = reply.error().unwrap();
        assert_eq!(error.code, codes::OPERATION_ERROR);
        assert_eq!(error.cause.as_ref().unwrap().code, codes::HTTP_ERROR);
        assert_eq!(nodes[0].bus.envelope_stats().pending, 0);
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_untracked_api_message_to_stopped_node_is_an_error() {
        let mut nodes = cluster(2, |_, _| {}).await;
        nodes[1].shutdown().await;

        let msg = Message::api("APIStartVmMsg").with_service_id("mn-1:::vm");
        let err = timeout(WAIT, nodes[0].bus.send_api(msg, |_| {}))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BusError::Operation(code) if code.code == codes::OPERATION_ERROR));
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stopped_bus_answers_service_unavailable() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], EchoService);
        nodes[1].bus.stop();

        let reply = timeout(WAIT, nodes[0].bus.call(echo_to("mn-1", 1)))
            .await
            .unwrap()
            .unwrap();
        let error = reply.error().unwrap();
        assert_eq!(error.code, codes::OPERATION_ERROR);
        assert!(error.details.as_deref().unwrap_or_default().contains("status code: 503"));
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_event_still_reaches_live_nodes() {
        let mut nodes = cluster(3, |_, _| {}).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        for node in &nodes {
            let tx = tx.clone();
            let node_id = node.node_id().to_string();
            node.bus.subscribe_event(
                Arc::new(move |_: &Message| {
                    let _ = tx.send(node_id.clone());
                    false
                }),
                &["ClusterAlarmEvent"],
            );
        }
        drop(tx);
        nodes[2].shutdown().await;

        timeout(WAIT, nodes[0].bus.publish(Message::event("ClusterAlarmEvent")))
            .await
            .unwrap()
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["mn-0".to_string(), "mn-1".to_string()]);
        shutdown_all(&mut nodes).await;
    }
}
