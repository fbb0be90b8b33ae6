//! # Request/Reply Across Nodes
//!
//! A request addressed to `<node>:::<service>` on another node travels as an
//! HTTP POST, is handled there, and its reply travels back to the sender's
//! `cloudbus.messages` service where it resolves the pending call.

#[cfg(test)]
mod tests {
    use crate::integration::support::*;
    use cloud_bus::error::codes;
    use cloud_bus::{Message, TraceContext};
    use tokio::time::timeout;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_call_is_answered_by_the_remote_node() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], EchoService);

        let reply = timeout(WAIT, nodes[0].bus.call(echo_to("mn-1", 42)))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.body.decode::<String>("node_id").unwrap(), "mn-1");
        assert_eq!(reply.body.decode::<u64>("seq").unwrap(), 42);

        let stats = nodes[0].bus.envelope_stats();
        assert_eq!((stats.acked, stats.pending), (1, 0));
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_calls_to_every_node_keep_order() {
        let mut nodes = cluster(3, |_, _| {}).await;
        for node in &nodes {
            register(node, EchoService);
        }

        let msgs = (0..12u64).map(|i| echo_to(&node_name((i % 3) as usize), i)).collect();
        let replies = timeout(WAIT, nodes[0].bus.send_all(msgs, 4)).await.unwrap().unwrap();

        for (i, reply) in replies.iter().enumerate() {
            assert_eq!(reply.body.decode::<u64>("seq").unwrap(), i as u64);
            assert_eq!(reply.body.decode::<String>("node_id").unwrap(), node_name(i % 3));
        }
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_http_always_loops_back_through_the_endpoint() {
        let mut nodes = cluster(1, |_, config| config.http.always = true).await;
        register(&nodes[0], EchoService);

        let reply = timeout(WAIT, nodes[0].bus.call(echo_to("mn-0", 5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.body.decode::<u64>("seq").unwrap(), 5);
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_handler_error_comes_back_as_error_reply() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], FailingService);

        let msg = Message::need_reply("StopVmMsg").with_service_id("mn-1:::failing");
        let reply = timeout(WAIT, nodes[0].bus.call(msg)).await.unwrap().unwrap();
        let error = reply.error().unwrap();
        assert_eq!(error.code, codes::OPERATION_ERROR);
        assert!(error.details.as_deref().unwrap_or_default().contains("StopVmMsg"));
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unknown_remote_service_gets_unknown_message_reply() {
        let mut nodes = cluster(2, |_, _| {}).await;

        let msg = Message::need_reply("StartVmMsg").with_service_id("mn-1:::nobody");
        let reply = timeout(WAIT, nodes[0].bus.call(msg)).await.unwrap().unwrap();
        assert!(reply.error().unwrap().is_unknown_message());
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remote_silence_times_out() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], SilentService);

        let msg = Message::need_reply("PingMsg")
            .with_service_id("mn-1:::silent")
            .with_timeout_ms(200);
        let reply = timeout(WAIT, nodes[0].bus.call(msg)).await.unwrap().unwrap();
        assert!(reply.error().unwrap().is_timeout());
        assert_eq!(nodes[0].bus.envelope_stats().timed_out, 1);
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_trace_context_travels_with_the_request() {
        let mut nodes = cluster(2, |_, _| {}).await;
        let probe = register(&nodes[1], ContextProbe::default());

        let mut ctx = TraceContext::new().with_entry("vm", "vm-1");
        ctx.push_task("migrate-vm");
        let msg = Message::need_reply("ProbeMsg").with_service_id("mn-1:::probe");
        let bus = nodes[0].bus.clone();
        let reply = timeout(WAIT, ctx.clone().scope(async move { bus.call(msg).await }))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_success());

        let seen = probe.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].entries.get("vm").map(String::as_str), Some("vm-1"));
        assert_eq!(seen[0].task_stack, vec!["migrate-vm".to_string()]);
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_services_can_be_deactivated_and_reactivated() {
        let mut nodes = cluster(2, |_, _| {}).await;
        register(&nodes[1], EchoService);

        nodes[1].bus.deactivate_service("echo").unwrap();
        let reply = timeout(WAIT, nodes[0].bus.call(echo_to("mn-1", 1)))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.error().unwrap().is_unknown_message());

        nodes[1].bus.activate_service("echo").unwrap();
        let reply = timeout(WAIT, nodes[0].bus.call(echo_to("mn-1", 2)))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_success());
        shutdown_all(&mut nodes).await;
    }
}
