//! # Polymorphic Fields Over HTTP
//!
//! Fields holding a concrete payload type lose their type in JSON. The sender
//! writes a `schema` header (path -> type name) and the receiver rebuilds the
//! payloads from its registry before delivery.

#[cfg(test)]
mod tests {
    use crate::integration::support::*;
    use async_trait::async_trait;
    use cloud_bus::error::codes;
    use cloud_bus::message::SCHEMA;
    use cloud_bus::{CloudBus, Field, HandlerError, Message, PayloadType, Service};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct KvmHostInventory {
        uuid: String,
        cpu_num: u32,
        hypervisor: String,
    }

    impl PayloadType for KvmHostInventory {
        const TYPE_NAME: &'static str = "KvmHostInventory";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CephStorageInventory {
        uuid: String,
        pools: Vec<String>,
    }

    impl PayloadType for CephStorageInventory {
        const TYPE_NAME: &'static str = "CephStorageInventory";
    }

    fn kvm(uuid: &str) -> KvmHostInventory {
        KvmHostInventory {
            uuid: uuid.into(),
            cpu_num: 16,
            hypervisor: "KVM".into(),
        }
    }

    /// Replies with what it found in the `host` field and `targets` list.
    struct InventoryService;

    #[async_trait]
    impl Service for InventoryService {
        fn id(&self) -> &str {
            "inventory"
        }

        async fn handle_message(&self, msg: &Message, bus: &CloudBus) -> Result<(), HandlerError> {
            let host = msg.body.payload::<KvmHostInventory>("host").cloned();
            let storage = msg
                .body
                .get_path("/targets/1")
                .and_then(Field::downcast_ref::<CephStorageInventory>)
                .cloned();
            let saw_schema = msg.header(SCHEMA).is_some();

            let reply = Message::reply("InventoryReply")
                .with_value("host_uuid", json!(host.map(|h| h.uuid)))
                .with_value("storage_pools", json!(storage.map(|s| s.pools)))
                .with_value("saw_schema", json!(saw_schema));
            bus.reply(msg, reply).await.map_err(anyhow::Error::from)?;
            Ok(())
        }
    }

    fn request(target: &str) -> Message {
        Message::need_reply("SyncInventoryMsg")
            .with_service_id(format!("{}:::inventory", target))
            .with_payload("host", kvm("host-1"))
            .with_field(
                "targets",
                Field::List(vec![
                    Field::payload(kvm("host-2")),
                    Field::payload(CephStorageInventory {
                        uuid: "ps-1".into(),
                        pools: vec!["images".into(), "volumes".into()],
                    }),
                    Field::from_value(json!(null)),
                ]),
            )
            .with_value("note", json!({"plain": true}))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_payloads_are_rebuilt_on_the_receiving_node() {
        let mut nodes = cluster(2, |_, _| {}).await;
        nodes[1].bus.payloads().register::<KvmHostInventory>();
        nodes[1].bus.payloads().register::<CephStorageInventory>();
        register(&nodes[1], InventoryService);

        let reply = timeout(WAIT, nodes[0].bus.call(request("mn-1")))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_success(), "{:?}", reply.error());
        assert_eq!(reply.body.decode::<Option<String>>("host_uuid").unwrap().as_deref(), Some("host-1"));
        assert_eq!(
            reply.body.decode::<Option<Vec<String>>>("storage_pools").unwrap(),
            Some(vec!["images".to_string(), "volumes".to_string()])
        );
        assert!(!reply.body.decode::<bool>("saw_schema").unwrap());
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_delivery_keeps_payloads_as_is() {
        let mut nodes = cluster(1, |_, _| {}).await;
        register(&nodes[0], InventoryService);

        let reply = timeout(WAIT, nodes[0].bus.call(request("mn-0")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.body.decode::<Option<String>>("host_uuid").unwrap().as_deref(), Some("host-1"));
        assert!(!reply.body.decode::<bool>("saw_schema").unwrap());
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unregistered_type_is_rejected_by_the_receiver() {
        let mut nodes = cluster(2, |_, _| {}).await;
        nodes[1].bus.payloads().register::<KvmHostInventory>();
        register(&nodes[1], InventoryService);

        let reply = timeout(WAIT, nodes[0].bus.call(request("mn-1")))
            .await
            .unwrap()
            .unwrap();
        let error = reply.error().unwrap();
        assert_eq!(error.code, codes::OPERATION_ERROR);
        assert!(error.details.as_deref().unwrap_or_default().contains("status code: 500"));
        shutdown_all(&mut nodes).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_malformed_body_is_a_bad_request() {
        let mut nodes = cluster(1, |_, _| {}).await;

        let response = reqwest::Client::new()
            .post(nodes[0].url())
            .header("content-type", "application/json")
            .body("{\"message\": 7}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        shutdown_all(&mut nodes).await;
    }
}
