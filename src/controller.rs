//! Notification handling: decode, filter and dispatch.
//!
//! One loop drains the delivery stream.  Every accepted notification is
//! handed to its own task and the loop moves on immediately; tasks are
//! never awaited, bounded or ordered against each other, so two updates
//! for the same address may complete in either order.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::broker::DeliveryStream;
use crate::resolver::InstanceResolver;
use crate::sink::RecordSink;
use crate::types::{Message, RecordAction, FLOATING_IP_UPDATE_END};

pub struct Controller {
    resolver: InstanceResolver,
    sink: Arc<dyn RecordSink>,
}

impl Controller {
    pub fn new(resolver: InstanceResolver, sink: Arc<dyn RecordSink>) -> Self {
        Self { resolver, sink }
    }

    /// Drains `deliveries` until the stream closes.
    pub async fn run<D: DeliveryStream>(self: Arc<Self>, mut deliveries: D) {
        while let Some(body) = deliveries.next_body().await {
            // Fire and forget; the handle is dropped on purpose.
            let _ = self.handle_delivery(&body);
        }
        info!("Delivery stream closed, stopping controller");
    }

    /// Decodes and filters one delivery body, spawning the record task for
    /// an accepted notification.
    pub fn handle_delivery(self: &Arc<Self>, body: &[u8]) -> Option<JoinHandle<()>> {
        let msg = match Message::decode(body) {
            Ok(m) => m,
            Err(e) => {
                error!("Error decoding message: {}", e);
                return None;
            }
        };

        match msg.action() {
            Some(action) => Some(self.dispatch(action)),
            None if msg.event_type == FLOATING_IP_UPDATE_END => {
                warn!("Ignoring floating IP update without a floating address");
                None
            }
            None => {
                info!("Ignoring event of type '{}'...", msg.event_type);
                None
            }
        }
    }

    fn dispatch(self: &Arc<Self>, action: RecordAction) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match action {
                RecordAction::Create { floating_ip } => {
                    this.resolve_and_create(&floating_ip).await
                }
                RecordAction::Remove { floating_ip } => this.remove(&floating_ip).await,
            }
        })
    }

    async fn resolve_and_create(&self, floating_ip: &str) {
        let instance_name = match self.resolver.resolve(floating_ip).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                warn!("No instance found holding floating IP '{}'", floating_ip);
                return;
            }
            Err(e) => {
                error!(
                    "Error getting instance name for ip '{}': '{}'",
                    floating_ip, e
                );
                return;
            }
        };

        if let Err(e) = self.sink.create_record(&instance_name, floating_ip).await {
            error!(
                "Error creating record for instance '{}' ({}): '{:#}'",
                instance_name, floating_ip, e
            );
        }
    }

    async fn remove(&self, floating_ip: &str) {
        if let Err(e) = self.sink.remove_record(floating_ip).await {
            error!(
                "Error removing record for address '{}': '{:#}'",
                floating_ip, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ComputeInventory, Server};
    use crate::error::CloudError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    enum Call {
        Create(String, String),
        Remove(String),
    }

    struct RecordingSink {
        calls: mpsc::UnboundedSender<Call>,
        fail: bool,
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn create_record(&self, instance_name: &str, floating_ip: &str) -> anyhow::Result<()> {
            let _ = self
                .calls
                .send(Call::Create(instance_name.into(), floating_ip.into()));
            if self.fail {
                anyhow::bail!("designate unavailable");
            }
            Ok(())
        }

        async fn remove_record(&self, floating_ip: &str) -> anyhow::Result<()> {
            let _ = self.calls.send(Call::Remove(floating_ip.into()));
            if self.fail {
                anyhow::bail!("designate unavailable");
            }
            Ok(())
        }
    }

    struct CountingInventory {
        servers: Vec<Server>,
        lookups: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ComputeInventory for CountingInventory {
        async fn list_servers(&self) -> Result<Vec<Server>, CloudError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CloudError::Config("compute unavailable".into()));
            }
            Ok(self.servers.clone())
        }
    }

    #[async_trait]
    impl DeliveryStream for mpsc::Receiver<Vec<u8>> {
        async fn next_body(&mut self) -> Option<Vec<u8>> {
            self.recv().await
        }
    }

    struct Harness {
        controller: Arc<Controller>,
        inventory: Arc<CountingInventory>,
        calls: mpsc::UnboundedReceiver<Call>,
    }

    fn harness(inventory_fails: bool, sink_fails: bool) -> Harness {
        let web = serde_json::from_value(json!({
            "name": "web-01",
            "addresses": {
                "private": [
                    {"OS-EXT-IPS:type": "fixed", "addr": "10.0.0.7"},
                    {"OS-EXT-IPS:type": "floating", "addr": "203.0.113.5"}
                ]
            }
        }))
        .unwrap();
        let inventory = Arc::new(CountingInventory {
            servers: vec![web],
            lookups: AtomicUsize::new(0),
            fail: inventory_fails,
        });
        let (tx, calls) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink {
            calls: tx,
            fail: sink_fails,
        });
        let controller = Arc::new(Controller::new(
            InstanceResolver::new(inventory.clone()),
            sink,
        ));
        Harness {
            controller,
            inventory,
            calls,
        }
    }

    fn update(floating: &str, fixed: Option<&str>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_type": "floatingip.update.end",
            "payload": {"floatingip": {
                "floating_ip_address": floating,
                "fixed_ip_address": fixed
            }}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn attach_resolves_and_creates() {
        let mut h = harness(false, false);
        let body = br#"{"event_type":"floatingip.update.end","payload":{"floatingip":{"floating_ip_address":"203.0.113.5","fixed_ip_address":"10.0.0.7"}}}"#;

        h.controller.handle_delivery(body).unwrap().await.unwrap();

        assert_eq!(
            h.calls.try_recv().unwrap(),
            Call::Create("web-01".into(), "203.0.113.5".into())
        );
        assert_eq!(h.inventory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn detach_removes_without_resolving() {
        let mut h = harness(false, false);

        h.controller
            .handle_delivery(&update("203.0.113.9", None))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(h.calls.try_recv().unwrap(), Call::Remove("203.0.113.9".into()));
        assert_eq!(h.inventory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_fixed_ip_counts_as_detach() {
        let mut h = harness(false, false);

        h.controller
            .handle_delivery(&update("203.0.113.9", Some("")))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(h.calls.try_recv().unwrap(), Call::Remove("203.0.113.9".into()));
        assert_eq!(h.inventory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolved_address_creates_nothing() {
        let mut h = harness(false, false);

        h.controller
            .handle_delivery(&update("198.51.100.20", Some("10.0.0.9")))
            .unwrap()
            .await
            .unwrap();

        assert!(h.calls.try_recv().is_err());
        assert_eq!(h.inventory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolution_failure_drops_the_event() {
        let mut h = harness(true, false);

        h.controller
            .handle_delivery(&update("203.0.113.5", Some("10.0.0.7")))
            .unwrap()
            .await
            .unwrap();

        assert!(h.calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn sink_failure_is_not_retried() {
        let mut h = harness(false, true);

        h.controller
            .handle_delivery(&update("203.0.113.5", Some("10.0.0.7")))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(
            h.calls.try_recv().unwrap(),
            Call::Create("web-01".into(), "203.0.113.5".into())
        );
        assert!(h.calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_event_types_are_dropped() {
        let h = harness(false, false);
        let body = br#"{"event_type":"compute.instance.create","payload":{"instance_id":"9f1e"}}"#;
        assert!(h.controller.handle_delivery(body).is_none());
        assert_eq!(h.inventory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_dropped() {
        let h = harness(false, false);
        assert!(h.controller.handle_delivery(b"{\"event_type\": ").is_none());
        assert!(h.controller.handle_delivery(b"").is_none());
        assert_eq!(h.inventory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_without_floating_address_is_dropped() {
        let h = harness(false, false);
        assert!(h.controller.handle_delivery(&update("", None)).is_none());
    }

    #[tokio::test]
    async fn run_keeps_draining_after_bad_deliveries() {
        let mut h = harness(false, false);
        let (tx, rx) = mpsc::channel(8);
        tx.send(b"garbage".to_vec()).await.unwrap();
        tx.send(br#"{"event_type":"port.create.end","payload":{}}"#.to_vec())
            .await
            .unwrap();
        tx.send(update("203.0.113.5", Some("10.0.0.7"))).await.unwrap();
        tx.send(update("203.0.113.9", None)).await.unwrap();
        drop(tx);

        Arc::clone(&h.controller).run(rx).await;

        let mut calls = Vec::new();
        for _ in 0..2 {
            let call = tokio::time::timeout(Duration::from_secs(5), h.calls.recv())
                .await
                .expect("dispatched task should report")
                .unwrap();
            calls.push(call);
        }
        calls.sort();
        assert_eq!(
            calls,
            vec![
                Call::Create("web-01".into(), "203.0.113.5".into()),
                Call::Remove("203.0.113.9".into()),
            ]
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), h.calls.recv())
                .await
                .is_err()
        );
    }
}
