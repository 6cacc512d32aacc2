//! Asynchronous fan-out of stored messages to online recipients.
//!
//! Handlers push a [`MessageDelivery`] onto an unbounded queue and return
//! immediately. A single task drains the queue in order and writes a
//! `MESSAGING_DELIVER` action to every signed-in connection whose identity
//! is one of the job's recipients. Recipients that are offline are skipped,
//! so delivery is at most once. Jobs still queued when the process stops
//! are lost.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::db::Message;
use crate::protocol::Action;
use crate::registry::Registry;

/// A stored message and the identities it should reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDelivery {
    pub message: Message,
    pub recipient_ids: Vec<i64>,
}

pub type DeliveryQueue = mpsc::UnboundedSender<MessageDelivery>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<MessageDelivery>;

pub fn channel() -> (DeliveryQueue, DeliveryReceiver) {
    mpsc::unbounded_channel()
}

/// Spawn the dispatcher task. It runs until every queue sender is dropped.
pub fn spawn(registry: Arc<Registry>, rx: DeliveryReceiver) -> JoinHandle<()> {
    tokio::spawn(run(registry, rx))
}

pub async fn run(registry: Arc<Registry>, mut rx: DeliveryReceiver) {
    while let Some(job) = rx.recv().await {
        let delivered = deliver(&registry, &job);
        tracing::debug!(
            message_id = job.message.id,
            group_id = job.message.group_id,
            recipients = job.recipient_ids.len(),
            delivered,
            "Delivery job done"
        );
    }
    tracing::info!("Delivery queue closed, dispatcher exiting");
}

/// Deliver one job. Returns the number of connections written to.
pub fn deliver(registry: &Registry, job: &MessageDelivery) -> usize {
    let line = match Action::deliver(&job.message).encode() {
        Ok(line) => line,
        Err(e) => {
            tracing::error!(message_id = job.message.id, "Failed to encode delivery: {e}");
            return 0;
        }
    };
    let recipients: HashSet<i64> = job.recipient_ids.iter().copied().collect();

    let mut delivered = 0;
    for conn in registry.signed_in().iter() {
        if !recipients.contains(&conn.client.id) {
            continue;
        }
        match conn.outbox.try_send(line.clone()) {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = conn.conn_id,
                    client_id = conn.client.id,
                    message_id = job.message.id,
                    "Outbox full, delivery dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    conn_id = conn.conn_id,
                    client_id = conn.client.id,
                    "Connection gone, delivery skipped"
                );
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Client;
    use crate::protocol::MESSAGING_DELIVER;
    use crate::registry::Registration;

    fn client(id: i64) -> Client {
        Client {
            id,
            country_code: "1".to_string(),
            phone_number: format!("555{id:04}"),
            verification_code: Some("1234".to_string()),
        }
    }

    fn message(id: i64, content: &str) -> Message {
        Message {
            id,
            group_id: 10,
            sender_id: 2,
            content: content.to_string(),
            date_created: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn signed_in(registry: &Arc<Registry>, id: i64) -> (Registration, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        let reg = registry.register(tx);
        registry.sign_in(reg.id(), client(id)).unwrap();
        (reg, rx)
    }

    fn decode(line: &str) -> Action {
        serde_json::from_str(line.trim_end()).unwrap()
    }

    #[test]
    fn only_recipients_receive() {
        let registry = Arc::new(Registry::new());
        let (_r1, mut rx1) = signed_in(&registry, 1);
        let (_r2, mut rx2) = signed_in(&registry, 2);
        let (_r3, mut rx3) = signed_in(&registry, 3);

        let job = MessageDelivery { message: message(5, "hello"), recipient_ids: vec![2, 3] };
        assert_eq!(deliver(&registry, &job), 2);

        assert!(rx1.try_recv().is_err());
        for rx in [&mut rx2, &mut rx3] {
            let action = decode(&rx.try_recv().unwrap());
            assert_eq!(action.kind, MESSAGING_DELIVER);
            assert_eq!(action.payload["id"], 5);
            assert_eq!(action.payload["content"], "hello");
            assert_eq!(action.payload["sender_id"], 2);
        }
    }

    #[test]
    fn unauthenticated_connection_receives_nothing() {
        let registry = Arc::new(Registry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let reg = registry.register(tx);
        registry.set_identity(reg.id(), client(3)).unwrap();

        let job = MessageDelivery { message: message(1, "hi"), recipient_ids: vec![3] };
        assert_eq!(deliver(&registry, &job), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn every_device_of_a_recipient_receives() {
        let registry = Arc::new(Registry::new());
        let (_a, mut rx_a) = signed_in(&registry, 4);
        let (_b, mut rx_b) = signed_in(&registry, 4);

        let job = MessageDelivery { message: message(1, "hi"), recipient_ids: vec![4] };
        assert_eq!(deliver(&registry, &job), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn failed_recipient_does_not_block_others() {
        let registry = Arc::new(Registry::new());
        let (_closed, rx_closed) = signed_in(&registry, 1);
        drop(rx_closed);

        let (tx_full, _rx_full) = mpsc::channel(1);
        let full = registry.register(tx_full.clone());
        registry.sign_in(full.id(), client(2)).unwrap();
        tx_full.try_send("filler".to_string()).unwrap();

        let (_ok, mut rx_ok) = signed_in(&registry, 3);

        let job = MessageDelivery { message: message(1, "hi"), recipient_ids: vec![1, 2, 3] };
        assert_eq!(deliver(&registry, &job), 1);
        assert!(rx_ok.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dispatcher_processes_jobs_in_order() {
        let registry = Arc::new(Registry::new());
        let (_r, mut rx) = signed_in(&registry, 2);
        let (queue, jobs) = channel();
        let handle = spawn(registry.clone(), jobs);

        for (id, text) in [(1, "one"), (2, "two"), (3, "three")] {
            queue.send(MessageDelivery { message: message(id, text), recipient_ids: vec![2] }).unwrap();
        }
        drop(queue);
        handle.await.unwrap();

        let got: Vec<String> = (0..3)
            .map(|_| decode(&rx.try_recv().unwrap()).payload["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(got, vec!["one", "two", "three"]);
    }
}
