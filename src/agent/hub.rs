//! Conversation-keyed fan-out of domain events to transport connections
//!
//! Each transport (one WebSocket connection) registers a bounded outbound
//! queue. Publishing serializes the event once and `try_send`s it to every
//! transport subscribed to the event's conversation: a full queue drops the
//! event for that transport only, a closed queue removes the transport.

use crate::agent::types::DomainEvent;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// Outbound queue of one transport connection (serialized JSON frames)
pub type TransportSender = mpsc::Sender<String>;

/// Concurrent subscriber registry
#[derive(Default)]
pub struct BroadcastHub {
    /// conversation id → transport id → outbound queue
    conversations: DashMap<String, HashMap<String, TransportSender>>,
    /// transport id → conversations it follows
    transports: DashMap<String, HashSet<String>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `transport_id` to `conversation_id`. A transport may follow
    /// several conversations; subscribing twice is harmless.
    pub fn subscribe(&self, conversation_id: &str, transport_id: &str, sender: TransportSender) {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .insert(transport_id.to_string(), sender);
        self.transports
            .entry(transport_id.to_string())
            .or_default()
            .insert(conversation_id.to_string());
        tracing::debug!(
            conversation_id,
            transport_id,
            "Transport subscribed to conversation"
        );
    }

    /// Remove one subscription
    pub fn unsubscribe_from(&self, conversation_id: &str, transport_id: &str) {
        self.remove_subscription(conversation_id, transport_id);
        if let Some(mut set) = self.transports.get_mut(transport_id) {
            set.remove(conversation_id);
        }
        self.transports
            .remove_if(transport_id, |_, set| set.is_empty());
    }

    /// Remove every subscription of a transport (disconnect)
    pub fn unsubscribe(&self, transport_id: &str) {
        if let Some((_, conversations)) = self.transports.remove(transport_id) {
            for conversation_id in &conversations {
                self.remove_subscription(conversation_id, transport_id);
            }
            tracing::debug!(
                transport_id,
                count = conversations.len(),
                "Transport unsubscribed from all conversations"
            );
        }
    }

    /// Deliver an event to every subscriber of its conversation.
    ///
    /// Never blocks. Returns the number of transports the event was queued on.
    pub fn publish(&self, event: &DomainEvent) -> usize {
        let conversation_id = event.conversation_id();
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conversation_id, "Failed to serialize event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        if let Some(subscribers) = self.conversations.get(conversation_id) {
            for (transport_id, sender) in subscribers.iter() {
                match sender.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            conversation_id,
                            transport_id = %transport_id,
                            "Transport queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(transport_id.clone());
                    }
                }
            }
        }

        // The bucket guard is released before pruning.
        for transport_id in closed {
            tracing::debug!(transport_id = %transport_id, "Pruning closed transport");
            self.unsubscribe(&transport_id);
        }

        delivered
    }

    /// Number of transports subscribed to a conversation
    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .get(conversation_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Conversations a transport follows
    pub fn subscriptions(&self, transport_id: &str) -> Vec<String> {
        self.transports
            .get(transport_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_subscription(&self, conversation_id: &str, transport_id: &str) {
        if let Some(mut subscribers) = self.conversations.get_mut(conversation_id) {
            subscribers.remove(transport_id);
        }
        self.conversations
            .remove_if(conversation_id, |_, subscribers| subscribers.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(conversation_id: &str, text: &str) -> DomainEvent {
        DomainEvent::TextChunk {
            conversation_id: conversation_id.to_string(),
            chunk: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_isolated_by_conversation() {
        let hub = BroadcastHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.subscribe("conv-a", "t1", tx_a);
        hub.subscribe("conv-b", "t2", tx_b);

        assert_eq!(hub.publish(&chunk("conv-a", "hello a")), 1);
        assert_eq!(hub.publish(&chunk("conv-b", "hello b")), 1);

        let frame: serde_json::Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "message_chunk");
        assert_eq!(frame["payload"]["conversation_id"], "conv-a");
        assert_eq!(frame["payload"]["chunk"], "hello a");
        assert!(rx_a.try_recv().is_err());

        let frame: serde_json::Value = serde_json::from_str(&rx_b.recv().await.unwrap()).unwrap();
        assert_eq!(frame["payload"]["conversation_id"], "conv-b");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_many_subscribers_share_conversation() {
        let hub = BroadcastHub::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.subscribe("conv", "t1", tx1);
        hub.subscribe("conv", "t2", tx2);
        assert_eq!(hub.subscriber_count("conv"), 2);

        assert_eq!(hub.publish(&chunk("conv", "x")), 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.publish(&chunk("nobody", "x")), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking_others() {
        let hub = BroadcastHub::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        hub.subscribe("conv", "slow", slow_tx);
        hub.subscribe("conv", "fast", fast_tx);

        assert_eq!(hub.publish(&chunk("conv", "1")), 2);
        assert_eq!(hub.publish(&chunk("conv", "2")), 1);
        assert_eq!(hub.publish(&chunk("conv", "3")), 1);

        // The slow transport stays subscribed and keeps its first frame.
        assert_eq!(hub.subscriber_count("conv"), 2);
        assert!(slow_rx.recv().await.unwrap().contains("\"1\""));
        for _ in 0..3 {
            assert!(fast_rx.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_closed_transport_is_pruned() {
        let hub = BroadcastHub::new();
        let (tx, rx) = mpsc::channel(8);
        hub.subscribe("conv-a", "t1", tx.clone());
        hub.subscribe("conv-b", "t1", tx);
        drop(rx);

        assert_eq!(hub.publish(&chunk("conv-a", "x")), 0);
        assert_eq!(hub.subscriber_count("conv-a"), 0);
        assert_eq!(hub.subscriber_count("conv-b"), 0);
        assert!(hub.subscriptions("t1").is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_one_and_all() {
        let hub = BroadcastHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe("conv-a", "t1", tx.clone());
        hub.subscribe("conv-b", "t1", tx);

        let mut subs = hub.subscriptions("t1");
        subs.sort();
        assert_eq!(subs, vec!["conv-a".to_string(), "conv-b".to_string()]);

        hub.unsubscribe_from("conv-a", "t1");
        assert_eq!(hub.publish(&chunk("conv-a", "x")), 0);
        assert_eq!(hub.publish(&chunk("conv-b", "y")), 1);
        assert!(rx.recv().await.unwrap().contains("conv-b"));

        hub.unsubscribe("t1");
        assert_eq!(hub.publish(&chunk("conv-b", "z")), 0);
        assert!(hub.subscriptions("t1").is_empty());
    }
}
