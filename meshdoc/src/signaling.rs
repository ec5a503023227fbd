//! Broadcast signaling: one topic per document, best-effort delivery.
//!
//! The transport itself is an external capability (an IPFS-style pubsub
//! in real deployments); this module pins its contract, provides an
//! in-process hub for tests and single-process setups, and wraps one
//! (transport, topic, local peer) triple with the encode/decode and
//! self-filtering every caller needs.
//!
//! Loss is tolerated by design: nothing here retries, because callers
//! re-announce periodically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::protocol::{PeerId, SignalingMessage};

/// Publish/subscribe capability over named broadcast topics.
///
/// Delivery is best-effort, at-least-once, unordered across senders. The
/// transport delivers to every subscriber including the sender; filtering
/// self-originated messages is the subscriber's job (see [`DocSignaling`]).
pub trait SignalingTransport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>);
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Vec<u8>>>;
}

/// In-process signaling hub: one broadcast channel per topic.
///
/// Topics are created lazily on first publish or subscribe. A publish with
/// no subscribers is dropped, matching the best-effort contract.
pub struct LocalSignalingBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
}

impl LocalSignalingBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Arc<Vec<u8>>> {
        let mut topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn topic_count(&self) -> usize {
        match self.topics.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for LocalSignalingBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SignalingTransport for LocalSignalingBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) {
        // send() fails only when no receiver exists; that is fine here.
        let _ = self.sender_for(topic).send(Arc::new(payload));
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender_for(topic).subscribe()
    }
}

/// One document's view of the signaling transport.
pub struct DocSignaling {
    transport: Arc<dyn SignalingTransport>,
    topic: String,
    local: PeerId,
}

impl DocSignaling {
    pub fn new(transport: Arc<dyn SignalingTransport>, topic: impl Into<String>, local: PeerId) -> Self {
        Self {
            transport,
            topic: topic.into(),
            local,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn announce(&self) {
        self.publish(SignalingMessage::Announce {
            sender: self.local.clone(),
        });
    }

    pub fn acknowledge(&self, recipient: PeerId) {
        self.publish(SignalingMessage::Acknowledge {
            sender: self.local.clone(),
            recipient,
        });
    }

    pub fn signal(&self, recipient: PeerId, payload: Vec<u8>) {
        self.publish(SignalingMessage::Signal {
            sender: self.local.clone(),
            recipient,
            payload,
        });
    }

    fn publish(&self, msg: SignalingMessage) {
        self.transport.publish(&self.topic, msg.encode());
    }

    /// Open the inbound side: decoded messages with self-echo filtered out.
    pub fn open(&self) -> SignalingInbox {
        SignalingInbox {
            rx: self.transport.subscribe(&self.topic),
            local: self.local.clone(),
        }
    }
}

/// Filtered, decoded subscription to one document topic.
pub struct SignalingInbox {
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    local: PeerId,
}

impl SignalingInbox {
    /// Next signaling message from another peer, or `None` once the
    /// transport is gone. Malformed frames and self-originated messages
    /// are skipped; a lagged receiver keeps going (missed announces are
    /// repaired by the next re-announce).
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            match self.rx.recv().await {
                Ok(raw) => match SignalingMessage::decode(&raw) {
                    Ok(msg) if *msg.sender() == self.local => continue,
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        log::debug!("dropping malformed signaling frame: {e}");
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("signaling inbox lagged, skipped {n} messages");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
