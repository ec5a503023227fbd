//! Direct peer-channel capability.
//!
//! The real transport (WebRTC-style, negotiated through signaling payloads)
//! lives outside this crate. What the sync layer needs from it is small:
//! feed connection-setup payloads in, send frames once connected, and
//! observe lifecycle as events. Events for a channel arrive on one queue in
//! FIFO order — `Connected` always precedes the first `Data`, and nothing
//! follows `Closed`.
//!
//! [`MemoryChannelFactory`] implements the contract in-process by pairing
//! endpoints through the same offer/answer signal payloads a real transport
//! would exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::PeerId;

/// Lifecycle and data events from one channel, tagged with the remote peer
/// they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Connection-setup payload to relay to the remote peer via signaling.
    Signal(Vec<u8>),
    /// Transport is up; frames can flow.
    Connected,
    /// One inbound frame.
    Data(Vec<u8>),
    /// Transport ended (close or error); the channel is dead.
    Closed,
}

/// Queue the connection manager hands to each channel it creates.
pub type ChannelEvents = mpsc::UnboundedSender<(PeerId, ChannelEvent)>;

/// One direct channel to a remote peer.
pub trait PeerChannel: Send {
    /// Feed a connection-setup payload received via signaling.
    fn apply_signal(&mut self, payload: &[u8]);
    /// Send one frame. Before the transport connects, frames may be
    /// buffered; after `Closed` they are dropped.
    fn send(&mut self, frame: Vec<u8>);
    /// Tear the transport down. Idempotent.
    fn close(&mut self);
}

/// Creates channels. `events` receives this channel's events tagged with
/// `remote`.
pub trait ChannelFactory: Send + Sync {
    fn create(
        &self,
        local: PeerId,
        remote: PeerId,
        initiator: bool,
        events: ChannelEvents,
    ) -> Box<dyn PeerChannel>;
}

// ── In-memory implementation ────────────────────────────────────────────

const OFFER_PREFIX: &[u8] = b"offer:";
const ANSWER_PREFIX: &[u8] = b"answer:";

struct PendingEnd {
    peer: PeerId,
    events: ChannelEvents,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingEnd>>>;

fn register(pending: &PendingMap, token: String, end: PendingEnd) {
    let mut map = match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.insert(token, end);
}

fn claim(pending: &PendingMap, token: &str) -> Option<PendingEnd> {
    let mut map = match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.remove(token)
}

/// In-process channel transport. Clones share one pairing table; give every
/// endpoint that should be able to reach the others a clone of the same
/// factory.
#[derive(Clone)]
pub struct MemoryChannelFactory {
    pending: PendingMap,
}

impl MemoryChannelFactory {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for MemoryChannelFactory {
    fn create(
        &self,
        local: PeerId,
        remote: PeerId,
        initiator: bool,
        events: ChannelEvents,
    ) -> Box<dyn PeerChannel> {
        let mut endpoint = MemoryChannel {
            pending: self.pending.clone(),
            local,
            remote,
            own_events: events,
            peer_events: None,
            buffered: Vec::new(),
            open: true,
        };
        if initiator {
            // Offer carries a one-shot token under which our event queue is
            // registered; the answering side claims it to complete the pair.
            let token = Uuid::new_v4().to_string();
            register(
                &endpoint.pending,
                token.clone(),
                PendingEnd {
                    peer: endpoint.local.clone(),
                    events: endpoint.own_events.clone(),
                },
            );
            let mut offer = OFFER_PREFIX.to_vec();
            offer.extend_from_slice(token.as_bytes());
            endpoint.emit_own(ChannelEvent::Signal(offer));
        }
        Box::new(endpoint)
    }
}

struct MemoryChannel {
    pending: PendingMap,
    local: PeerId,
    remote: PeerId,
    /// Our manager's queue; events tagged with `remote`.
    own_events: ChannelEvents,
    /// The other endpoint's manager queue; events tagged with `local`
    /// (which is the remote id from their perspective).
    peer_events: Option<ChannelEvents>,
    /// Frames sent before the answer arrived (initiator side only).
    buffered: Vec<Vec<u8>>,
    open: bool,
}

impl MemoryChannel {
    fn emit_own(&self, event: ChannelEvent) {
        let _ = self.own_events.send((self.remote.clone(), event));
    }

    fn emit_peer(&self, event: ChannelEvent) {
        if let Some(tx) = &self.peer_events {
            let _ = tx.send((self.local.clone(), event));
        }
    }
}

impl PeerChannel for MemoryChannel {
    fn apply_signal(&mut self, payload: &[u8]) {
        if !self.open {
            return;
        }
        if let Some(token) = payload.strip_prefix(OFFER_PREFIX) {
            // Answering side: claim the initiator's queue, connect both
            // ends, and hand our own queue back through the answer.
            let token = String::from_utf8_lossy(token);
            let Some(initiator) = claim(&self.pending, &token) else {
                log::debug!("stale offer token {token}, ignoring");
                return;
            };
            self.peer_events = Some(initiator.events);
            // The initiator's Connected goes through the same queue as all
            // later data, preserving Connected-before-Data ordering.
            self.emit_peer(ChannelEvent::Connected);
            let answer_token = Uuid::new_v4().to_string();
            register(
                &self.pending,
                answer_token.clone(),
                PendingEnd {
                    peer: self.local.clone(),
                    events: self.own_events.clone(),
                },
            );
            let mut answer = ANSWER_PREFIX.to_vec();
            answer.extend_from_slice(answer_token.as_bytes());
            self.emit_own(ChannelEvent::Signal(answer));
            self.emit_own(ChannelEvent::Connected);
        } else if let Some(token) = payload.strip_prefix(ANSWER_PREFIX) {
            let token = String::from_utf8_lossy(token);
            let Some(answerer) = claim(&self.pending, &token) else {
                log::debug!("stale answer token {token}, ignoring");
                return;
            };
            if answerer.peer != self.remote {
                log::debug!("answer from unexpected peer {}, ignoring", answerer.peer);
                return;
            }
            self.peer_events = Some(answerer.events);
            let frames: Vec<_> = self.buffered.drain(..).collect();
            for frame in frames {
                self.emit_peer(ChannelEvent::Data(frame));
            }
        } else {
            log::debug!(
                "unrecognized signal payload ({} bytes), ignoring",
                payload.len()
            );
        }
    }

    fn send(&mut self, frame: Vec<u8>) {
        if !self.open {
            return;
        }
        if self.peer_events.is_some() {
            self.emit_peer(ChannelEvent::Data(frame));
        } else {
            self.buffered.push(frame);
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.emit_peer(ChannelEvent::Closed);
        self.peer_events = None;
        self.buffered.clear();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}
