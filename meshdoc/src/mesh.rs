//! Per-document peer mesh: discovery, connection management and update
//! fan-out.
//!
//! One dispatcher task per document owns all mutable state (peer table,
//! sync sessions, awareness tracker), so no locks guard it. Everything
//! reaches the dispatcher as a message: signaling traffic, channel events,
//! and caller commands through [`MeshHandle`]. Observable state changes
//! flow out as [`MeshEvent`]s.
//!
//! Connection establishment is symmetric-discovery, asymmetric-dial: both
//! sides hear each other announce, but only the peer with the smaller id
//! (string order) initiates, so a simultaneous announce yields exactly one
//! channel per pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::awareness::{AwarenessChange, AwarenessTracker};
use crate::channel::{ChannelEvent, ChannelFactory, PeerChannel};
use crate::doc::SharedDoc;
use crate::protocol::{PeerId, PeerMessage, SignalingMessage, SyncFrame};
use crate::session::SyncSession;
use crate::signaling::DocSignaling;

/// Mesh failures surfaced through the handle.
#[derive(Debug)]
pub enum MeshError {
    /// The dispatcher task is gone
    Shutdown,
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshError::Shutdown => write!(f, "Mesh dispatcher has shut down"),
        }
    }
}

impl std::error::Error for MeshError {}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct MeshConfig {
    /// Re-announce on this interval until the first peer connects. `None`
    /// leaves re-announcing entirely to the caller.
    pub announce_interval: Option<Duration>,
}

/// State changes observable from outside the dispatcher.
#[derive(Debug)]
pub enum MeshEvent {
    /// First peer channel connected; the mesh is no longer alone.
    Ready,
    PeerConnected(PeerId),
    /// Reconciliation with this peer completed.
    PeerSynced(PeerId),
    PeerLeft(PeerId),
    /// An update from a peer was merged into the local document.
    RemoteUpdate { from: PeerId, update: Vec<u8> },
    /// A locally submitted update was merged and broadcast. Callers
    /// holding a [`crate::bridge::BackendBridge`] forward these (origin
    /// `Local`) so they reach the durable log.
    LocalUpdate { update: Vec<u8> },
    AwarenessChanged(AwarenessChange),
    /// A per-peer failure (the peer was torn down; the mesh continues).
    Error { peer: PeerId, reason: String },
}

enum Command {
    Announce,
    ApplyLocalUpdate(Vec<u8>),
    SetAwareness(Vec<u8>),
    ClearAwareness,
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    Shutdown,
}

/// Caller-side handle to one document's dispatcher.
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl MeshHandle {
    pub fn announce(&self) -> Result<(), MeshError> {
        self.send(Command::Announce)
    }

    /// Merge a locally produced update into the document and broadcast it
    /// to every ready peer.
    pub fn apply_local_update(&self, update: Vec<u8>) -> Result<(), MeshError> {
        self.send(Command::ApplyLocalUpdate(update))
    }

    pub fn set_awareness(&self, payload: Vec<u8>) -> Result<(), MeshError> {
        self.send(Command::SetAwareness(payload))
    }

    pub fn clear_awareness(&self) -> Result<(), MeshError> {
        self.send(Command::ClearAwareness)
    }

    /// Ids of peers whose channels are currently ready.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ConnectedPeers(tx))?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }

    pub fn shutdown(&self) -> Result<(), MeshError> {
        self.send(Command::Shutdown)
    }

    fn send(&self, cmd: Command) -> Result<(), MeshError> {
        self.commands.send(cmd).map_err(|_| MeshError::Shutdown)
    }
}

struct PeerSlot {
    channel: Box<dyn PeerChannel>,
    session: SyncSession,
    /// True once the channel reported `Connected`.
    ready: bool,
}

/// Dispatcher state for one document.
pub struct DocMesh {
    local: PeerId,
    doc: Arc<SharedDoc>,
    signaling: DocSignaling,
    factory: Arc<dyn ChannelFactory>,
    peers: HashMap<PeerId, PeerSlot>,
    awareness: AwarenessTracker,
    channel_events_tx: mpsc::UnboundedSender<(PeerId, ChannelEvent)>,
    events: mpsc::UnboundedSender<MeshEvent>,
    ready_emitted: bool,
}

impl DocMesh {
    /// Spawn the dispatcher task. The returned receiver carries
    /// [`MeshEvent`]s until shutdown.
    pub fn spawn(
        doc: Arc<SharedDoc>,
        signaling: DocSignaling,
        factory: Arc<dyn ChannelFactory>,
        config: MeshConfig,
    ) -> (MeshHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        let local = signaling.local_peer().clone();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (channel_events_tx, channel_events_rx) = mpsc::unbounded_channel();

        // Subscribe before the task starts so no announce is missed.
        let inbox = signaling.open();

        let mesh = DocMesh {
            awareness: AwarenessTracker::new(local.clone()),
            local,
            doc,
            signaling,
            factory,
            peers: HashMap::new(),
            channel_events_tx,
            events: events_tx,
            ready_emitted: false,
        };

        tokio::spawn(mesh.run(inbox, channel_events_rx, commands_rx, config));

        (MeshHandle { commands: commands_tx }, events_rx)
    }

    async fn run(
        mut self,
        mut inbox: crate::signaling::SignalingInbox,
        mut channel_events: mpsc::UnboundedReceiver<(PeerId, ChannelEvent)>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        config: MeshConfig,
    ) {
        let mut announce_timer = config.announce_interval.map(tokio::time::interval);

        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => self.on_signaling(msg),
                    None => break,
                },
                event = channel_events.recv() => match event {
                    // Sender lives in self, so this arm never yields None
                    // before shutdown.
                    Some((peer, event)) => self.on_channel_event(peer, event),
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                _ = tick(&mut announce_timer) => {
                    self.signaling.announce();
                    if self.ready_emitted {
                        announce_timer = None;
                    }
                },
            }
        }

        for (_, mut slot) in self.peers.drain() {
            slot.channel.close();
        }
        log::debug!("mesh dispatcher for {} stopped", self.local);
    }

    fn on_signaling(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Announce { sender } => {
                self.signaling.acknowledge(sender.clone());
                self.maybe_initiate(sender);
            }
            SignalingMessage::Acknowledge { sender, recipient } => {
                if recipient == self.local {
                    self.maybe_initiate(sender);
                }
            }
            SignalingMessage::Signal {
                sender,
                recipient,
                payload,
            } => {
                if recipient != self.local {
                    return;
                }
                // A signal from an unknown peer means they are dialing us.
                if !self.peers.contains_key(&sender) {
                    self.create_slot(sender.clone(), false);
                }
                if let Some(slot) = self.peers.get_mut(&sender) {
                    slot.channel.apply_signal(&payload);
                }
            }
        }
    }

    /// The lower id dials; the higher id waits to be dialed.
    fn maybe_initiate(&mut self, remote: PeerId) {
        if self.local < remote && !self.peers.contains_key(&remote) {
            log::debug!("{} initiating connection to {remote}", self.local);
            self.create_slot(remote, true);
        }
    }

    fn create_slot(&mut self, remote: PeerId, initiator: bool) {
        let channel = self.factory.create(
            self.local.clone(),
            remote.clone(),
            initiator,
            self.channel_events_tx.clone(),
        );
        self.peers.insert(
            remote.clone(),
            PeerSlot {
                channel,
                session: SyncSession::new(remote),
                ready: false,
            },
        );
    }

    fn on_channel_event(&mut self, peer: PeerId, event: ChannelEvent) {
        match event {
            ChannelEvent::Signal(payload) => {
                self.signaling.signal(peer, payload);
            }
            ChannelEvent::Connected => self.on_peer_connected(peer),
            ChannelEvent::Data(frame) => self.on_peer_data(peer, frame),
            ChannelEvent::Closed => {
                if self.peers.remove(&peer).is_some() {
                    self.on_peer_gone(peer);
                }
            }
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        let Some(slot) = self.peers.get_mut(&peer) else {
            return;
        };
        slot.ready = true;

        // Kick off reconciliation and share what we know about presence.
        let step1 = slot.session.on_connect(&self.doc);
        let mut frames = vec![PeerMessage::Sync {
            sender: self.local.clone(),
            frame: step1,
        }
        .encode()];
        if let Some(snapshot) = self.awareness.snapshot_delta() {
            frames.push(
                PeerMessage::Awareness {
                    sender: self.local.clone(),
                    delta: snapshot,
                }
                .encode(),
            );
        }
        for frame in frames {
            slot.channel.send(frame);
        }

        self.emit(MeshEvent::PeerConnected(peer));
        if !self.ready_emitted {
            self.ready_emitted = true;
            self.emit(MeshEvent::Ready);
        }
    }

    fn on_peer_data(&mut self, peer: PeerId, frame: Vec<u8>) {
        let message = match PeerMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                self.teardown(peer, format!("undecodable frame: {e}"));
                return;
            }
        };
        match message {
            PeerMessage::Sync { frame, .. } => self.on_sync_frame(peer, frame),
            PeerMessage::Awareness { delta, .. } => {
                match self.awareness.apply_delta(&delta) {
                    Ok(change) if !change.is_empty() => {
                        self.emit(MeshEvent::AwarenessChanged(change));
                    }
                    Ok(_) => {}
                    Err(e) => self.teardown(peer, format!("corrupt awareness delta: {e}")),
                }
            }
        }
    }

    fn on_sync_frame(&mut self, peer: PeerId, frame: SyncFrame) {
        let Some(slot) = self.peers.get_mut(&peer) else {
            return;
        };
        let output = match slot.session.handle_frame(frame, &self.doc) {
            Ok(output) => output,
            Err(e) => {
                self.teardown(peer, format!("corrupt sync frame: {e}"));
                return;
            }
        };
        if let Some(reply) = output.reply {
            slot.channel.send(
                PeerMessage::Sync {
                    sender: self.local.clone(),
                    frame: reply,
                }
                .encode(),
            );
        }
        if output.just_synced {
            self.emit(MeshEvent::PeerSynced(peer.clone()));
        }
        if let Some(update) = output.applied {
            // Fan the merged update out to everyone but its origin.
            self.broadcast_update(&update, Some(&peer));
            self.emit(MeshEvent::RemoteUpdate { from: peer, update });
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Announce => self.signaling.announce(),
            Command::ApplyLocalUpdate(update) => {
                if let Err(e) = self.doc.apply(&update) {
                    log::error!("rejecting corrupt local update: {e}");
                    return;
                }
                self.broadcast_update(&update, None);
                self.emit(MeshEvent::LocalUpdate { update });
            }
            Command::SetAwareness(payload) => {
                let delta = self.awareness.set_local(payload);
                self.broadcast_awareness(delta);
            }
            Command::ClearAwareness => {
                let delta = self.awareness.clear_local();
                self.broadcast_awareness(delta);
            }
            Command::ConnectedPeers(reply) => {
                let peers = self
                    .peers
                    .iter()
                    .filter(|(_, slot)| slot.ready)
                    .map(|(id, _)| id.clone())
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Shutdown => {} // handled in the loop
        }
    }

    fn broadcast_update(&mut self, update: &[u8], skip: Option<&PeerId>) {
        let frame = PeerMessage::Sync {
            sender: self.local.clone(),
            frame: SyncFrame::Update(update.to_vec()),
        }
        .encode();
        self.broadcast(frame, skip);
    }

    fn broadcast_awareness(&mut self, delta: Vec<u8>) {
        let frame = PeerMessage::Awareness {
            sender: self.local.clone(),
            delta,
        }
        .encode();
        self.broadcast(frame, None);
    }

    /// Send one frame to every ready peer except `skip`. Iterates a snapshot
    /// of the ready set so a send cannot observe a table mutated mid-loop.
    fn broadcast(&mut self, frame: Vec<u8>, skip: Option<&PeerId>) {
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(id, slot)| slot.ready && Some(*id) != skip)
            .map(|(id, _)| id.clone())
            .collect();
        for id in targets {
            if let Some(slot) = self.peers.get_mut(&id) {
                slot.channel.send(frame.clone());
            }
        }
    }

    /// Remove a misbehaving peer. The mesh keeps running for everyone else.
    fn teardown(&mut self, peer: PeerId, reason: String) {
        log::warn!("tearing down peer {peer}: {reason}");
        if let Some(mut slot) = self.peers.remove(&peer) {
            slot.channel.close();
        }
        self.emit(MeshEvent::Error {
            peer: peer.clone(),
            reason,
        });
        self.on_peer_gone(peer);
    }

    fn on_peer_gone(&mut self, peer: PeerId) {
        self.awareness.remove_peer(&peer);
        self.emit(MeshEvent::PeerLeft(peer));
    }

    fn emit(&self, event: MeshEvent) {
        // A dropped event receiver means the caller no longer listens;
        // dispatch continues regardless.
        let _ = self.events.send(event);
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannelFactory;
    use crate::signaling::{LocalSignalingBus, SignalingTransport};
    use tokio::time::{timeout, Duration};

    fn spawn_mesh(
        bus: &Arc<dyn SignalingTransport>,
        hub: &MemoryChannelFactory,
        id: &str,
    ) -> (Arc<SharedDoc>, MeshHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        let doc = Arc::new(SharedDoc::new());
        let signaling = DocSignaling::new(bus.clone(), "doc-topic", PeerId::new(id));
        let (handle, events) = DocMesh::spawn(
            doc.clone(),
            signaling,
            Arc::new(hub.clone()),
            MeshConfig::default(),
        );
        (doc, handle, events)
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<MeshEvent>,
        mut pred: impl FnMut(&MeshEvent) -> bool,
    ) -> MeshEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("mesh event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for mesh event")
    }

    #[tokio::test]
    async fn test_announce_connects_exactly_one_channel_per_pair() {
        let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());
        let hub = MemoryChannelFactory::new();

        let (_, handle_a, mut events_a) = spawn_mesh(&bus, &hub, "aaa");
        let (_, handle_b, mut events_b) = spawn_mesh(&bus, &hub, "bbb");

        // Simultaneous announce from both sides.
        handle_a.announce().unwrap();
        handle_b.announce().unwrap();

        wait_for(&mut events_a, |e| matches!(e, MeshEvent::PeerSynced(_))).await;
        wait_for(&mut events_b, |e| matches!(e, MeshEvent::PeerSynced(_))).await;

        let peers_a = handle_a.connected_peers().await.unwrap();
        let peers_b = handle_b.connected_peers().await.unwrap();
        assert_eq!(peers_a, vec![PeerId::new("bbb")]);
        assert_eq!(peers_b, vec![PeerId::new("aaa")]);
    }

    #[tokio::test]
    async fn test_local_update_reaches_peer() {
        let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());
        let hub = MemoryChannelFactory::new();

        let (doc_a, handle_a, mut events_a) = spawn_mesh(&bus, &hub, "aaa");
        let (doc_b, handle_b, mut events_b) = spawn_mesh(&bus, &hub, "bbb");

        handle_a.announce().unwrap();
        wait_for(&mut events_a, |e| matches!(e, MeshEvent::PeerSynced(_))).await;
        wait_for(&mut events_b, |e| matches!(e, MeshEvent::PeerSynced(_))).await;

        // Produce an update on a detached doc and feed it in as local.
        let scratch = SharedDoc::new();
        {
            use yrs::{Text, Transact, WriteTxn};
            let mut txn = scratch.doc().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "hello");
        }
        handle_a.apply_local_update(scratch.encode_full()).unwrap();

        wait_for(&mut events_b, |e| matches!(e, MeshEvent::RemoteUpdate { .. })).await;
        assert_eq!(doc_a.encode_full(), doc_b.encode_full());
        let _ = handle_b;
    }

    #[tokio::test]
    async fn test_local_update_is_emitted_for_bridging() {
        let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());
        let hub = MemoryChannelFactory::new();
        let (doc, handle, mut events) = spawn_mesh(&bus, &hub, "solo");

        let scratch = SharedDoc::new();
        {
            use yrs::{Text, Transact, WriteTxn};
            let mut txn = scratch.doc().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "persist me");
        }
        let update = scratch.encode_full();
        handle.apply_local_update(update.clone()).unwrap();

        let event = wait_for(&mut events, |e| matches!(e, MeshEvent::LocalUpdate { .. })).await;
        let MeshEvent::LocalUpdate { update: emitted } = event else {
            unreachable!()
        };
        assert_eq!(emitted, update);
        assert_eq!(doc.encode_full(), scratch.encode_full());
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatcher() {
        let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());
        let hub = MemoryChannelFactory::new();
        let (_, handle, mut events) = spawn_mesh(&bus, &hub, "solo");

        handle.shutdown().unwrap();
        timeout(Duration::from_secs(1), async {
            while events.recv().await.is_some() {}
        })
        .await
        .expect("event stream should close after shutdown");
        assert!(handle.connected_peers().await.is_err());
    }

    #[tokio::test]
    async fn test_higher_id_does_not_initiate() {
        let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());
        let hub = MemoryChannelFactory::new();

        let (_, handle_b, _events_b) = spawn_mesh(&bus, &hub, "bbb");
        let mut raw = bus.subscribe("doc-topic");

        handle_b.announce().unwrap();
        // Forge an announce from a lower-id peer that never dials.
        let announce = SignalingMessage::Announce {
            sender: PeerId::new("aaa"),
        };
        bus.publish("doc-topic", announce.encode());

        // bbb acknowledges but sends no connection signal.
        let mut saw_ack = false;
        for _ in 0..3 {
            let frame = match timeout(Duration::from_millis(100), raw.recv()).await {
                Ok(Ok(frame)) => frame,
                _ => break,
            };
            match SignalingMessage::decode(&frame) {
                Ok(SignalingMessage::Signal { sender, .. }) => {
                    assert_ne!(sender.as_str(), "bbb", "higher id must not dial");
                }
                Ok(SignalingMessage::Acknowledge { sender, recipient }) => {
                    assert_eq!(sender.as_str(), "bbb");
                    assert_eq!(recipient.as_str(), "aaa");
                    saw_ack = true;
                }
                _ => {}
            }
        }
        assert!(saw_ack);
    }
}
