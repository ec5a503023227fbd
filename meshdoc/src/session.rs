//! Per-peer sync session: the two-step reconciliation handshake plus live
//! updates.
//!
//! Message-driven and free of I/O: the connection manager feeds frames in
//! and executes whatever comes back (a reply frame to send, an applied blob
//! to fan out to the other peers). One handshake per newly connected peer;
//! once synced, everything is incremental `Update` frames, no re-handshake.

use crate::doc::{DocError, SharedDoc};
use crate::protocol::{PeerId, SyncFrame};

/// Handshake progress with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel is up, step-1 not yet sent.
    Connected,
    /// Step-1 sent, waiting for the step-2 reply.
    AwaitingSyncResponse,
    /// Reconciliation done; live updates only.
    Synced,
}

/// What the caller must do after feeding a frame in.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Frame to send back to this peer.
    pub reply: Option<SyncFrame>,
    /// Update blob that was merged into the local document; fan it out to
    /// the other ready peers (never back to this one).
    pub applied: Option<Vec<u8>>,
    /// True the first time this peer completes reconciliation.
    pub just_synced: bool,
}

pub struct SyncSession {
    remote: PeerId,
    state: SessionState,
}

impl SyncSession {
    pub fn new(remote: PeerId) -> Self {
        Self {
            remote,
            state: SessionState::Connected,
        }
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SessionState::Synced
    }

    /// Called once when the channel connects (either role): produces the
    /// step-1 frame carrying our state summary.
    pub fn on_connect(&mut self, doc: &SharedDoc) -> SyncFrame {
        self.state = SessionState::AwaitingSyncResponse;
        SyncFrame::Step1(doc.state_summary())
    }

    /// Feed one inbound sync frame. Errors mean the peer sent a corrupt
    /// blob; the caller tears the connection down.
    pub fn handle_frame(
        &mut self,
        frame: SyncFrame,
        doc: &SharedDoc,
    ) -> Result<SessionOutput, DocError> {
        match frame {
            SyncFrame::Step1(summary) => {
                // Their summary tells us what they are missing.
                let missing = doc.diff(&summary)?;
                Ok(SessionOutput {
                    reply: Some(SyncFrame::Step2(missing)),
                    ..SessionOutput::default()
                })
            }
            SyncFrame::Step2(update) | SyncFrame::Update(update) => {
                // An update we already hold must not be fanned out again,
                // or redundant deliveries would gossip around the mesh
                // forever.
                let before = doc.state_summary();
                doc.apply(&update)?;
                let changed = doc.state_summary() != before;
                let just_synced = self.state != SessionState::Synced;
                self.state = SessionState::Synced;
                Ok(SessionOutput {
                    reply: None,
                    applied: changed.then_some(update),
                    just_synced,
                })
            }
        }
    }
}
