//! Ephemeral per-peer presence ("awareness") state.
//!
//! Presence is not document content: it is never persisted, and an entry
//! never outlives the peer connection that carries it. Each entry carries a
//! monotonic clock so replayed or reordered deltas cannot resurrect stale
//! state — a lower clock is dropped on receipt, and an equal clock only
//! wins when it is a removal.
//!
//! Deltas ship only the changed entries; a full snapshot goes out once to
//! each newly connected peer.
//!
//! Delta encoding: `[count varint]` then per entry
//! `[peer varstring][clock varint][present u8][payload varbytes if present]`.

use std::collections::HashMap;

use crate::protocol::{self, PeerId, ProtocolError, Reader};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    clock: u64,
    /// `None` is a removal tombstone: the peer cleared its state but the
    /// clock must survive so later deltas compare correctly.
    payload: Option<Vec<u8>>,
}

/// Changes produced by applying one remote delta.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<PeerId>,
    pub updated: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence map for one document.
pub struct AwarenessTracker {
    local: PeerId,
    entries: HashMap<PeerId, Entry>,
}

impl AwarenessTracker {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: HashMap::new(),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Set the local presence payload. Returns the encoded delta to
    /// broadcast (only the local entry changed).
    pub fn set_local(&mut self, payload: Vec<u8>) -> Vec<u8> {
        let clock = self.bump_local();
        self.entries.insert(
            self.local.clone(),
            Entry {
                clock,
                payload: Some(payload),
            },
        );
        self.encode_entries(std::slice::from_ref(&self.local))
    }

    /// Clear the local presence payload. The clock still advances so the
    /// removal beats any in-flight older state.
    pub fn clear_local(&mut self) -> Vec<u8> {
        let clock = self.bump_local();
        self.entries.insert(
            self.local.clone(),
            Entry {
                clock,
                payload: None,
            },
        );
        self.encode_entries(std::slice::from_ref(&self.local))
    }

    fn bump_local(&self) -> u64 {
        self.entries
            .get(&self.local)
            .map(|e| e.clock + 1)
            .unwrap_or(1)
    }

    /// Current payload for a peer, if present (tombstones excluded).
    pub fn get(&self, peer: &PeerId) -> Option<&[u8]> {
        self.entries
            .get(peer)
            .and_then(|e| e.payload.as_deref())
    }

    /// All present (peer, payload) pairs.
    pub fn states(&self) -> impl Iterator<Item = (&PeerId, &[u8])> {
        self.entries
            .iter()
            .filter_map(|(peer, e)| e.payload.as_deref().map(|p| (peer, p)))
    }

    /// Drop a peer's entry entirely (transport-level disconnect). Returns
    /// true if the peer had visible state.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        matches!(
            self.entries.remove(peer),
            Some(Entry {
                payload: Some(_),
                ..
            })
        )
    }

    /// Encoded snapshot of every known entry, for a newly connected peer.
    /// `None` when there is nothing to say.
    pub fn snapshot_delta(&self) -> Option<Vec<u8>> {
        if self.entries.is_empty() {
            return None;
        }
        let peers: Vec<PeerId> = self.entries.keys().cloned().collect();
        Some(self.encode_entries(&peers))
    }

    fn encode_entries(&self, peers: &[PeerId]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(peers.len() * 32);
        protocol::write_var_u64(&mut buf, peers.len() as u64);
        for peer in peers {
            let entry = self.entries.get(peer);
            let clock = entry.map(|e| e.clock).unwrap_or(0);
            let payload = entry.and_then(|e| e.payload.as_deref());
            protocol::write_var_string(&mut buf, peer.as_str());
            protocol::write_var_u64(&mut buf, clock);
            match payload {
                Some(p) => {
                    buf.push(1);
                    protocol::write_var_bytes(&mut buf, p);
                }
                None => buf.push(0),
            }
        }
        buf
    }

    /// Apply a remote delta, dropping stale entries. Entries claiming our
    /// own id are ignored; only we speak for ourselves.
    pub fn apply_delta(&mut self, delta: &[u8]) -> Result<AwarenessChange, ProtocolError> {
        let mut r = Reader::new(delta);
        let count = r.read_var_u64()?;
        let mut change = AwarenessChange::default();
        for _ in 0..count {
            let peer = PeerId::new(r.read_var_string()?);
            let clock = r.read_var_u64()?;
            let payload = match r.read_u8()? {
                0 => None,
                _ => Some(r.read_var_bytes()?.to_vec()),
            };
            if peer == self.local {
                continue;
            }
            let incoming_is_removal = payload.is_none();
            let fresh = match self.entries.get(&peer) {
                Some(existing) => {
                    clock > existing.clock || (clock == existing.clock && incoming_is_removal)
                }
                None => true,
            };
            if !fresh {
                log::trace!("dropping stale awareness for {peer} (clock {clock})");
                continue;
            }
            let had_payload = self.get(&peer).is_some();
            match (&payload, had_payload) {
                (Some(_), false) => change.added.push(peer.clone()),
                (Some(_), true) => change.updated.push(peer.clone()),
                (None, true) => change.removed.push(peer.clone()),
                (None, false) => {} // tombstone refresh, nothing visible
            }
            self.entries.insert(peer, Entry { clock, payload });
        }
        Ok(change)
    }
}
