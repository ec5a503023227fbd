//! # meshdoc — Peer-to-peer document synchronization
//!
//! Serverless multiplayer editing: peers discover each other over a
//! broadcast signaling topic, connect pairwise, reconcile CRDT state with
//! a two-step handshake, and keep a durable append-only log so documents
//! outlive any single session.
//!
//! ## Architecture
//!
//! ```text
//!                  signaling topic (per document)
//!          ┌────────────────────┬────────────────────┐
//!          ▼                    ▼                    ▼
//!   ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!   │  DocMesh A  │◄────►│  DocMesh B  │◄────►│  DocMesh C  │
//!   │ (dispatcher)│ peer │ (dispatcher)│ peer │ (dispatcher)│
//!   └──────┬──────┘ chan └─────────────┘ chan └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐   BackendBridge   ┌──────────────┐
//!   │ SharedDoc   │◄─────────────────►│ EventLogStore│
//!   │ (yrs CRDT)  │  load / append    │ (RocksDB)    │
//!   └─────────────┘                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire formats: signaling envelopes, peer messages,
//!   sync frames
//! - [`signaling`] — Broadcast discovery topic (capability trait + local
//!   bus)
//! - [`channel`] — Direct peer-channel capability (capability trait +
//!   in-memory transport)
//! - [`mesh`] — Per-document dispatcher: peer table, tie-break dialing,
//!   update fan-out
//! - [`session`] — Per-peer two-step reconciliation state machine
//! - [`awareness`] — Ephemeral presence with monotonic per-peer clocks
//! - [`doc`] — `yrs` document wrapper and update-batch merging
//! - [`bridge`] — Document ↔ durable log connection with batched flush
//! - [`storage`] — Append-only log: RocksDB-backed and in-memory
//! - [`gateway`] — Document registration, activation and wake handling

pub mod awareness;
pub mod bridge;
pub mod channel;
pub mod doc;
pub mod gateway;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessTracker};
pub use bridge::{BackendBridge, BridgeError};
pub use channel::{ChannelEvent, ChannelFactory, MemoryChannelFactory, PeerChannel};
pub use doc::{DocError, SharedDoc, UpdateOrigin, merge_update_batch};
pub use gateway::{DocActivationGateway, GatewayError, announce_wake, spawn_wake_listener};
pub use mesh::{DocMesh, MeshConfig, MeshError, MeshEvent, MeshHandle};
pub use protocol::{
    DocumentId, PeerId, PeerMessage, ProtocolError, SignalingMessage, SyncFrame,
};
pub use session::{SessionOutput, SessionState, SyncSession};
pub use signaling::{DocSignaling, LocalSignalingBus, SignalingInbox, SignalingTransport};
pub use storage::{
    DocDirectory, DurableLog, EventLogStore, LogHandle, MemoryLogStore, StoreConfig, StoreError,
};
