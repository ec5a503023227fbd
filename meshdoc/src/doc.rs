//! Black-box surface over the replicated document.
//!
//! The sync core never inspects update blobs; everything it needs from the
//! CRDT is behind four operations: a compact state summary, a diff against
//! a remote summary, applying an update, and merging raw blobs. Merge is
//! commutative, associative, and idempotent, so arrival order across peers
//! does not matter.

use std::fmt;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::PeerId;

/// Where an update entered this process. Used for echo suppression (never
/// re-broadcast to the originating peer) and for deciding what the backend
/// bridge persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by the local editor.
    Local,
    /// Received over a direct peer channel.
    Peer(PeerId),
    /// Replayed or received from the durable-log bridge.
    Backend,
}

/// Errors from the document surface: corrupt blobs, failed integration.
#[derive(Debug, Clone)]
pub enum DocError {
    Decode(String),
    Apply(String),
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "update decode failed: {e}"),
            Self::Apply(e) => write!(f, "update apply failed: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// Thin wrapper over `yrs::Doc` exposing only the black-box operations the
/// sync layer is allowed to use. Share via `Arc`; all methods take `&self`.
pub struct SharedDoc {
    doc: Doc,
}

impl SharedDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Wrap an existing document (the embedding editor usually owns one).
    pub fn from_doc(doc: Doc) -> Self {
        Self { doc }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Compact summary of locally known state (sync step-1 body).
    pub fn state_summary(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `summary` is missing (sync step-2 body).
    pub fn diff(&self, summary: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(summary).map_err(|e| DocError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Full document state as one update blob.
    pub fn encode_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge one update blob into local state. Idempotent.
    pub fn apply(&self, update: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(update).map_err(|e| DocError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// True when the document holds no state at all.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        txn.state_vector() == StateVector::default()
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge raw update blobs into one without materializing a document.
///
/// Set-union semantics: order of `updates` is immaterial and duplicates
/// collapse. Canonical caller order is (existing, then incoming).
pub fn merge_update_batch(updates: &[Vec<u8>]) -> Result<Vec<u8>, DocError> {
    let mut decoded = Vec::with_capacity(updates.len());
    for blob in updates {
        decoded.push(Update::decode_v1(blob).map_err(|e| DocError::Decode(e.to_string()))?);
    }
    let merged = Update::merge_updates(decoded);
    Ok(merged.encode_v1())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn doc_with_text(content: &str) -> SharedDoc {
        let shared = SharedDoc::new();
        {
            let mut txn = shared.doc().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        shared
    }

    fn text_of(shared: &SharedDoc) -> String {
        let txn = shared.doc().transact();
        match txn.get_text("content") {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    #[test]
    fn test_step1_step2_reconciliation() {
        let a = doc_with_text("hello");
        let b = SharedDoc::new();

        let summary = b.state_summary();
        let missing = a.diff(&summary).unwrap();
        b.apply(&missing).unwrap();

        assert_eq!(text_of(&b), "hello");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = doc_with_text("abc");
        let update = a.encode_full();

        let b = SharedDoc::new();
        b.apply(&update).unwrap();
        b.apply(&update).unwrap();

        assert_eq!(text_of(&b), "abc");
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = doc_with_text("left");
        let b = doc_with_text("right");
        let (u1, u2) = (a.encode_full(), b.encode_full());

        let forward = SharedDoc::new();
        forward.apply(&u1).unwrap();
        forward.apply(&u2).unwrap();

        let backward = SharedDoc::new();
        backward.apply(&u2).unwrap();
        backward.apply(&u1).unwrap();

        assert_eq!(forward.encode_full(), backward.encode_full());
    }

    #[test]
    fn test_merge_update_batch_equals_sequential_apply() {
        let a = doc_with_text("one ");
        let u1 = a.encode_full();
        {
            let mut txn = a.doc().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 4, "two");
        }
        let u2 = a.diff(&SharedDoc::new().state_summary()).unwrap();

        let merged = merge_update_batch(&[u1.clone(), u2.clone()]).unwrap();

        let from_merged = SharedDoc::new();
        from_merged.apply(&merged).unwrap();
        let from_each = SharedDoc::new();
        from_each.apply(&u1).unwrap();
        from_each.apply(&u2).unwrap();

        assert_eq!(text_of(&from_merged), text_of(&from_each));
    }

    #[test]
    fn test_corrupt_update_is_rejected() {
        let doc = SharedDoc::new();
        assert!(doc.apply(&[0xff, 0x01, 0x02]).is_err());
        assert!(doc.diff(&[0xff, 0xff]).is_err());
        assert!(merge_update_batch(&[vec![0xff, 0xff]]).is_err());
    }

    #[test]
    fn test_empty_doc_reports_empty() {
        let doc = SharedDoc::new();
        assert!(doc.is_empty());
        let filled = doc_with_text("x");
        assert!(!filled.is_empty());
    }
}
