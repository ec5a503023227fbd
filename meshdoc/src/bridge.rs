//! Bridge between a live document and its durable append-only log.
//!
//! On connect the full historical merge is loaded and applied to the
//! document exactly once. While connected, externally-originated updates
//! accumulate in a single pending batch (merged as they arrive, so the
//! batch never grows with history it already contains). On disconnect the
//! batch is appended as one log entry. A failed append is retried once;
//! if the retry also fails the batch stays in memory so a later reconnect
//! can try again.

use crate::doc::{DocError, SharedDoc, UpdateOrigin, merge_update_batch};
use crate::protocol::DocumentId;
use crate::storage::{DurableLog, LogHandle, StoreError};

/// Bridge lifecycle errors.
#[derive(Debug)]
pub enum BridgeError {
    /// The underlying log failed
    Store(StoreError),
    /// A loaded or forwarded blob could not be merged
    Doc(DocError),
    /// Operation requires a live connection
    NotConnected,
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Store(e) => write!(f, "Log error: {e}"),
            BridgeError::Doc(e) => write!(f, "Document error: {e}"),
            BridgeError::NotConnected => write!(f, "Bridge is not connected"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        BridgeError::Store(e)
    }
}

impl From<DocError> for BridgeError {
    fn from(e: DocError) -> Self {
        BridgeError::Doc(e)
    }
}

/// One logical connection between a document and its log.
pub struct BackendBridge {
    doc_id: DocumentId,
    handle: Option<Box<dyn LogHandle>>,
    /// Merged batch of updates awaiting the disconnect-time append.
    pending: Option<Vec<u8>>,
}

impl BackendBridge {
    /// Open the document's log, load its full history and apply it to the
    /// document. Returns the bridge plus the applied historical blob (if
    /// the log was non-empty) so the caller can fan it out to peers.
    pub fn connect(
        store: &dyn DurableLog,
        doc_id: DocumentId,
        doc: &SharedDoc,
    ) -> Result<(Self, Option<Vec<u8>>), BridgeError> {
        let mut handle = store.open(&doc_id)?;
        let history = handle.load()?;
        if let Some(blob) = &history {
            doc.apply(blob)?;
            log::info!(
                "loaded {} bytes of history into document {doc_id}",
                blob.len()
            );
        } else {
            log::debug!("document {doc_id} has no stored history");
        }
        Ok((
            Self {
                doc_id,
                handle: Some(handle),
                pending: None,
            },
            history,
        ))
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Route one update by origin. Backend-originated updates are already
    /// in the log and are dropped; local and peer updates join the pending
    /// batch.
    pub fn forward(&mut self, origin: &UpdateOrigin, update: &[u8]) -> Result<(), BridgeError> {
        match origin {
            UpdateOrigin::Backend => Ok(()),
            UpdateOrigin::Local | UpdateOrigin::Peer(_) => self.forward_local(update),
        }
    }

    /// Fold one externally-originated update into the pending batch.
    pub fn forward_local(&mut self, update: &[u8]) -> Result<(), BridgeError> {
        self.pending = Some(match self.pending.take() {
            Some(existing) => merge_update_batch(&[existing, update.to_vec()])?,
            None => update.to_vec(),
        });
        Ok(())
    }

    /// Apply an update that arrived on the live channel to the document.
    pub fn apply_remote(&self, update: &[u8], doc: &SharedDoc) -> Result<(), BridgeError> {
        if self.handle.is_none() {
            return Err(BridgeError::NotConnected);
        }
        doc.apply(update)?;
        Ok(())
    }

    /// Flush the pending batch as one log entry and release the handle.
    /// Idempotent. On append failure the batch stays pending for a later
    /// reconnect, but the handle is still closed.
    pub fn disconnect(&mut self) -> Result<(), BridgeError> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        let result = match &self.pending {
            None => Ok(()),
            Some(batch) => {
                let first = handle.append(batch);
                let appended = match first {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        log::warn!("append failed for {} ({e}), retrying once", self.doc_id);
                        handle.append(batch)
                    }
                };
                match appended {
                    Ok(()) => {
                        log::debug!(
                            "flushed {} byte batch to log {}",
                            batch.len(),
                            self.doc_id
                        );
                        self.pending = None;
                        Ok(())
                    }
                    Err(e) => {
                        log::error!("append retry failed for {}: {e}", self.doc_id);
                        Err(BridgeError::Store(e))
                    }
                }
            }
        };

        // The handle is released whether or not the flush succeeded.
        if let Err(e) = handle.close() {
            log::warn!("closing log handle for {} failed: {e}", self.doc_id);
        }
        result
    }

    /// Re-attach to the log after a failed disconnect, without reloading
    /// history (the document already has it). The still-pending batch is
    /// flushed on the next disconnect.
    pub fn reconnect(&mut self, store: &dyn DurableLog) -> Result<(), BridgeError> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.handle = Some(store.open(&self.doc_id)?);
        Ok(())
    }
}

impl Drop for BackendBridge {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.disconnect() {
                log::warn!("bridge drop flush failed for {}: {e}", self.doc_id);
            }
        }
    }
}
