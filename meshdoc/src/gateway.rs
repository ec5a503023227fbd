//! Document activation: which logs are open, and when.
//!
//! A process rarely wants every known document's log open at once. The
//! gateway tracks the known set (persisted through the store directory so
//! it survives restarts), opens a log on demand, and listens on a global
//! wake topic so a remote peer wanting to exchange history can get a
//! closed log opened. Losing a wake frame only delays the exchange; the
//! next wake or an explicit open repairs it.
//!
//! Canonical document ids take the form `/log/<uuid>/<name>`. Registering
//! an already-canonical id passes it through unchanged, so two processes
//! given the same id land on the same log.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{self, DocumentId, ProtocolError, Reader};
use crate::signaling::SignalingTransport;
use crate::storage::{DocDirectory, DurableLog, LogHandle, StoreError};

/// Global signaling topic carrying wake frames for all documents.
pub const WAKE_TOPIC: &str = "meshdoc/wake";

const CANONICAL_PREFIX: &str = "/log/";

/// Gateway failures.
#[derive(Debug)]
pub enum GatewayError {
    Store(StoreError),
    /// The document was never registered here
    UnknownDocument(DocumentId),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Store(e) => write!(f, "Store error: {e}"),
            GatewayError::UnknownDocument(id) => write!(f, "Unknown document: {id}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Store(e)
    }
}

/// Encode a wake frame naming one document.
pub fn encode_wake(doc: &DocumentId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(doc.as_str().len() + 2);
    protocol::write_var_string(&mut buf, doc.as_str());
    buf
}

/// Decode a wake frame.
pub fn decode_wake(bytes: &[u8]) -> Result<DocumentId, ProtocolError> {
    let mut r = Reader::new(bytes);
    Ok(DocumentId::new(r.read_var_string()?))
}

/// Ask every listening process to open this document's log.
pub fn announce_wake(transport: &dyn SignalingTransport, doc: &DocumentId) {
    transport.publish(WAKE_TOPIC, encode_wake(doc));
}

struct OpenLog {
    handle: Box<dyn LogHandle>,
}

/// Tracks known documents and their log activation state.
pub struct DocActivationGateway<S> {
    store: S,
    known: Vec<DocumentId>,
    open: std::collections::HashMap<DocumentId, OpenLog>,
}

impl<S: DurableLog + DocDirectory> DocActivationGateway<S> {
    /// Load the known-document set persisted by previous runs.
    pub fn new(store: S) -> Result<Self, GatewayError> {
        let known = store.load_directory()?;
        log::info!("activation gateway loaded {} known documents", known.len());
        Ok(Self {
            store,
            known,
            open: std::collections::HashMap::new(),
        })
    }

    /// Register a document by name or canonical id. Canonical ids pass
    /// through unchanged; plain names get a fresh canonical id derived for
    /// them. The known set is persisted on every change.
    pub fn register(&mut self, name: &str) -> Result<DocumentId, GatewayError> {
        let id = if name.starts_with(CANONICAL_PREFIX) {
            DocumentId::new(name)
        } else {
            DocumentId::new(format!("{CANONICAL_PREFIX}{}/{name}", Uuid::new_v4()))
        };
        if !self.known.contains(&id) {
            self.known.push(id.clone());
            self.store.save_directory(&self.known)?;
            log::debug!("registered document {id}");
        }
        Ok(id)
    }

    /// Every registered document id, in registration order.
    pub fn list(&self) -> &[DocumentId] {
        &self.known
    }

    pub fn is_known(&self, doc: &DocumentId) -> bool {
        self.known.contains(doc)
    }

    pub fn is_open(&self, doc: &DocumentId) -> bool {
        self.open.contains_key(doc)
    }

    /// Open a known document's log. A second open of the same document is
    /// a no-op; there is never more than one handle per document.
    pub fn open(&mut self, doc: &DocumentId) -> Result<(), GatewayError> {
        if !self.is_known(doc) {
            return Err(GatewayError::UnknownDocument(doc.clone()));
        }
        if self.open.contains_key(doc) {
            return Ok(());
        }
        let handle = self.store.open(doc)?;
        self.open.insert(doc.clone(), OpenLog { handle });
        log::debug!("opened log for {doc}");
        Ok(())
    }

    /// The open handle for a document, if any.
    pub fn handle(&mut self, doc: &DocumentId) -> Option<&mut (dyn LogHandle + 'static)> {
        self.open.get_mut(doc).map(|o| o.handle.as_mut())
    }

    /// Close a document's log. Idempotent; closing an unopened document
    /// does nothing.
    pub fn close(&mut self, doc: &DocumentId) -> Result<(), GatewayError> {
        if let Some(mut open) = self.open.remove(doc) {
            open.handle.close()?;
            log::debug!("closed log for {doc}");
        }
        Ok(())
    }

    /// React to one wake frame: a known-but-closed document gets its log
    /// opened; unknown documents are ignored.
    pub fn handle_wake(&mut self, frame: &[u8]) -> Result<(), GatewayError> {
        let doc = match decode_wake(frame) {
            Ok(doc) => doc,
            Err(e) => {
                log::debug!("dropping malformed wake frame: {e}");
                return Ok(());
            }
        };
        if !self.is_known(&doc) {
            log::debug!("ignoring wake for unknown document {doc}");
            return Ok(());
        }
        self.open(&doc)
    }

    /// The history exchange that a wake triggered has finished; put the
    /// log back to sleep.
    pub fn exchange_complete(&mut self, doc: &DocumentId) -> Result<(), GatewayError> {
        self.close(doc)
    }
}

/// Listen on the wake topic and route frames into the gateway until the
/// transport goes away.
pub fn spawn_wake_listener<S>(
    gateway: Arc<Mutex<DocActivationGateway<S>>>,
    transport: Arc<dyn SignalingTransport>,
) -> tokio::task::JoinHandle<()>
where
    S: DurableLog + DocDirectory + Send + 'static,
{
    let mut rx = transport.subscribe(WAKE_TOPIC);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    let mut gateway = match gateway.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Err(e) = gateway.handle_wake(&frame) {
                        log::warn!("wake handling failed: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("wake listener lagged, skipped {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
