//! Durable append-only update log.
//!
//! The log is an external collaborator of the sync core: documents are
//! reconstructed by merging every appended update blob, so peers do not
//! have to be online at the same time. The core consumes it through the
//! narrow `open/load/append/close` capability below; [`rocks`] provides
//! the RocksDB-backed implementation, [`memory`] an ephemeral one.
//!
//! Lifecycle per handle: closed → opening → open → closed. At most one
//! open handle per document per process (the activation gateway enforces
//! this).

pub mod memory;
pub mod rocks;

pub use memory::MemoryLogStore;
pub use rocks::{EventLogStore, StoreConfig};

use crate::protocol::DocumentId;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend (RocksDB) internal error
    DatabaseError(String),
    /// No log exists for this document
    NotFound(DocumentId),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Stored blob could not be merged
    CorruptEntry(String),
    /// Operation on a handle that was already closed
    HandleClosed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Log not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::CorruptEntry(e) => write!(f, "Corrupt log entry: {e}"),
            StoreError::HandleClosed => write!(f, "Log handle already closed"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Opens per-document append-only logs.
pub trait DurableLog: Send + Sync {
    /// Open (or create) the log for one document. Failures here prevent
    /// document activation and surface to the caller.
    fn open(&self, doc: &DocumentId) -> Result<Box<dyn LogHandle>, StoreError>;
}

/// Persists the set of known document ids across restarts.
pub trait DocDirectory: Send + Sync {
    fn save_directory(&self, docs: &[DocumentId]) -> Result<(), StoreError>;
    /// Known-document set from a previous run (empty if none persisted).
    fn load_directory(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// One open connection to a document's log.
pub trait LogHandle: Send {
    fn doc_id(&self) -> &DocumentId;

    /// Full historical merge of every appended update, or `None` when the
    /// log is empty (an empty log never yields an empty blob).
    fn load(&mut self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Append one update blob as a new log entry.
    fn append(&mut self, update: &[u8]) -> Result<(), StoreError>;

    /// Release the handle. Idempotent; later load/append fail with
    /// [`StoreError::HandleClosed`].
    fn close(&mut self) -> Result<(), StoreError>;
}
