//! Ephemeral in-memory log store, used by tests and by processes that do
//! not want durability. Clones share one underlying map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{DocDirectory, DurableLog, LogHandle, StoreError};
use crate::doc::merge_update_batch;
use crate::protocol::DocumentId;

#[derive(Default)]
struct Shared {
    logs: HashMap<DocumentId, Vec<Vec<u8>>>,
    directory: Vec<DocumentId>,
    /// When non-zero, the next N appends fail with a database error.
    fail_appends: u32,
}

/// In-memory [`DurableLog`] implementation.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the next `n` appends fail, for retry-path tests.
    pub fn fail_next_appends(&self, n: u32) {
        self.lock().fail_appends = n;
    }

    /// Number of entries appended to a document's log.
    pub fn entry_count(&self, doc: &DocumentId) -> usize {
        self.lock().logs.get(doc).map(|v| v.len()).unwrap_or(0)
    }

    /// Raw entries in append order.
    pub fn entries(&self, doc: &DocumentId) -> Vec<Vec<u8>> {
        self.lock().logs.get(doc).cloned().unwrap_or_default()
    }
}

impl DocDirectory for MemoryLogStore {
    fn save_directory(&self, docs: &[DocumentId]) -> Result<(), StoreError> {
        self.lock().directory = docs.to_vec();
        Ok(())
    }

    fn load_directory(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.lock().directory.clone())
    }
}

impl DurableLog for MemoryLogStore {
    fn open(&self, doc: &DocumentId) -> Result<Box<dyn LogHandle>, StoreError> {
        Ok(Box::new(MemoryLogHandle {
            store: self.clone(),
            doc: doc.clone(),
            open: true,
        }))
    }
}

struct MemoryLogHandle {
    store: MemoryLogStore,
    doc: DocumentId,
    open: bool,
}

impl MemoryLogHandle {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::HandleClosed)
        }
    }
}

impl LogHandle for MemoryLogHandle {
    fn doc_id(&self) -> &DocumentId {
        &self.doc
    }

    fn load(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let entries = self.store.entries(&self.doc);
        if entries.is_empty() {
            return Ok(None);
        }
        let merged = merge_update_batch(&entries)
            .map_err(|e| StoreError::CorruptEntry(e.to_string()))?;
        Ok(Some(merged))
    }

    fn append(&mut self, update: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut shared = self.store.lock();
        if shared.fail_appends > 0 {
            shared.fail_appends -= 1;
            return Err(StoreError::DatabaseError("injected append failure".into()));
        }
        shared
            .logs
            .entry(self.doc.clone())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::SharedDoc;
    use yrs::{Text, Transact, WriteTxn};

    fn doc_update(content: &str) -> Vec<u8> {
        let shared = SharedDoc::new();
        {
            let mut txn = shared.doc().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        shared.encode_full()
    }

    #[test]
    fn test_append_load_roundtrip() {
        let store = MemoryLogStore::new();
        let doc = DocumentId::new("/log/m");
        let mut handle = store.open(&doc).unwrap();

        assert!(handle.load().unwrap().is_none());
        handle.append(&doc_update("a")).unwrap();
        handle.append(&doc_update("b")).unwrap();
        assert!(handle.load().unwrap().is_some());
        assert_eq!(store.entry_count(&doc), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemoryLogStore::new();
        let clone = store.clone();
        let doc = DocumentId::new("/log/shared");

        let mut handle = store.open(&doc).unwrap();
        handle.append(&doc_update("x")).unwrap();
        assert_eq!(clone.entry_count(&doc), 1);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let store = MemoryLogStore::new();
        let doc = DocumentId::new("/log/fail");
        let mut handle = store.open(&doc).unwrap();

        store.fail_next_appends(1);
        assert!(handle.append(&doc_update("x")).is_err());
        handle.append(&doc_update("x")).unwrap();
        assert_eq!(store.entry_count(&doc), 1);
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let store = MemoryLogStore::new();
        let mut handle = store.open(&DocumentId::new("/log/c")).unwrap();
        handle.close().unwrap();
        handle.close().unwrap();
        assert!(matches!(handle.load(), Err(StoreError::HandleClosed)));
    }
}
