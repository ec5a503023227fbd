//! Durability tests: bridge + RocksDB-backed event log + activation
//! gateway, against real on-disk databases.

use std::sync::{Arc, Mutex};

use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

use meshdoc::{
    announce_wake, BackendBridge, DocActivationGateway, DocMesh, DocSignaling, DocumentId,
    DurableLog, EventLogStore, LocalSignalingBus, MemoryChannelFactory, MeshConfig, MeshEvent,
    PeerId, SharedDoc, SignalingTransport, StoreConfig, UpdateOrigin, spawn_wake_listener,
};

fn open_store(path: &std::path::Path) -> EventLogStore {
    EventLogStore::open(StoreConfig::for_testing(path)).unwrap()
}

fn edit(doc: &SharedDoc, at: u32, content: &str) -> Vec<u8> {
    let before = doc.state_summary();
    {
        let mut txn = doc.doc().transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, at, content);
    }
    doc.diff(&before).unwrap()
}

fn text_of(doc: &SharedDoc) -> String {
    let txn = doc.doc().transact();
    match txn.get_text("content") {
        Some(text) => text.get_string(&txn),
        None => String::new(),
    }
}

#[test]
fn test_replayed_log_equals_live_document() {
    let dir = tempdir().unwrap();
    let id = DocumentId::new("/log/replay");

    // Session one: edit while bridged, flush on disconnect.
    let live = SharedDoc::new();
    {
        let store = open_store(dir.path());
        let (mut bridge, history) = BackendBridge::connect(&store, id.clone(), &live).unwrap();
        assert!(history.is_none());

        bridge.forward_local(&edit(&live, 0, "hello")).unwrap();
        bridge.forward_local(&edit(&live, 5, " world")).unwrap();
        bridge.disconnect().unwrap();
    }

    // Session two, separate store instance: replay must equal the
    // never-closed document.
    let replayed = SharedDoc::new();
    let store = open_store(dir.path());
    let (_bridge, history) = BackendBridge::connect(&store, id, &replayed).unwrap();
    assert!(history.is_some());
    assert_eq!(text_of(&replayed), text_of(&live));
    assert_eq!(replayed.encode_full(), live.encode_full());
}

#[test]
fn test_preloaded_entries_then_one_batch_append() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let id = DocumentId::new("/log/batch");

    // Two historical entries written by earlier sessions.
    let writer = SharedDoc::new();
    let u1 = edit(&writer, 0, "u1 ");
    let u2 = edit(&writer, 3, "u2 ");
    {
        let mut handle = store.open(&id).unwrap();
        handle.append(&u1).unwrap();
        handle.append(&u2).unwrap();
    }

    // A live session produces several more updates; they land as one entry.
    let doc = SharedDoc::new();
    let (mut bridge, _) = BackendBridge::connect(&store, id.clone(), &doc).unwrap();
    assert_eq!(text_of(&doc), "u1 u2 ");

    bridge.forward_local(&edit(&doc, 6, "u3")).unwrap();
    bridge.forward_local(&edit(&doc, 8, "!")).unwrap();
    bridge.disconnect().unwrap();

    assert_eq!(store.entry_count(&id).unwrap(), 3);

    let reread = SharedDoc::new();
    let (_bridge, _) = BackendBridge::connect(&store, id, &reread).unwrap();
    assert_eq!(text_of(&reread), "u1 u2 u3!");
}

#[test]
fn test_session_without_edits_appends_nothing() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let id = DocumentId::new("/log/idle");

    let doc = SharedDoc::new();
    let (mut bridge, _) = BackendBridge::connect(&store, id.clone(), &doc).unwrap();
    bridge.disconnect().unwrap();

    assert_eq!(store.entry_count(&id).unwrap(), 0);
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    mut pred: impl FnMut(&MeshEvent) -> bool,
) -> MeshEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for mesh event")
}

#[tokio::test]
async fn test_mesh_edit_reaches_log_through_bridge() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let id = DocumentId::new("/log/meshed");

    let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());
    let hub = MemoryChannelFactory::new();

    let doc_a = Arc::new(SharedDoc::new());
    let (handle_a, mut events_a) = DocMesh::spawn(
        doc_a.clone(),
        DocSignaling::new(bus.clone(), "doc", PeerId::new("aaa")),
        Arc::new(hub.clone()),
        MeshConfig::default(),
    );
    let doc_b = Arc::new(SharedDoc::new());
    let (_handle_b, mut events_b) = DocMesh::spawn(
        doc_b.clone(),
        DocSignaling::new(bus.clone(), "doc", PeerId::new("bbb")),
        Arc::new(hub.clone()),
        MeshConfig::default(),
    );

    // Peer a holds the bridge for this document.
    let (mut bridge, history) = BackendBridge::connect(&store, id.clone(), &doc_a).unwrap();
    assert!(history.is_none());

    handle_a.announce().unwrap();
    next_event(&mut events_a, |e| matches!(e, MeshEvent::PeerSynced(_))).await;
    next_event(&mut events_b, |e| matches!(e, MeshEvent::PeerSynced(_))).await;

    handle_a
        .apply_local_update(edit(&doc_a, 0, "meshed edit"))
        .unwrap();

    // The dispatcher reports the local merge; route it into the bridge.
    let event = next_event(&mut events_a, |e| matches!(e, MeshEvent::LocalUpdate { .. })).await;
    let MeshEvent::LocalUpdate { update } = event else {
        unreachable!()
    };
    bridge.forward(&UpdateOrigin::Local, &update).unwrap();

    // The same edit also fanned out across the mesh.
    next_event(&mut events_b, |e| matches!(e, MeshEvent::RemoteUpdate { .. })).await;

    bridge.disconnect().unwrap();
    assert_eq!(store.entry_count(&id).unwrap(), 1);

    let replayed = SharedDoc::new();
    let (_bridge, history) = BackendBridge::connect(&store, id, &replayed).unwrap();
    assert!(history.is_some());
    assert_eq!(text_of(&replayed), "meshed edit");
}

#[test]
fn test_directory_survives_store_reopen() {
    let dir = tempdir().unwrap();
    let id;
    {
        let store = open_store(dir.path());
        let mut gateway = DocActivationGateway::new(store).unwrap();
        id = gateway.register("journal").unwrap();
        gateway.register("/log/fixed/shared").unwrap();
    }

    let store = open_store(dir.path());
    let gateway = DocActivationGateway::new(store).unwrap();
    assert_eq!(gateway.list().len(), 2);
    assert!(gateway.is_known(&id));
    assert!(gateway.is_known(&DocumentId::new("/log/fixed/shared")));
}

#[tokio::test]
async fn test_wake_opens_log_and_exchange_complete_closes_it() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let bus: Arc<dyn SignalingTransport> = Arc::new(LocalSignalingBus::default());

    let mut gw = DocActivationGateway::new(store).unwrap();
    let id = gw.register("wakeable").unwrap();
    let gateway = Arc::new(Mutex::new(gw));

    let task = spawn_wake_listener(gateway.clone(), bus.clone());
    sleep(Duration::from_millis(10)).await;

    announce_wake(bus.as_ref(), &id);
    sleep(Duration::from_millis(50)).await;
    assert!(gateway.lock().unwrap().is_open(&id));

    // History exchange done; the log goes back to sleep.
    gateway.lock().unwrap().exchange_complete(&id).unwrap();
    assert!(!gateway.lock().unwrap().is_open(&id));
    task.abort();
}

#[test]
fn test_gateway_handle_reads_and_writes_log() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut gateway = DocActivationGateway::new(store.clone()).unwrap();
    let id = gateway.register("through-gateway").unwrap();

    gateway.open(&id).unwrap();
    let writer = SharedDoc::new();
    let update = edit(&writer, 0, "via handle");
    {
        let handle = gateway.handle(&id).unwrap();
        assert!(handle.load().unwrap().is_none());
        handle.append(&update).unwrap();
    }
    gateway.close(&id).unwrap();

    assert_eq!(store.entry_count(&id).unwrap(), 1);
}
