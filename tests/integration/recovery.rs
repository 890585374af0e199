use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use cairn_core::codec::InsertTarget;
use cairn_core::config::{EngineConfig, FetchContext, InsertContext};
use cairn_core::{KeyDescriptor, MemoryBuffer, TransportFailure};
use cairn_engine::{
    DynDurableStore, FetchOperation, FileStore, InsertOperation, MemoryScheduler, Operation,
    OperationKind, PersistedRequest,
};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Recovery — snapshots on disk and resuming after a restart
// ══════════════════════════════════════════════════════════════════════════════

fn insert_ctx() -> InsertContext {
    // period 1: every retry parks on the cooldown queue, which is where a
    // crash leaves the most state behind
    InsertContext {
        max_retries: 10,
        cooldown_period: 1,
        consecutive_rnf_as_success: 0,
    }
}

fn fetch_ctx() -> FetchContext {
    FetchContext {
        max_retries: 10,
        cooldown_period: 1,
    }
}

/// A persistent insert keeps its snapshot current through encode, failure,
/// and cooldown, and discards it on cancel.
#[tokio::test]
async fn test_snapshot_follows_the_operation_lifecycle() {
    let dir = scratch_dir("lifecycle");
    let store: DynDurableStore = Arc::new(FileStore::open(dir.clone()).expect("store opens"));
    let network = MemoryNetwork::new();
    network.inject(&[TransportFailure::Overload]);
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let data = Bytes::from_static(b"durable insert");
    let buffer = Arc::new(MemoryBuffer::new(data.clone()));
    let releases = buffer.release_counter();
    let op = InsertOperation::persistent(
        buffer,
        InsertTarget::ContentHash,
        false,
        None,
        data.len() as u32,
        insert_ctx(),
        handler.clone(),
        store.clone(),
    );
    op.start(sched.as_ref());

    // the failed attempt parks the key and commits the updated snapshot
    let path = dir.join(format!("{}.json", op.id()));
    wait_until(|| {
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PersistedRequest>(&raw).ok())
            .is_some_and(|snap| snap.retry_count == 1)
    })
    .await
    .expect("cooldown snapshot committed");

    let raw = std::fs::read_to_string(&path).expect("snapshot on disk");
    let snap: PersistedRequest = serde_json::from_str(&raw).expect("snapshot parses");
    assert_eq!(snap.kind, OperationKind::Insert);
    assert_eq!(snap.retry_count, 1);
    assert!(snap.uri.is_some(), "encoded inserts persist their URI");
    assert!(snap.cooldown_until.is_some(), "parked inserts persist the deadline");
    assert!(snap.buffer_owned);

    op.cancel(sched.as_ref());
    assert!(!path.exists(), "cancel discards the snapshot");
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    sched.shutdown().await;
    std::fs::remove_dir_all(&dir).ok();
}

/// Kill the scheduler while a fetch is parked mid-cooldown, then bring the
/// engine back up: the snapshot resumes with its retry progress intact and
/// completes once a peer finally has the block.
#[tokio::test]
async fn test_fetch_resumes_after_a_restart() {
    let dir = scratch_dir("fetch-restart");
    let network = MemoryNetwork::new();
    let block = chk_fixture(b"come back for it");

    // phase 1: nobody has the block; the first attempt parks the fetch
    {
        let store: DynDurableStore =
            Arc::new(FileStore::open(dir.clone()).expect("store opens"));
        let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());
        let handler = CollectingHandler::new();
        let op = FetchOperation::persistent(
            block.descriptor().clone(),
            fetch_ctx(),
            handler.clone(),
            store.clone(),
        );
        op.start(sched.as_ref());
        wait_until(|| op.cooldown_until().is_some())
            .await
            .expect("fetch parked on the cooldown queue");
        assert_eq!(handler.terminal_count(), 0);
        sched.shutdown().await;
    }
    println!("went down with one fetch parked");

    // phase 2: restart; a peer now holds the block
    network.preload(&block);
    let store: DynDurableStore = Arc::new(FileStore::open(dir.clone()).expect("store reopens"));
    let snapshots = store.load_all().expect("snapshots load");
    assert_eq!(snapshots.len(), 1);
    let snap = &snapshots[0];
    assert_eq!(snap.kind, OperationKind::Fetch);
    assert_eq!(snap.retry_count, 1);

    let sched = MemoryScheduler::new(network.clone(), &fast_config());
    let handler = CollectingHandler::new();
    let op = FetchOperation::resume(snap, fetch_ctx(), handler.clone(), store.clone())
        .expect("snapshot resumes");
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1)
        .await
        .expect("resumed fetch settled");

    {
        let events = handler.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Fetched(found)) => assert_eq!(found.payload(), block.payload()),
            other => panic!("expected the fetched block, got {other:?}"),
        }
    }
    assert_eq!(op.retry_count(), 1, "retry progress survived the restart");
    assert!(
        !dir.join(format!("{}.json", op.id())).exists(),
        "a finished fetch clears its snapshot"
    );
    sched.shutdown().await;
    std::fs::remove_dir_all(&dir).ok();
}

/// An insert resumed after a restart re-encodes the re-supplied source and
/// lands under the URI recorded before the crash.
#[tokio::test]
async fn test_insert_resumes_and_lands_under_the_original_uri() {
    let dir = scratch_dir("insert-restart");
    let network = MemoryNetwork::new();
    let data = Bytes::from_static(b"persisted across restarts");

    // phase 1: the attempt overloads and the insert parks
    {
        let store: DynDurableStore =
            Arc::new(FileStore::open(dir.clone()).expect("store opens"));
        network.inject(&[TransportFailure::Overload]);
        let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());
        let handler = CollectingHandler::new();
        let op = InsertOperation::persistent(
            Arc::new(MemoryBuffer::new(data.clone())),
            InsertTarget::ContentHash,
            false,
            None,
            data.len() as u32,
            insert_ctx(),
            handler.clone(),
            store.clone(),
        );
        op.start(sched.as_ref());
        wait_until(|| op.cooldown_until().is_some())
            .await
            .expect("insert parked on the cooldown queue");
        sched.shutdown().await;
    }
    println!("went down with one insert parked");

    // phase 2: restart with the same source data
    let store: DynDurableStore = Arc::new(FileStore::open(dir.clone()).expect("store reopens"));
    let snapshots = store.load_all().expect("snapshots load");
    assert_eq!(snapshots.len(), 1);
    let snap = &snapshots[0];
    let recorded_uri = snap.uri.clone().expect("the encoded URI was persisted");
    assert!(snap.buffer_owned);

    let sched = MemoryScheduler::new(network.clone(), &fast_config());
    let handler = CollectingHandler::new();
    let op = InsertOperation::resume(
        snap,
        Arc::new(MemoryBuffer::new(data.clone())),
        InsertTarget::ContentHash,
        false,
        None,
        data.len() as u32,
        insert_ctx(),
        handler.clone(),
        store.clone(),
    )
    .expect("snapshot resumes");
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1)
        .await
        .expect("resumed insert settled");

    {
        let events = handler.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Inserted(uri)) => {
                assert_eq!(uri, &recorded_uri, "content-hash inserts land under their original URI");
            }
            other => panic!("expected an inserted URI, got {other:?}"),
        }
    }
    let key = KeyDescriptor::from_uri(&recorded_uri).expect("persisted URI parses");
    assert!(network.contains(key.routing_key()));
    assert_eq!(network.insert_calls.load(Ordering::SeqCst), 2);
    assert!(
        store.load_all().expect("store rescans").is_empty(),
        "a finished insert clears its snapshot"
    );
    sched.shutdown().await;
    std::fs::remove_dir_all(&dir).ok();
}
