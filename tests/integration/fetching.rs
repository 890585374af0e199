use std::sync::atomic::Ordering;

use bytes::Bytes;

use cairn_core::config::{EngineConfig, FetchContext};
use cairn_core::failure::FailureKind;
use cairn_core::retry::UNLIMITED_RETRIES;
use cairn_core::{TransferError, TransportFailure};
use cairn_engine::{FetchOperation, MemoryScheduler};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Fetch — retries, verification, and cooldown through the live scheduler
// ══════════════════════════════════════════════════════════════════════════════

/// A fetch with budget for two retries rides out an overload and a
/// route-not-found before the block finally arrives.
#[tokio::test]
async fn test_fetch_retries_until_the_block_appears() {
    let network = MemoryNetwork::new();
    let block = chk_fixture(b"retry until it lands");
    network.preload(&block);
    network.inject(&[TransportFailure::Overload, TransportFailure::RouteNotFound]);
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let op = FetchOperation::new(
        block.descriptor().clone(),
        FetchContext {
            max_retries: 2,
            cooldown_period: 5,
        },
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("fetch settled");

    {
        let events = handler.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Fetched(found)) => assert_eq!(found.payload(), block.payload()),
            other => panic!("expected the fetched block, got {other:?}"),
        }
    }
    assert_eq!(network.fetch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(op.retry_count(), 2, "both failures spent a retry");
    sched.shutdown().await;
}

/// When no peer ever has the block, the fetch gives up once the budget is
/// spent and hands the caller the per-kind failure breakdown.
#[tokio::test]
async fn test_exhausted_fetch_reports_the_failure_breakdown() {
    let network = MemoryNetwork::new();
    let block = chk_fixture(b"nobody holds this");
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let op = FetchOperation::new(
        block.descriptor().clone(),
        FetchContext {
            max_retries: 1,
            cooldown_period: 5,
        },
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("fetch settled");

    let events = handler.events.lock().unwrap();
    match events.last() {
        Some(NetEvent::Failed(TransferError::RetriesExhausted(tracker))) => {
            assert_eq!(tracker.count(FailureKind::RouteNotFound), 2);
            assert_eq!(tracker.total(), 2);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    drop(events);
    assert_eq!(network.fetch_calls.load(Ordering::SeqCst), 2);
    sched.shutdown().await;
}

/// A peer serving corrupt bytes is a verification failure, which is fatal
/// on first sight: no retry budget is spent chasing bad data.
#[tokio::test]
async fn test_corrupt_block_is_fatal_on_first_sight() {
    let network = MemoryNetwork::new();
    let block = chk_fixture(b"integrity matters");
    let mut wire = block.wire_bytes().to_vec();
    let last = wire.len() - 1;
    wire[last] ^= 0x01;
    network.preload_raw(*block.descriptor().routing_key(), Bytes::from(wire));
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let op = FetchOperation::new(
        block.descriptor().clone(),
        FetchContext {
            max_retries: 10,
            cooldown_period: 5,
        },
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("fetch settled");

    {
        let events = handler.events.lock().unwrap();
        assert!(
            matches!(events.last(), Some(NetEvent::Failed(TransferError::Verify(_)))),
            "expected a verification failure, got {:?}",
            events.last()
        );
    }
    assert_eq!(
        network.fetch_calls.load(Ordering::SeqCst),
        1,
        "corrupt data must not be refetched"
    );
    assert_eq!(op.retry_count(), 0);
    sched.shutdown().await;
}

/// An unlimited-budget fetch keeps going through several cooldown cycles
/// until the block shows up.
#[tokio::test]
async fn test_unlimited_retries_survive_cooldown_cycles() {
    let network = MemoryNetwork::new();
    let block = chk_fixture(b"worth waiting for");
    network.preload(&block);
    network.inject(&[TransportFailure::Overload; 5]);
    // instant cooldowns; with period 2 the retry counter crosses two
    // cooldown boundaries on the way to the block
    let sched = MemoryScheduler::new(network.clone(), &fast_config());

    let handler = CollectingHandler::new();
    let op = FetchOperation::new(
        block.descriptor().clone(),
        FetchContext {
            max_retries: UNLIMITED_RETRIES,
            cooldown_period: 2,
        },
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("fetch settled");

    {
        let events = handler.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Fetched(found)) => assert_eq!(found.payload(), block.payload()),
            other => panic!("expected the fetched block, got {other:?}"),
        }
    }
    assert_eq!(network.fetch_calls.load(Ordering::SeqCst), 6);
    assert_eq!(op.retry_count(), 5);
    sched.shutdown().await;
}

/// Two operations fetching the same key are distinct requests: the worker
/// serves them one after the other and each gets its own delivery.
#[tokio::test]
async fn test_same_key_fetches_each_complete() {
    let network = MemoryNetwork::new();
    let block = chk_fixture(b"popular block");
    network.preload(&block);
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let first_events = CollectingHandler::new();
    let first = FetchOperation::new(
        block.descriptor().clone(),
        FetchContext::from(&EngineConfig::default()),
        first_events.clone(),
    );
    let second_events = CollectingHandler::new();
    let second = FetchOperation::new(
        block.descriptor().clone(),
        FetchContext::from(&EngineConfig::default()),
        second_events.clone(),
    );

    first.start(sched.as_ref());
    second.start(sched.as_ref());
    wait_for_terminals(&first_events, 1)
        .await
        .expect("first fetch settled");
    wait_for_terminals(&second_events, 1)
        .await
        .expect("second fetch settled");

    for events in [&first_events, &second_events] {
        let events = events.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Fetched(found)) => assert_eq!(found.payload(), block.payload()),
            other => panic!("expected the fetched block, got {other:?}"),
        }
    }
    assert_eq!(network.fetch_calls.load(Ordering::SeqCst), 2);
    sched.shutdown().await;
}
