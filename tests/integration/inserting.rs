use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use cairn_core::codec::InsertTarget;
use cairn_core::config::{EngineConfig, InsertContext};
use cairn_core::{
    KeyDescriptor, MemoryBuffer, SskKeypair, TransferError, TransportFailure, MAX_BLOCK_PAYLOAD,
};
use cairn_engine::{InsertOperation, MemoryScheduler, Operation};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Insert — the route-not-found heuristic, collisions, and cancellation
// ══════════════════════════════════════════════════════════════════════════════

fn ctx(max_retries: i32, rnf_threshold: u32) -> InsertContext {
    InsertContext {
        max_retries,
        cooldown_period: 5,
        consecutive_rnf_as_success: rnf_threshold,
    }
}

/// Three consecutive route-not-found answers hit the threshold and the
/// insert reports success without spending any retries, even though the
/// block never actually landed anywhere.
#[tokio::test]
async fn test_route_not_found_streak_counts_as_placed() {
    let network = MemoryNetwork::new();
    network.inject(&[
        TransportFailure::RouteNotFound,
        TransportFailure::RouteNotFound,
        TransportFailure::RouteReallyNotFound,
    ]);
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let data = Bytes::from_static(b"assumed to have landed");
    let op = InsertOperation::new(
        Arc::new(MemoryBuffer::new(data.clone())),
        InsertTarget::ContentHash,
        false,
        None,
        data.len() as u32,
        ctx(10, 3),
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("insert settled");

    let uri = {
        let events = handler.events.lock().unwrap();
        match events.as_slice() {
            [NetEvent::Encoded(key), NetEvent::Inserted(uri)] => {
                assert_eq!(&key.uri(), uri);
                uri.clone()
            }
            other => panic!("expected encode then success, got {other:?}"),
        }
    };
    assert_eq!(op.retry_count(), 0, "the streak spent no retries");
    assert_eq!(network.insert_calls.load(Ordering::SeqCst), 3);
    let key = KeyDescriptor::from_uri(&uri).expect("insert produced a valid URI");
    assert!(
        !network.contains(key.routing_key()),
        "the heuristic reports success without the block landing"
    );
    sched.shutdown().await;
}

/// Any non-route failure resets the streak and is charged against the
/// budget as usual; the insert then completes honestly.
#[tokio::test]
async fn test_other_failures_reset_the_streak() {
    let network = MemoryNetwork::new();
    network.inject(&[
        TransportFailure::RouteNotFound,
        TransportFailure::Overload,
        TransportFailure::RouteNotFound,
        TransportFailure::RouteNotFound,
    ]);
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let data = Bytes::from_static(b"eventually stored for real");
    let op = InsertOperation::new(
        Arc::new(MemoryBuffer::new(data.clone())),
        InsertTarget::ContentHash,
        false,
        None,
        data.len() as u32,
        ctx(10, 3),
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("insert settled");

    let uri = {
        let events = handler.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Inserted(uri)) => uri.clone(),
            other => panic!("expected an inserted URI, got {other:?}"),
        }
    };
    // the overload reset the streak, so the two trailing route-not-founds
    // stayed below the threshold and the fifth attempt stored the block
    assert_eq!(op.retry_count(), 1, "only the overload spent a retry");
    assert_eq!(network.insert_calls.load(Ordering::SeqCst), 5);
    let key = KeyDescriptor::from_uri(&uri).expect("insert produced a valid URI");
    assert!(network.contains(key.routing_key()));
    sched.shutdown().await;
}

/// Writing different data into a subspace slot that already holds a block
/// is a collision, and collisions end the insert on the spot.
#[tokio::test]
async fn test_subspace_collision_is_fatal() {
    let network = MemoryNetwork::new();
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let keypair = SskKeypair::generate();
    let private = keypair.private_bytes();

    let first_events = CollectingHandler::new();
    let first_data = Bytes::from_static(b"version one");
    let first = InsertOperation::new(
        Arc::new(MemoryBuffer::new(first_data.clone())),
        InsertTarget::SignedSubspace(keypair),
        false,
        None,
        first_data.len() as u32,
        ctx(10, 0),
        first_events.clone(),
    );
    first.start(sched.as_ref());
    wait_for_terminals(&first_events, 1)
        .await
        .expect("first insert settled");
    let subspace_uri = {
        let events = first_events.events.lock().unwrap();
        match events.last() {
            Some(NetEvent::Inserted(uri)) => uri.clone(),
            other => panic!("expected an inserted URI, got {other:?}"),
        }
    };

    // same subspace, different payload
    let second_events = CollectingHandler::new();
    let second_data = Bytes::from_static(b"version two");
    let second_buffer = Arc::new(MemoryBuffer::new(second_data.clone()));
    let releases = second_buffer.release_counter();
    let second = InsertOperation::new(
        second_buffer,
        InsertTarget::SignedSubspace(SskKeypair::from_private(*private)),
        false,
        None,
        second_data.len() as u32,
        ctx(10, 0),
        second_events.clone(),
    );
    second.start(sched.as_ref());
    wait_for_terminals(&second_events, 1)
        .await
        .expect("second insert settled");

    {
        let events = second_events.events.lock().unwrap();
        match events.as_slice() {
            [NetEvent::Encoded(key), NetEvent::Failed(TransferError::Collision)] => {
                assert_eq!(key.uri(), subspace_uri, "same subspace, same URI");
            }
            other => panic!("expected a fatal collision, got {other:?}"),
        }
    }
    assert_eq!(network.insert_calls.load(Ordering::SeqCst), 2);
    assert_eq!(releases.load(Ordering::SeqCst), 1, "buffer released once");
    sched.shutdown().await;
}

/// Cancelling an insert that is parked on the cooldown queue delivers one
/// cancellation and releases the source buffer exactly once.
#[tokio::test]
async fn test_cancel_while_parked_releases_the_buffer() {
    let network = MemoryNetwork::new();
    network.inject(&[TransportFailure::Overload]);
    // default cooldowns are long; the op stays parked until we cancel it
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let data = Bytes::from_static(b"never finishes");
    let buffer = Arc::new(MemoryBuffer::new(data.clone()));
    let releases = buffer.release_counter();
    let op = InsertOperation::new(
        buffer,
        InsertTarget::ContentHash,
        false,
        None,
        data.len() as u32,
        InsertContext {
            max_retries: 10,
            cooldown_period: 1,
            consecutive_rnf_as_success: 0,
        },
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_until(|| op.cooldown_until().is_some())
        .await
        .expect("insert parked on the cooldown queue");

    op.cancel(sched.as_ref());
    {
        let events = handler.events.lock().unwrap();
        assert!(
            matches!(
                events.last(),
                Some(NetEvent::Failed(TransferError::Cancelled))
            ),
            "expected a cancellation, got {:?}",
            events.last()
        );
    }
    assert_eq!(handler.terminal_count(), 1);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(network.insert_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sched.pending_len(), 0, "the scheduler forgot the insert");
    sched.shutdown().await;
}

/// A source that cannot fit in one block fails during encode, before the
/// network sees anything.
#[tokio::test]
async fn test_oversized_source_fails_before_the_network() {
    let network = MemoryNetwork::new();
    let sched = MemoryScheduler::new(network.clone(), &EngineConfig::default());

    let handler = CollectingHandler::new();
    let data = Bytes::from(vec![0u8; MAX_BLOCK_PAYLOAD + 1]);
    let buffer = Arc::new(MemoryBuffer::new(data.clone()));
    let releases = buffer.release_counter();
    let op = InsertOperation::new(
        buffer,
        InsertTarget::ContentHash,
        false,
        None,
        data.len() as u32,
        InsertContext::from(&EngineConfig::default()),
        handler.clone(),
    );
    op.start(sched.as_ref());
    wait_for_terminals(&handler, 1).await.expect("insert settled");

    {
        let events = handler.events.lock().unwrap();
        assert!(
            matches!(events.last(), Some(NetEvent::Failed(TransferError::Encode(_)))),
            "expected an encode failure, got {:?}",
            events.last()
        );
    }
    assert_eq!(
        network.insert_calls.load(Ordering::SeqCst),
        0,
        "nothing reached the transport"
    );
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    sched.shutdown().await;
}
