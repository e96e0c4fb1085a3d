//! Integration tests for the event processor runtime
//!
//! These tests drive a full processor (coordinator, lease manager, pumps)
//! over the in-memory store and source, verifying delivery ordering,
//! checkpoint resume, fault containment and shutdown behavior end to end.

mod common;

use capstan::{
    CheckpointStore, CloseReason, EventProcessor, InMemoryCheckpointStore, InMemorySource,
    Operation, PartitionId,
};
use common::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Events appended across several partitions all reach the batch
/// callback, in order within each partition.
#[tokio::test]
async fn test_delivers_events_across_partitions() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemorySource::with_partition_count(3));
    for i in 0..5 {
        for partition in ["0", "1", "2"] {
            source
                .append(partition, format!("{partition}-{i}"))
                .unwrap();
        }
    }

    let log = DeliveryLog::new();
    let sink = log.clone();
    let processor =
        EventProcessor::builder(fast_config("orders", "proc-a"), store, source.clone())
            .on_batch(move |_ctx, batch| {
                let sink = sink.clone();
                async move {
                    sink.record(&batch);
                    Ok(())
                }
            })
            .build()
            .unwrap();

    processor.start().await.unwrap();
    wait_until("all 15 events delivered", || log.event_count() == 15).await;
    processor.stop().await.unwrap();

    // per-partition order survives batching
    for partition in ["0", "1", "2"] {
        let expected: Vec<String> = (0..5).map(|i| format!("{partition}-{i}")).collect();
        assert_eq!(log.bodies_for(&PartitionId::new(partition)), expected);
    }
}

/// A restarted processor resumes strictly after the stored checkpoint
/// instead of redelivering what was already processed.
#[tokio::test]
async fn test_resumes_from_checkpoint_after_restart() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemorySource::with_partition_count(1));
    for i in 0..5 {
        source.append("0", format!("first-{i}")).unwrap();
    }

    // first run processes the initial five events
    let log = DeliveryLog::new();
    let sink = log.clone();
    let processor = EventProcessor::builder(
        fast_config("orders", "proc-a"),
        store.clone(),
        source.clone(),
    )
    .on_batch(move |_ctx, batch| {
        let sink = sink.clone();
        async move {
            sink.record(&batch);
            Ok(())
        }
    })
    .build()
    .unwrap();
    processor.start().await.unwrap();
    wait_until("first five delivered", || log.event_count() == 5).await;
    processor.stop().await.unwrap();

    let checkpoint = store
        .read_checkpoint("orders", &PartitionId::new("0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.sequence_number, 4);

    for i in 5..8 {
        source.append("0", format!("second-{i}")).unwrap();
    }

    // second run, same group, only sees what came after the checkpoint
    let log = DeliveryLog::new();
    let sink = log.clone();
    let processor = EventProcessor::builder(
        fast_config("orders", "proc-b"),
        store.clone(),
        source.clone(),
    )
    .on_batch(move |_ctx, batch| {
        let sink = sink.clone();
        async move {
            sink.record(&batch);
            Ok(())
        }
    })
    .build()
    .unwrap();
    processor.start().await.unwrap();
    wait_until("remaining three delivered", || log.event_count() >= 3).await;
    processor.stop().await.unwrap();

    assert_eq!(
        log.bodies_for(&PartitionId::new("0")),
        vec!["second-5", "second-6", "second-7"]
    );
}

/// A partition whose fetches keep failing faults its pump and comes back
/// on a later refresh cycle, without disturbing the healthy partition.
#[tokio::test]
async fn test_faulted_partition_recovers_without_disturbing_others() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let inner = Arc::new(InMemorySource::with_partition_count(2));
    inner.append("0", "healthy").unwrap();
    inner.append("1", "eventually").unwrap();
    // four failures outlast one retry budget of three attempts, so the
    // first pump faults and its replacement succeeds
    let source = FlakySource::failing_fetches(inner.clone(), "1", 4);

    let log = DeliveryLog::new();
    let errors = ErrorLog::new();
    let sink = log.clone();
    let error_sink = errors.clone();
    let processor = EventProcessor::builder(fast_config("orders", "proc-a"), store, source)
        .on_batch(move |_ctx, batch| {
            let sink = sink.clone();
            async move {
                sink.record(&batch);
                Ok(())
            }
        })
        .on_error(move |error| {
            let errors = error_sink.clone();
            async move { errors.record(&error) }
        })
        .build()
        .unwrap();

    processor.start().await.unwrap();
    wait_until("healthy partition delivered", || {
        !log.bodies_for(&PartitionId::new("0")).is_empty()
    })
    .await;
    wait_until("faulted partition recovered", || {
        !log.bodies_for(&PartitionId::new("1")).is_empty()
    })
    .await;
    processor.stop().await.unwrap();

    // every failed attempt was surfaced with partition context
    assert!(errors.count_for(Operation::Fetch) >= 4);
    assert_eq!(
        log.bodies_for(&PartitionId::new("1")),
        vec!["eventually"]
    );
    assert_eq!(log.bodies_for(&PartitionId::new("0")), vec!["healthy"]);
}

/// A panicking batch callback is contained: the batch is redelivered and
/// other partitions never notice.
#[tokio::test]
async fn test_panicking_handler_is_contained_and_redelivered() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemorySource::with_partition_count(2));
    source.append("0", "p0-a").unwrap();
    source.append("1", "p1-a").unwrap();

    let log = DeliveryLog::new();
    let errors = ErrorLog::new();
    let panicked = Arc::new(AtomicBool::new(false));
    let sink = log.clone();
    let error_sink = errors.clone();
    let trigger = panicked.clone();
    let processor =
        EventProcessor::builder(fast_config("orders", "proc-a"), store, source.clone())
            .on_batch(move |ctx, batch| {
                let sink = sink.clone();
                let trigger = trigger.clone();
                async move {
                    if ctx.partition_id.as_str() == "1"
                        && !batch.is_empty()
                        && !trigger.swap(true, Ordering::SeqCst)
                    {
                        panic!("handler exploded");
                    }
                    sink.record(&batch);
                    Ok(())
                }
            })
            .on_error(move |error| {
                let errors = error_sink.clone();
                async move { errors.record(&error) }
            })
            .build()
            .unwrap();

    processor.start().await.unwrap();
    wait_until("panicked batch redelivered", || {
        log.bodies_for(&PartitionId::new("1")) == vec!["p1-a"]
    })
    .await;
    wait_until("healthy partition delivered", || {
        log.bodies_for(&PartitionId::new("0")) == vec!["p0-a"]
    })
    .await;
    processor.stop().await.unwrap();

    assert!(errors.count_for(Operation::Deliver) >= 1);
    assert!(panicked.load(Ordering::SeqCst));
}

/// Failed checkpoint writes are reported but never rewind or stall
/// delivery; the next successful write catches the stored position up.
#[tokio::test]
async fn test_checkpoint_write_failure_does_not_stall_delivery() {
    let store = FlakyCheckpointStore::failing_writes(2);
    let source = Arc::new(InMemorySource::with_partition_count(1));
    for body in ["a", "b", "c"] {
        source.append("0", body).unwrap();
    }

    let log = DeliveryLog::new();
    let errors = ErrorLog::new();
    let sink = log.clone();
    let error_sink = errors.clone();
    let processor =
        EventProcessor::builder(fast_config("orders", "proc-a"), store.clone(), source.clone())
            .on_batch(move |_ctx, batch| {
                let sink = sink.clone();
                async move {
                    sink.record(&batch);
                    Ok(())
                }
            })
            .on_error(move |error| {
                let errors = error_sink.clone();
                async move { errors.record(&error) }
            })
            .build()
            .unwrap();

    processor.start().await.unwrap();
    wait_until("first three delivered", || log.event_count() == 3).await;
    source.append("0", "d").unwrap();
    wait_until("fourth delivered", || log.event_count() == 4).await;
    source.append("0", "e").unwrap();
    wait_until("fifth delivered", || log.event_count() == 5).await;
    processor.stop().await.unwrap();

    // no rewind: every event exactly once despite the failed writes
    assert_eq!(
        log.bodies_for(&PartitionId::new("0")),
        vec!["a", "b", "c", "d", "e"]
    );
    assert_eq!(errors.count_for(Operation::Checkpoint), 2);

    // the last successful write carried the position forward
    let checkpoint = store
        .read_checkpoint("orders", &PartitionId::new("0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.sequence_number, 4);
}

/// Idle partitions still surface empty batches so the application can
/// observe liveness; empty batches never produce checkpoints.
#[tokio::test]
async fn test_idle_partition_delivers_empty_batches() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemorySource::with_partition_count(1));

    let log = DeliveryLog::new();
    let sink = log.clone();
    let processor =
        EventProcessor::builder(fast_config("orders", "proc-a"), store.clone(), source)
            .on_batch(move |_ctx, batch| {
                let sink = sink.clone();
                async move {
                    sink.record(&batch);
                    Ok(())
                }
            })
            .build()
            .unwrap();

    processor.start().await.unwrap();
    wait_until("a few idle batches", || log.batch_count() >= 3).await;
    processor.stop().await.unwrap();

    assert_eq!(log.event_count(), 0);
    let checkpoint = store
        .read_checkpoint("orders", &PartitionId::new("0"))
        .await
        .unwrap();
    assert!(checkpoint.is_none());
}

/// Initialization callbacks run before the first delivery and close
/// callbacks run at shutdown with the shutdown reason.
#[tokio::test]
async fn test_lifecycle_callbacks_run_in_order() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemorySource::with_partition_count(2));
    source.append("0", "x").unwrap();
    source.append("1", "y").unwrap();

    let log = DeliveryLog::new();
    let inits: Arc<Mutex<Vec<PartitionId>>> = Arc::new(Mutex::new(Vec::new()));
    let closes: Arc<Mutex<Vec<(PartitionId, CloseReason)>>> = Arc::new(Mutex::new(Vec::new()));
    let ordered = Arc::new(AtomicBool::new(true));

    let sink = log.clone();
    let init_order = inits.clone();
    let order_flag = ordered.clone();
    let init_log = inits.clone();
    let close_log = closes.clone();
    let processor = EventProcessor::builder(fast_config("orders", "proc-a"), store, source)
        .on_initializing(move |ctx| {
            let inits = init_log.clone();
            async move {
                inits.lock().push(ctx.partition_id.clone());
                Ok(())
            }
        })
        .on_batch(move |ctx, batch| {
            let sink = sink.clone();
            let inits = init_order.clone();
            let ordered = order_flag.clone();
            async move {
                if !inits.lock().contains(&ctx.partition_id) {
                    ordered.store(false, Ordering::SeqCst);
                }
                sink.record(&batch);
                Ok(())
            }
        })
        .on_closing(move |ctx, reason| {
            let closes = close_log.clone();
            async move {
                closes.lock().push((ctx.partition_id.clone(), reason));
                Ok(())
            }
        })
        .build()
        .unwrap();

    processor.start().await.unwrap();
    wait_until("both partitions delivered", || log.event_count() == 2).await;
    processor.stop().await.unwrap();

    assert!(ordered.load(Ordering::SeqCst), "a batch arrived before init");
    let mut initialized = inits.lock().clone();
    initialized.sort();
    initialized.dedup();
    assert_eq!(
        initialized,
        vec![PartitionId::new("0"), PartitionId::new("1")]
    );

    let closed = closes.lock().clone();
    assert_eq!(closed.len(), 2);
    assert!(closed
        .iter()
        .all(|(_, reason)| *reason == CloseReason::Shutdown));
}

/// A batch handler still running when the shutdown grace expires is
/// aborted and reported as abandoned.
#[tokio::test]
async fn test_stuck_handler_is_abandoned_at_shutdown() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let source = Arc::new(InMemorySource::with_partition_count(1));
    source.append("0", "poison").unwrap();

    let errors = ErrorLog::new();
    let entered = Arc::new(AtomicBool::new(false));
    let error_sink = errors.clone();
    let gate = entered.clone();
    let processor = EventProcessor::builder(
        fast_config("orders", "proc-a").with_shutdown_grace(Duration::from_millis(100)),
        store,
        source,
    )
    .on_batch(move |_ctx, batch| {
        let gate = gate.clone();
        async move {
            if !batch.is_empty() {
                gate.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        }
    })
    .on_error(move |error| {
        let errors = error_sink.clone();
        async move { errors.record(&error) }
    })
    .build()
    .unwrap();

    processor.start().await.unwrap();
    wait_until("handler entered", || entered.load(Ordering::SeqCst)).await;

    let stopping = tokio::time::Instant::now();
    processor.stop().await.unwrap();
    assert!(
        stopping.elapsed() < Duration::from_secs(5),
        "stop() must not wait out a stuck handler"
    );
    assert_eq!(errors.count_for(Operation::Close), 1);
    assert!(!processor.is_running());
}
