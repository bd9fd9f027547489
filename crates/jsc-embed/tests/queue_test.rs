//! SerialWorkQueue integration tests

use jsc_embed::prelude::*;
use jsc_embed::{QueueState, SerialWorkQueue};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn queue() -> SerialWorkQueue {
    SerialWorkQueue::new(&EmbedConfig::default().thread_name("queue-test")).unwrap()
}

#[test]
fn test_units_run_in_submission_order() {
    let queue = queue();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        queue.run_async(move || order.lock().push(i)).unwrap();
    }
    queue.run_sync(|| Ok(())).unwrap();

    assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_run_sync_from_many_threads() {
    let queue = Arc::new(queue());
    let running = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let queue = queue.clone();
            let running = running.clone();
            thread::spawn(move || {
                queue
                    .run_sync(move || {
                        // Units never overlap
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(2));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    })
                    .unwrap()
            })
        })
        .collect();

    let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort();
    assert_eq!(results, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_quit_drains_then_rejects() {
    let queue = queue();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let ran = ran.clone();
        queue
            .run_async(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    queue.quit();
    assert_eq!(ran.load(Ordering::SeqCst), 10);
    assert_eq!(queue.state(), QueueState::Stopped);

    assert!(matches!(queue.run_sync(|| Ok(())), Err(EmbedError::QueueClosed)));
    assert!(matches!(queue.run_async(|| {}), Err(EmbedError::QueueClosed)));
}

#[test]
fn test_closed_context_makes_no_engine_calls() {
    let engine = Arc::new(MockEngine::new());
    let ctx = EmbeddingContext::new(engine.clone()).unwrap();
    ctx.shutdown();

    let before = engine.calls().len();
    assert!(matches!(ctx.evaluate("1"), Err(EmbedError::QueueClosed)));
    assert!(matches!(ctx.global_object(), Err(EmbedError::QueueClosed)));
    assert!(matches!(ctx.flush_releases(), Err(EmbedError::QueueClosed)));
    assert_eq!(engine.calls().len(), before);
}

#[test]
fn test_panic_is_reported_and_queue_survives() {
    let queue = queue();
    let err = queue
        .run_sync::<(), _>(|| panic!("unit exploded"))
        .unwrap_err();
    assert!(matches!(err, EmbedError::WorkerPanicked(ref message) if message.contains("unit exploded")));

    assert_eq!(queue.run_sync(|| Ok(5)).unwrap(), 5);
    assert_eq!(queue.stats().snapshot().units_failed, 1);
}

#[test]
#[serial]
fn test_garbage_collect_does_not_block() {
    let engine = Arc::new(MockEngine::new().with_gc_delay(Duration::from_millis(300)));
    let ctx = EmbeddingContext::new(engine.clone()).unwrap();

    let start = Instant::now();
    ctx.garbage_collect().unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));

    // The next synchronous unit waits behind the collection
    ctx.evaluate("1").unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(engine.gc_requests(), 1);
}

#[test]
#[serial]
fn test_tick_hook_runs_when_idle() {
    let config = EmbedConfig::default().tick_interval(Duration::from_millis(5));
    let queue = SerialWorkQueue::new(&config).unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = ticks.clone();
    queue.register_tick(move || counter.fetch_add(1, Ordering::SeqCst) < 2);

    thread::sleep(Duration::from_millis(100));
    // The hook unregistered itself after returning false
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}
