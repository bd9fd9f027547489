//! Thread safety of the public handles
//!
//! Every handle the embedding layer hands out may be moved to and shared
//! between threads; engine access stays on the worker.

use jsc_embed::prelude::*;
use jsc_embed::{DeferredReleaseQueue, SerialWorkQueue};
use std::sync::Arc;
use std::thread;

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_handles_are_send_and_sync() {
    assert_send_sync::<EmbeddingContext>();
    assert_send_sync::<EmbeddingContextGroup>();
    assert_send_sync::<JsObject>();
    assert_send_sync::<Value>();
    assert_send_sync::<EmbedError>();
    assert_send_sync::<SerialWorkQueue>();
    assert_send_sync::<DeferredReleaseQueue>();
    assert_send_sync::<MockEngine>();
}

#[test]
fn test_object_moves_between_threads() {
    let ctx = EmbeddingContext::new(Arc::new(MockEngine::new())).unwrap();
    let counter = ctx.evaluate("({ count: 0 })").unwrap().into_object().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    // Read-modify-write is not atomic across units, so each
                    // thread only checks that its own calls succeed
                    let value = counter.get("count").unwrap().as_f64().unwrap();
                    counter.set("count", value + 1.0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let count = counter.get("count").unwrap().as_f64().unwrap();
    assert!((25.0..=100.0).contains(&count));
}

#[test]
fn test_context_used_from_many_threads() {
    let ctx = EmbeddingContext::new(Arc::new(MockEngine::new())).unwrap();
    ctx.evaluate("var total = 0").unwrap();

    thread::scope(|scope| {
        for i in 0..8i32 {
            let ctx = &ctx;
            scope.spawn(move || {
                let result = ctx.evaluate(&format!("{} * 2", i)).unwrap();
                assert_eq!(result, Value::Number(f64::from(i * 2)));
            });
        }
    });
}
