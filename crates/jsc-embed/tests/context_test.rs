//! Integration tests for the EmbeddingContext API

use jsc_embed::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

fn context() -> (Arc<MockEngine>, EmbeddingContext) {
    let engine = Arc::new(MockEngine::new());
    let ctx = EmbeddingContext::new(engine.clone()).unwrap();
    (engine, ctx)
}

#[test]
fn test_basic_eval() {
    let (_engine, ctx) = context();
    assert_eq!(ctx.evaluate("1+1").unwrap(), Value::Number(2.0));
    assert_eq!(
        ctx.evaluate("'hello' + ' ' + 'world'").unwrap(),
        Value::from("hello world")
    );
    assert_eq!(ctx.evaluate("null").unwrap(), Value::Null);
    assert_eq!(ctx.evaluate("").unwrap(), Value::Undefined);
}

#[test]
fn test_eval_array_to_json() {
    let (_engine, ctx) = context();
    let value = ctx.evaluate("[1, 'two', true, null]").unwrap();
    assert_eq!(value.to_json().unwrap(), json!([1.0, "two", true, null]));
}

#[test]
fn test_throw_without_handler() {
    let (_engine, ctx) = context();
    let err = ctx.evaluate("throw new Error('x')").unwrap_err();
    assert!(err.is_script_error());

    let script = err.as_script_error().unwrap();
    assert_eq!(script.name, "Error");
    assert_eq!(script.message, "x");
    assert!(script.thrown.is_object());
}

#[test]
fn test_throw_with_handler() {
    let (_engine, ctx) = context();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.set_exception_handler(move |error| sink.lock().unwrap().push(error.message));

    let result = ctx.evaluate("throw new Error('x')").unwrap();
    assert_eq!(result, Value::Undefined);
    assert_eq!(*seen.lock().unwrap(), vec!["x".to_string()]);

    // Handler stays installed
    assert!(ctx.has_exception_handler());
    ctx.evaluate("throw new Error('y')").unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    ctx.clear_exception_handler();
    assert!(ctx.evaluate("throw new Error('z')").is_err());
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_thrown_primitive() {
    let (_engine, ctx) = context();
    let err = ctx.evaluate("throw 'oops'").unwrap_err();
    let script = err.as_script_error().unwrap();
    assert_eq!(script.name, "Error");
    assert_eq!(script.message, "oops");
    assert_eq!(script.thrown, Value::from("oops"));
}

#[test]
fn test_error_location() {
    let (_engine, ctx) = context();
    let options = EvalOptions::new().source_url("app.js").starting_line(20);
    let err = ctx
        .evaluate_with("var a = 1;\nmissing()", options)
        .unwrap_err();
    let script = err.as_script_error().unwrap();
    assert_eq!(script.name, "ReferenceError");
    assert_eq!(script.source_url.as_deref(), Some("app.js"));
    assert_eq!(script.line, Some(21));
    assert!(script.stack.as_deref().unwrap_or("").contains("app.js"));
}

#[test]
fn test_handler_error_does_not_recurse() {
    let (_engine, ctx) = context();
    let calls = Arc::new(AtomicUsize::new(0));
    let inner_result = Arc::new(Mutex::new(None));

    let counter = calls.clone();
    let slot = inner_result.clone();
    let inner_ctx = ctx.clone();
    ctx.set_exception_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        let nested = inner_ctx.evaluate("throw new Error('inside handler')");
        *slot.lock().unwrap() = Some(nested.map_err(|e| e.to_string()));
    });

    assert_eq!(ctx.evaluate("throw new Error('outer')").unwrap(), Value::Undefined);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        inner_result.lock().unwrap().clone(),
        Some(Err("Error: inside handler".to_string()))
    );

    // Break the handler -> context cycle
    ctx.clear_exception_handler();
}

#[test]
fn test_errors_on_other_threads_reach_busy_handler() {
    let (_engine, ctx) = context();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let resume_rx = Mutex::new(resume_rx);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    ctx.set_exception_handler(move |error| {
        sink.lock().unwrap().push(error.message.clone());
        if error.message == "first" {
            entered_tx.lock().unwrap().send(()).unwrap();
            resume_rx.lock().unwrap().recv().unwrap();
        }
    });

    let first = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.evaluate("throw new Error('first')"))
    };
    entered_rx.recv().unwrap();

    // The first delivery is still blocked inside the handler
    assert_eq!(ctx.evaluate("throw new Error('second')").unwrap(), Value::Undefined);

    resume_tx.send(()).unwrap();
    assert_eq!(first.join().unwrap().unwrap(), Value::Undefined);
    assert_eq!(*seen.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
    assert!(ctx.has_exception_handler());
}

#[test]
fn test_check_syntax() {
    let (engine, ctx) = context();
    assert!(ctx.check_syntax("var x = 1 + 2", None, 1).unwrap());

    let err = ctx.check_syntax("var = ;", Some("bad.js"), 1).unwrap_err();
    assert_eq!(err.error_type(), "SyntaxError");

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    ctx.set_exception_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!ctx.check_syntax("(", None, 1).unwrap());
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    // Syntax checks never run the script
    ctx.check_syntax("undefinedVariable", None, 1).unwrap();
    assert_eq!(engine.call_count("evaluate"), 0);
}

#[test]
fn test_this_and_globals() {
    let (_engine, ctx) = context();
    let target = ctx.evaluate("({ name: 'target' })").unwrap().into_object().unwrap();
    let value = ctx
        .evaluate_with("this.name", EvalOptions::new().this(target.clone()))
        .unwrap();
    assert_eq!(value, Value::from("target"));

    let global = ctx.global_object().unwrap();
    global.set("answer", 42).unwrap();
    assert_eq!(ctx.evaluate("answer").unwrap(), Value::Number(42.0));
    assert_eq!(ctx.evaluate("this").unwrap(), Value::Object(global.clone()));
    assert_eq!(ctx.global_object().unwrap(), global);
}

#[test]
fn test_object_operations() {
    let (_engine, ctx) = context();
    ctx.evaluate("function Point(x, y) { this.x = x; this.y = y; }").unwrap();
    let point = ctx.evaluate("Point").unwrap().into_object().unwrap();
    assert!(point.is_function());

    let instance = point.construct(&[1.into(), 2.into()]).unwrap();
    let instance = instance.as_object().unwrap();
    assert_eq!(instance.kind(), ObjectKind::Object);
    assert_eq!(instance.get("y").unwrap(), Value::Number(2.0));

    instance.set("label", "p").unwrap();
    assert_eq!(instance.get("label").unwrap(), Value::from("p"));

    let array = ctx.evaluate("[10, 20, 30]").unwrap().into_object().unwrap();
    assert_eq!(array.length().unwrap(), 3);
    assert_eq!(array.get_index(1).unwrap(), Value::Number(20.0));
    assert!(instance.length().is_err());
}

#[test]
fn test_call_errors_follow_policy() {
    let (_engine, ctx) = context();
    let thrower = ctx
        .evaluate("function fail(m) { throw new RangeError(m); }; fail")
        .unwrap()
        .into_object()
        .unwrap();

    let err = thrower.call(None, &["bad".into()]).unwrap_err();
    assert_eq!(err.to_string(), "RangeError: bad");

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    ctx.set_exception_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(thrower.call(None, &[]).unwrap(), Value::Undefined);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let undefined = ctx.evaluate("undefined").unwrap();
    assert!(undefined.as_object().is_none());
}

#[test]
fn test_register_function() {
    let (engine, ctx) = context();
    let add = ctx
        .register_function("add", |args| {
            Ok(Value::Number(args.iter().filter_map(Value::as_f64).sum()))
        })
        .unwrap();
    assert!(add.is_function());
    assert_eq!(engine.call_count("make_function"), 1);

    assert_eq!(ctx.evaluate("add(1, 2, 3)").unwrap(), Value::Number(6.0));
    assert_eq!(ctx.evaluate("add").unwrap(), Value::Object(add.clone()));
    assert_eq!(ctx.evaluate("add.name").unwrap(), Value::from("add"));
    assert_eq!(add.call(None, &[4.into(), 5.into()]).unwrap(), Value::Number(9.0));
}

#[test]
fn test_host_function_uses_its_context() {
    let (_engine, ctx) = context();
    ctx.register_function("describe", |args| {
        let object = args
            .first()
            .and_then(Value::as_object)
            .ok_or_else(|| EmbedError::type_error("object", "nothing"))?;
        let label = object.get("label")?;
        let answer = object.context().evaluate("21 * 2")?;
        Ok(Value::from(format!("{}:{}", label, answer)))
    })
    .unwrap();

    assert_eq!(
        ctx.evaluate("describe({ label: 'x' })").unwrap(),
        Value::from("x:42")
    );
}

#[test]
fn test_host_function_errors_follow_policy() {
    let (_engine, ctx) = context();
    ctx.register_function("fail", |_| Err(EmbedError::internal("disk on fire")))
        .unwrap();
    ctx.register_function("rethrow", |args| {
        let thrown = args.first().cloned().unwrap_or_default();
        Err(ScriptError::new("Error", "rethrown", thrown).into())
    })
    .unwrap();

    let err = ctx.evaluate("fail()").unwrap_err();
    let script = err.as_script_error().unwrap();
    assert_eq!(script.name, "Error");
    assert_eq!(script.message, "Internal error: disk on fire");

    let err = ctx.evaluate("rethrow('boom')").unwrap_err();
    assert_eq!(err.as_script_error().unwrap().thrown, Value::from("boom"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.set_exception_handler(move |error| sink.lock().unwrap().push(error.message));
    assert_eq!(ctx.evaluate("fail()").unwrap(), Value::Undefined);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["Internal error: disk on fire".to_string()]
    );
}

#[test]
fn test_objects_from_other_contexts_are_rejected() {
    let (_engine_a, a) = context();
    let (_engine_b, b) = context();
    let foreign = b.evaluate("({})").unwrap().into_object().unwrap();
    let global = a.global_object().unwrap();
    let err = global.set("foreign", foreign).unwrap_err();
    assert_eq!(err.error_type(), "TypeError");
}

#[test]
fn test_context_creation_failure() {
    let engine = Arc::new(MockEngine::new());
    engine.refuse_contexts(true);
    let err = EmbeddingContext::new(engine).unwrap_err();
    assert_eq!(err.error_type(), "ContextError");
}

#[test]
fn test_shutdown_rejects_work() {
    let (engine, ctx) = context();
    ctx.shutdown();
    assert!(ctx.is_closed());
    assert_eq!(engine.live_contexts(), 0);

    let calls_before = engine.calls().len();
    assert!(matches!(ctx.evaluate("1"), Err(EmbedError::QueueClosed)));
    assert!(matches!(ctx.garbage_collect(), Err(EmbedError::QueueClosed)));
    assert_eq!(engine.calls().len(), calls_before);

    // Idempotent
    ctx.shutdown();
}

#[tokio::test]
async fn test_evaluate_async() {
    let (_engine, ctx) = context();
    let value = ctx.evaluate_async("6 * 7").await.unwrap();
    assert_eq!(value, Value::Number(42.0));

    let err = ctx.evaluate_async("throw new TypeError('async')").await.unwrap_err();
    assert_eq!(err.to_string(), "TypeError: async");
}

#[tokio::test]
async fn test_concurrent_evaluate_async() {
    let (_engine, ctx) = context();
    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.evaluate_async(format!("{} + 1", i)).await })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let value = task.await.unwrap().unwrap();
        assert_eq!(value, Value::Number(i as f64 + 1.0));
    }
}

#[test]
fn test_stats() {
    let (_engine, ctx) = context();
    ctx.evaluate("1").unwrap();
    ctx.evaluate("throw 1").unwrap_err();
    let stats = ctx.stats();
    assert!(stats.units_completed >= 3);
    assert!(stats.units_failed >= 1);
}
