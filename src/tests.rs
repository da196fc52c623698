use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bridge::{
    AsyncWork, CallMode, Env, EscapeState, Property, ReferenceState, ReleaseMode, ScopeState, ThreadsafeFunction,
    Value,
};
use crate::error::{Result, Status};
use crate::runtime::{OwnedEnv, PropertyAttributes, Runtime, RuntimeConfig, ValueType};

/// Helper: a small runtime plus one environment on the test thread.
fn setup() -> (Runtime, OwnedEnv) {
    let runtime = Runtime::new(RuntimeConfig {
        worker_threads: 2,
        ..Default::default()
    })
    .expect("runtime starts");
    let owned = runtime.create_env();
    (runtime, owned)
}

fn answer_init(env: Env, exports: Value) -> Result<Value> {
    exports.define_properties(&[
        Property::new("answer").with_method(|info| info.env().create_int32(42)),
        Property::new("name").with_value(env.create_string("bridge")?),
    ])?;
    Ok(exports)
}

crate::register_module!(answer_module, answer_init);

fn failing_init(_env: Env, _exports: Value) -> Result<Value> {
    Err(crate::Error::from_reason("init refused"))
}

crate::register_module!(failing_module, failing_init);

fn panicking_init(_env: Env, _exports: Value) -> Result<Value> {
    panic!("init blew up")
}

crate::register_module!(panicking_module, panicking_init);

// ============================================================================
// Modules and dispatch
// ============================================================================

#[test]
fn test_module_exports_answer() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let exports = owned.load_module(Some(answer_module)).expect("module loads");
    let exports = unsafe { Value::from_raw(env, exports) };

    let answer = exports.get_named_property("answer").unwrap();
    assert_eq!(answer.value_type().unwrap(), ValueType::Function);
    let result = answer.call(Some(exports), &[]).unwrap();
    assert_eq!(result.value_type().unwrap(), ValueType::Number);
    assert_eq!(result.get_double().unwrap(), 42.0);

    let name = exports.get_named_property("name").unwrap();
    assert_eq!(name.get_string().unwrap(), "bridge");
}

#[test]
fn test_failing_init_leaves_exception_uncaught() {
    let (_runtime, owned) = setup();
    let status = owned.load_module(Some(failing_module)).unwrap_err();
    assert_eq!(status, Status::PendingException);
    let uncaught = owned.take_uncaught();
    assert_eq!(uncaught.len(), 1);
    assert!(uncaught[0].contains("init refused"));
}

#[test]
fn test_panicking_init_is_thrown_not_unwound() {
    let (_runtime, owned) = setup();
    let status = owned.load_module(Some(panicking_module)).unwrap_err();
    assert_eq!(status, Status::PendingException);
    assert_eq!(owned.take_uncaught(), vec![String::from("module initialization panicked")]);
}

#[test]
fn test_two_handlers_dispatch_independently() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let counter = first_calls.clone();
    let first = env
        .create_function("first", move |info| {
            counter.fetch_add(1, Ordering::SeqCst);
            info.env().create_string("first")
        })
        .unwrap();
    let counter = second_calls.clone();
    let second = env
        .create_function("second", move |info| {
            counter.fetch_add(1, Ordering::SeqCst);
            let doubled = info.arg(0)?.get_int32()? * 2;
            info.env().create_int32(doubled)
        })
        .unwrap();

    assert_eq!(first.call(None, &[]).unwrap().get_string().unwrap(), "first");
    let arg = env.create_int32(21).unwrap();
    assert_eq!(second.call(None, &[arg]).unwrap().get_int32().unwrap(), 42);
    assert_eq!(first.call(None, &[]).unwrap().get_string().unwrap(), "first");

    assert_eq!(first_calls.load(Ordering::SeqCst), 2);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_many_functions_keep_their_own_handler() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let functions: Vec<Value> = (0..32)
        .map(|i| {
            env.create_function(&format!("f{i}"), move |info| info.env().create_int32(i))
                .unwrap()
        })
        .collect();

    for (i, function) in functions.iter().enumerate().rev() {
        let result = function.call(None, &[]).unwrap();
        assert_eq!(result.get_int32().unwrap(), i as i32);
    }
}

#[test]
fn test_missing_arguments_read_as_undefined() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let function = env
        .create_function("arity", |info| {
            let len = info.len() as i32;
            let missing = info.arg(3)?.is_undefined()?;
            assert!(missing);
            info.env().create_int32(len)
        })
        .unwrap();
    let one = env.create_int32(1).unwrap();
    assert_eq!(function.call(None, &[one]).unwrap().get_int32().unwrap(), 1);
}

#[test]
fn test_handler_error_becomes_pending_exception() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let function = env
        .create_function("fails", |_info| Err(crate::Error::new(Status::InvalidArg, "bad input")))
        .unwrap();
    let err = function.call(None, &[]).unwrap_err();
    assert_eq!(err.status, Status::PendingException);

    let exception = env.get_and_clear_last_exception().unwrap().expect("exception pending");
    assert!(exception.is_error().unwrap());
    let message = exception.get_named_property("message").unwrap();
    assert!(message.get_string().unwrap().contains("bad input"));
    assert!(!env.is_exception_pending().unwrap());
}

#[test]
fn test_handler_panic_is_contained() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let function = env
        .create_function("panics", |_info| -> Result<Value> { panic!("handler exploded") })
        .unwrap();
    let err = function.call(None, &[]).unwrap_err();
    assert_eq!(err.status, Status::PendingException);

    let exception = env.get_and_clear_last_exception().unwrap().expect("exception pending");
    let message = exception.get_named_property("message").unwrap();
    assert!(message.get_string().unwrap().contains("handler exploded"));

    // The environment stays usable.
    let ok = env.create_function("ok", |info| info.env().get_boolean(true)).unwrap();
    assert!(ok.call(None, &[]).unwrap().get_bool().unwrap());
}

#[test]
fn test_explicit_throw_is_kept() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let function = env
        .create_function("throws", |info| {
            info.env().throw_type_error("wrong type", Some("ERR_TYPE"))?;
            Err(crate::Error::from_status(Status::PendingException))
        })
        .unwrap();
    assert!(function.call(None, &[]).is_err());

    let exception = env.get_and_clear_last_exception().unwrap().expect("exception pending");
    let code = exception.get_named_property("code").unwrap();
    assert_eq!(code.get_string().unwrap(), "ERR_TYPE");
}

// ============================================================================
// Properties and classes
// ============================================================================

#[test]
fn test_accessor_property_round_trip() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let stored = Arc::new(AtomicI32::new(5));
    let object = env.create_object().unwrap();
    let reader = stored.clone();
    let writer = stored.clone();
    env.define_properties(
        object,
        &[Property::new("level")
            .with_getter(move |info| info.env().create_int32(reader.load(Ordering::SeqCst)))
            .with_setter(move |info| {
                writer.store(info.arg(0)?.get_int32()?, Ordering::SeqCst);
                info.env().get_undefined()
            })
            .with_attributes(PropertyAttributes::ENUMERABLE)],
    )
    .unwrap();

    assert_eq!(object.get_named_property("level").unwrap().get_int32().unwrap(), 5);
    object
        .set_named_property("level", env.create_int32(9).unwrap())
        .unwrap();
    assert_eq!(stored.load(Ordering::SeqCst), 9);
    assert_eq!(object.get_named_property("level").unwrap().get_int32().unwrap(), 9);
}

#[test]
fn test_property_mixing_value_and_method_is_rejected() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let object = env.create_object().unwrap();
    let mixed = Property::new("mixed")
        .with_value(env.create_int32(1).unwrap())
        .with_method(|info| info.env().get_undefined());
    let err = env.define_properties(object, &[mixed]).unwrap_err();
    assert_eq!(err.status, Status::InvalidArg);
    assert!(!object.has_named_property("mixed").unwrap());
}

struct Counter {
    count: i32,
}

#[test]
fn test_class_with_wrapped_native_state() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let class = env
        .define_class(
            "Counter",
            |info| {
                let start = match info.arg(0)?.value_type()? {
                    ValueType::Number => info.arg(0)?.get_int32()?,
                    _ => 0,
                };
                info.env().wrap(info.this(), Counter { count: start })?;
                Ok(info.this())
            },
            &[
                Property::new("increment").with_method(|info| {
                    let counter = unsafe { info.env().unwrap::<Counter>(info.this())? };
                    counter.count += 1;
                    info.env().create_int32(counter.count)
                }),
                Property::new("kind")
                    .with_method(|info| info.env().create_string("counter"))
                    .static_property(),
            ],
        )
        .unwrap();

    let start = env.create_int32(10).unwrap();
    let instance = class.new_instance(&[start]).unwrap();
    assert!(instance.instance_of(class).unwrap());

    let increment = instance.get_named_property("increment").unwrap();
    assert_eq!(increment.call(Some(instance), &[]).unwrap().get_int32().unwrap(), 11);
    assert_eq!(increment.call(Some(instance), &[]).unwrap().get_int32().unwrap(), 12);

    let kind = class.get_named_property("kind").unwrap();
    assert_eq!(kind.call(Some(class), &[]).unwrap().get_string().unwrap(), "counter");
    assert!(!instance.has_named_property("kind").unwrap());

    let counter = unsafe { env.remove_wrap::<Counter>(instance).unwrap() };
    assert_eq!(counter.count, 12);
}

#[test]
fn test_external_value_holds_native_data() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let external = env.create_external(String::from("payload")).unwrap();
    assert_eq!(external.value_type().unwrap(), ValueType::External);
    let data = unsafe { env.get_value_external::<String>(external).unwrap() };
    assert_eq!(data, "payload");
}

// ============================================================================
// Scopes and references
// ============================================================================

#[test]
fn test_out_of_order_close_is_rejected() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let depth = owned.scope_depth();
    let mut outer = env.open_handle_scope().unwrap();
    let mut inner = env.open_handle_scope().unwrap();
    assert_eq!(owned.scope_depth(), depth + 2);

    let err = outer.close().unwrap_err();
    assert_eq!(err.status, Status::HandleScopeMismatch);
    assert_eq!(outer.state(), ScopeState::Open);
    assert_eq!(owned.scope_depth(), depth + 2);

    inner.close().unwrap();
    outer.close().unwrap();
    assert_eq!(owned.scope_depth(), depth);
    assert_eq!(outer.close().unwrap_err().status, Status::HandleScopeMismatch);
}

#[test]
fn test_scopes_close_on_drop_in_lifo_order() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let depth = owned.scope_depth();
    {
        let _outer = env.open_handle_scope().unwrap();
        let _inner = env.open_escapable_handle_scope().unwrap();
        assert_eq!(owned.scope_depth(), depth + 2);
    }
    assert_eq!(owned.scope_depth(), depth);
}

#[test]
fn test_second_escape_is_rejected() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let mut scope = env.open_escapable_handle_scope().unwrap();
    let value = env.create_string("kept").unwrap();
    let escaped = scope.escape(value).unwrap();
    assert_eq!(scope.escape_state(), EscapeState::Escaped);

    let err = scope.escape(value).unwrap_err();
    assert_eq!(err.status, Status::EscapeCalledTwice);

    scope.close().unwrap();
    assert_eq!(escaped.get_string().unwrap(), "kept");
}

#[test]
fn test_reference_counting() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let object = env.create_object().unwrap();
    let mut reference = env.create_reference(object, 1).unwrap();
    assert_eq!(reference.reference().unwrap(), 2);
    assert_eq!(reference.unref().unwrap(), 1);
    assert_eq!(reference.unref().unwrap(), 0);

    let err = reference.unref().unwrap_err();
    assert_eq!(err.status, Status::GenericFailure);

    reference.delete().unwrap();
    assert_eq!(reference.state(), ReferenceState::Deleted);
    assert_eq!(reference.get_value().unwrap_err().status, Status::InvalidArg);
}

#[test]
fn test_strong_reference_survives_scope_and_collection() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let mut reference = {
        let _scope = env.open_handle_scope().unwrap();
        let object = env.create_object().unwrap();
        object
            .set_named_property("tag", env.create_int32(3).unwrap())
            .unwrap();
        env.create_reference(object, 1).unwrap()
    };
    owned.collect_garbage();

    let object = reference.get_value().unwrap().expect("strong target kept");
    assert_eq!(object.get_named_property("tag").unwrap().get_int32().unwrap(), 3);
    reference.delete().unwrap();
}

// ============================================================================
// Async work
// ============================================================================

#[test]
fn test_async_work_runs_both_phases() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let shared = Arc::new(AtomicI32::new(0));
    let completions = Arc::new(AtomicUsize::new(0));
    let (seen_tx, seen_rx) = mpsc::channel();

    let writer = shared.clone();
    let done = completions.clone();
    let mut work = AsyncWork::create(
        env,
        "write-seven",
        move || {
            writer.store(7, Ordering::SeqCst);
            Ok(7)
        },
        move |_env, result: Result<i32>| {
            done.fetch_add(1, Ordering::SeqCst);
            seen_tx.send(result.map_err(|e| e.status)).unwrap();
            Ok(())
        },
    )
    .unwrap();

    work.queue().unwrap();
    owned.run_loop();

    assert_eq!(seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(7));
    assert_eq!(shared.load(Ordering::SeqCst), 7);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    assert_eq!(work.cancel().unwrap_err().status, Status::GenericFailure);
    assert_eq!(work.queue().unwrap_err().status, Status::GenericFailure);
    work.delete().unwrap();
    assert_eq!(work.delete().unwrap_err().status, Status::InvalidArg);
}

#[test]
fn test_cancelled_work_completes_with_cancelled() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let executed = Arc::new(AtomicBool::new(false));
    let outcome = Arc::new(Mutex::new(None));

    let ran = executed.clone();
    let slot = outcome.clone();
    let mut work = AsyncWork::create(
        env,
        "cancelled",
        move || {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        },
        move |_env, result: Result<()>| {
            *slot.lock() = Some(result.map_err(|e| e.status));
            Ok(())
        },
    )
    .unwrap();

    work.cancel().unwrap();
    assert_eq!(work.cancel().unwrap_err().status, Status::GenericFailure);
    owned.run_loop();

    assert!(!executed.load(Ordering::SeqCst));
    assert_eq!(*outcome.lock(), Some(Err(Status::Cancelled)));
    work.delete().unwrap();
}

#[test]
fn test_cancel_after_queue_is_rejected_and_complete_still_fires() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let (started_tx, started_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let completions = Arc::new(AtomicUsize::new(0));
    let outcome = Arc::new(Mutex::new(None));

    let done = completions.clone();
    let slot = outcome.clone();
    let mut work = AsyncWork::create(
        env,
        "running",
        move || {
            started_tx
                .send(())
                .map_err(|_| crate::Error::from_reason("test thread gone"))?;
            gate_rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| crate::Error::from_reason("gate never opened"))?;
            Ok(5)
        },
        move |_env, result: Result<i32>| {
            done.fetch_add(1, Ordering::SeqCst);
            *slot.lock() = Some(result.map_err(|e| e.status));
            Ok(())
        },
    )
    .unwrap();

    work.queue().unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(work.cancel().unwrap_err().status, Status::GenericFailure);

    gate_tx.send(()).unwrap();
    owned.run_loop();

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(*outcome.lock(), Some(Ok(5)));
    work.delete().unwrap();
}

#[test]
fn test_delete_waits_for_complete() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let mut work = AsyncWork::create(
        env,
        "gated",
        move || {
            gate_rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| crate::Error::from_reason("gate never opened"))
        },
        |_env, result: Result<()>| result,
    )
    .unwrap();

    work.queue().unwrap();
    assert_eq!(work.delete().unwrap_err().status, Status::GenericFailure);

    gate_tx.send(()).unwrap();
    owned.run_loop();
    work.delete().unwrap();
    assert!(owned.take_uncaught().is_empty());
}

#[test]
fn test_execute_error_reaches_complete() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let mut work = AsyncWork::create(
        env,
        "fails",
        || -> Result<u8> { Err(crate::Error::new(Status::NumberExpected, "not a number")) },
        move |_env, result| {
            *slot.lock() = Some(result.map_err(|e| (e.status, e.reason)));
            Ok(())
        },
    )
    .unwrap();

    work.queue().unwrap();
    owned.run_loop();
    work.delete().unwrap();

    assert_eq!(
        *outcome.lock(),
        Some(Err((Status::NumberExpected, String::from("not a number"))))
    );
}

// ============================================================================
// Thread-safe functions
// ============================================================================

#[test]
fn test_threadsafe_calls_arrive_in_order() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let received = Arc::new(Mutex::new(Vec::new()));
    let finalized = Arc::new(AtomicBool::new(false));

    let sink = received.clone();
    let flag = finalized.clone();
    let tsfn = ThreadsafeFunction::create_with_finalizer(
        env,
        None,
        "ordered",
        0,
        1,
        move |env, _callback, n: u32| {
            let value = env.create_uint32(n)?;
            sink.lock().push(value.get_uint32()?);
            Ok(())
        },
        move |_env| flag.store(true, Ordering::SeqCst),
    )
    .unwrap();

    let producer = {
        let tsfn = tsfn.clone();
        thread::spawn(move || {
            for n in 0..20 {
                tsfn.call(n, CallMode::Blocking).unwrap();
            }
            tsfn.release(ReleaseMode::Release).unwrap();
        })
    };
    assert!(owned.run_loop_for(Duration::from_secs(10)));
    producer.join().unwrap();

    assert_eq!(*received.lock(), (0..20).collect::<Vec<_>>());
    assert!(finalized.load(Ordering::SeqCst));
}

#[test]
fn test_threadsafe_queue_full_then_abort() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let delivered = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(AtomicBool::new(false));

    let count = delivered.clone();
    let flag = finalized.clone();
    let tsfn = ThreadsafeFunction::create_with_finalizer(
        env,
        None,
        "bounded",
        1,
        1,
        move |_env, _callback, _item: String| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        move |_env| flag.store(true, Ordering::SeqCst),
    )
    .unwrap();

    tsfn.call(String::from("first"), CallMode::NonBlocking).unwrap();
    let err = tsfn
        .call(String::from("second"), CallMode::NonBlocking)
        .unwrap_err();
    assert_eq!(err.status, Status::QueueFull);

    tsfn.abort().unwrap();
    assert_eq!(
        tsfn.call(String::from("late"), CallMode::NonBlocking).unwrap_err().status,
        Status::Closing
    );
    let remote = {
        let tsfn = tsfn.clone();
        thread::spawn(move || tsfn.call(String::from("remote"), CallMode::Blocking).map_err(|e| e.status))
    };
    assert_eq!(remote.join().unwrap(), Err(Status::Closing));
    assert_eq!(tsfn.acquire().unwrap_err().status, Status::Closing);

    owned.run_loop();
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert!(finalized.load(Ordering::SeqCst));
}

#[test]
fn test_blocking_call_waits_for_queue_space() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let tsfn = ThreadsafeFunction::create(env, None, "narrow", 1, 1, move |_env, _callback, n: u32| {
        sink.lock().push(n);
        Ok(())
    })
    .unwrap();
    tsfn.call(0, CallMode::NonBlocking).unwrap();

    let queued = Arc::new(AtomicBool::new(false));
    let producer = {
        let tsfn = tsfn.clone();
        let queued = queued.clone();
        thread::spawn(move || {
            tsfn.call(1, CallMode::Blocking).unwrap();
            queued.store(true, Ordering::SeqCst);
            tsfn.release(ReleaseMode::Release).unwrap();
        })
    };

    // Nothing drains the queue until the loop runs.
    thread::sleep(Duration::from_millis(100));
    assert!(!queued.load(Ordering::SeqCst));

    assert!(owned.run_loop_for(Duration::from_secs(10)));
    producer.join().unwrap();
    assert!(queued.load(Ordering::SeqCst));
    assert_eq!(*received.lock(), vec![0, 1]);
}

#[test]
fn test_threadsafe_handle_outlives_environment() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let finalized = Arc::new(AtomicBool::new(false));
    let flag = finalized.clone();
    let tsfn = ThreadsafeFunction::create_with_finalizer(
        env,
        None,
        "orphan",
        0,
        1,
        |_env, _callback, _n: u32| Ok(()),
        move |_env| flag.store(true, Ordering::SeqCst),
    )
    .unwrap();

    drop(owned);
    assert!(finalized.load(Ordering::SeqCst));

    let late = thread::spawn(move || tsfn.call(7, CallMode::NonBlocking).map_err(|e| e.status))
        .join()
        .unwrap();
    assert_eq!(late, Err(Status::Closing));
}

#[test]
fn test_threadsafe_requires_an_initial_thread() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let err = ThreadsafeFunction::create(env, None, "empty", 0, 0, |_env, _callback, _item: ()| Ok(())).unwrap_err();
    assert_eq!(err.status, Status::InvalidArg);
}

#[test]
fn test_threadsafe_invokes_js_callback() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let total = Arc::new(AtomicI32::new(0));
    let acc = total.clone();
    let callback = env
        .create_function("accumulate", move |info| {
            acc.fetch_add(info.arg(0)?.get_int32()?, Ordering::SeqCst);
            info.env().get_undefined()
        })
        .unwrap();

    let tsfn = ThreadsafeFunction::create(env, Some(callback), "accumulate", 4, 1, |env, callback, n: i32| {
        let callback = callback.ok_or_else(|| crate::Error::from_status(Status::FunctionExpected))?;
        callback.call(None, &[env.create_int32(n)?])?;
        Ok(())
    })
    .unwrap();

    for n in 1..=4 {
        tsfn.call(n, CallMode::NonBlocking).unwrap();
    }
    tsfn.release(ReleaseMode::Release).unwrap();
    owned.run_loop();

    assert_eq!(total.load(Ordering::SeqCst), 10);
}

#[test]
fn test_unref_lets_loop_exit() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let tsfn = ThreadsafeFunction::create(env, None, "idle", 0, 1, |_env, _callback, _item: ()| Ok(())).unwrap();
    tsfn.unref(env).unwrap();
    assert!(owned.run_loop_for(Duration::from_millis(200)));

    tsfn.reference(env).unwrap();
    assert!(!owned.run_loop_for(Duration::from_millis(100)));
    tsfn.release(ReleaseMode::Release).unwrap();
    assert!(owned.run_loop_for(Duration::from_secs(5)));
}

// ============================================================================
// Lifecycle hooks
// ============================================================================

#[test]
fn test_cleanup_hooks_run_at_teardown() {
    let (runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let kept = Arc::new(AtomicBool::new(false));
    let removed = Arc::new(AtomicBool::new(false));

    let flag = kept.clone();
    env.add_env_cleanup_hook(move || flag.store(true, Ordering::SeqCst))
        .unwrap();
    let flag = removed.clone();
    let hook = env
        .add_env_cleanup_hook(move || flag.store(true, Ordering::SeqCst))
        .unwrap();
    env.remove_env_cleanup_hook(hook).unwrap();

    drop(owned);
    drop(runtime);
    assert!(kept.load(Ordering::SeqCst));
    assert!(!removed.load(Ordering::SeqCst));
}

#[test]
fn test_exported_method_callable_from_teardown_callbacks() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let exports = owned.load_module(Some(answer_module)).unwrap();
    let exports = unsafe { Value::from_raw(env, exports) };
    let answer = exports.get_named_property("answer").unwrap();
    env.get_global()
        .unwrap()
        .set_named_property("answer", answer)
        .unwrap();

    let seen = Arc::new(Mutex::new(None));
    let slot = seen.clone();
    let work = AsyncWork::create(
        env,
        "late",
        || Ok(()),
        move |env, result: Result<()>| {
            result?;
            let answer = env.get_global()?.get_named_property("answer")?;
            *slot.lock() = Some(answer.call(None, &[])?.get_int32()?);
            Ok(())
        },
    )
    .unwrap();
    work.queue().unwrap();

    // Still in flight, so the complete phase is left to teardown.
    drop(work);
    drop(owned);
    assert_eq!(*seen.lock(), Some(42));
}

#[test]
fn test_finalizer_runs_when_object_is_collected() {
    let (_runtime, owned) = setup();
    let env = unsafe { Env::from_owned(&owned) };

    let finalized = Arc::new(AtomicBool::new(false));
    {
        let _scope = env.open_handle_scope().unwrap();
        let object = env.create_object().unwrap();
        let flag = finalized.clone();
        env.add_finalizer(object, move |_env| flag.store(true, Ordering::SeqCst))
            .unwrap();
    }
    owned.collect_garbage();
    assert!(finalized.load(Ordering::SeqCst));
}
