use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use napi_bridge::bridge::{AsyncWork, CallMode, Env, Property, ReleaseMode, ThreadsafeFunction, Value};
use napi_bridge::{Error, PropertyAttributes, Result, Runtime, RuntimeConfig, register_module};
use tracing_subscriber::EnvFilter;

fn init(env: Env, exports: Value) -> Result<Value> {
    exports.define_properties(&[
        Property::new("answer").with_method(|info| info.env().create_int32(42)),
        Property::new("add").with_method(|info| {
            let a = info.arg(0)?.get_double()?;
            let b = info.arg(1)?.get_double()?;
            info.env().create_double(a + b)
        }),
        Property::new("version")
            .with_value(env.create_uint32(env.get_version()?)?)
            .with_attributes(PropertyAttributes::ENUMERABLE),
    ])?;
    Ok(exports)
}

register_module!(demo_module, init);

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run() {
        eprintln!("demo failed: {}", err);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let runtime = Runtime::new(RuntimeConfig::from_env())?;
    let owned = runtime.create_env();
    let env = unsafe { Env::from_owned(&owned) };

    let exports = owned.load_module(Some(demo_module)).map_err(Error::from)?;
    let exports = unsafe { Value::from_raw(env, exports) };

    let answer = exports.get_named_property("answer")?.call(Some(exports), &[])?;
    println!("answer() = {}", answer.get_double()?);

    let sum = exports
        .get_named_property("add")?
        .call(None, &[env.create_double(1.5)?, env.create_int32(2)?])?;
    println!("add(1.5, 2) = {}", sum.get_double()?);

    // Execute on the pool, complete back on this thread.
    let shared = Arc::new(AtomicI32::new(0));
    let writer = shared.clone();
    let mut work = AsyncWork::create(
        env,
        "demo-work",
        move || {
            writer.store(7, Ordering::SeqCst);
            Ok(writer.load(Ordering::SeqCst))
        },
        |env, result| {
            let value = env.create_int32(result?)?;
            println!("async work completed with {}", value.get_int32()?);
            Ok(())
        },
    )?;
    work.queue()?;
    owned.run_loop();
    work.delete()?;
    println!("shared data after work: {}", shared.load(Ordering::SeqCst));

    // Calls from a producer thread, delivered here in order.
    let tsfn = ThreadsafeFunction::create(env, None, "demo-tsfn", 2, 1, |env, _callback, n: u32| {
        let value = env.create_uint32(n)?;
        println!("thread-safe call delivered {}", value.get_uint32()?);
        Ok(())
    })?;
    let producer = {
        let tsfn = tsfn.clone();
        thread::spawn(move || -> Result<()> {
            for n in 1..=3 {
                tsfn.call(n, CallMode::Blocking)?;
            }
            tsfn.release(ReleaseMode::Release)
        })
    };
    owned.run_loop();
    producer
        .join()
        .map_err(|_| Error::from_reason("producer thread panicked"))??;

    for message in owned.take_uncaught() {
        eprintln!("uncaught: {}", message);
    }
    Ok(())
}
