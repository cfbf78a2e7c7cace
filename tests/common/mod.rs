//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use weft_amp::{CommandRegistry, FieldKind, Record, Schema, factory};
use weft_defer::{Deferred, Failure};
use weft_reactor::{ListeningPort, Reactor};

/// Upper bound on any single reactor run in these tests.
pub const RUN_LIMIT: Duration = Duration::from_secs(10);

/// Commands served by test servers:
///
/// - `sum(a, b) -> total`
/// - `echo(value) -> value`
/// - `fail(reason)`: always fails with `reason`
/// - `slow(n) -> n`: answers `n` after a reactor timer
/// - `hang()`: never answers
pub fn test_registry(reactor: &Reactor) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    let timers = reactor.clone();
    registry
        .register(
            "sum",
            &["a", "b"],
            Schema::new().field("total", FieldKind::Integer),
            |a: i64, b: i64| -> Result<Record, Failure> { Ok(Record::new().with("total", a + b)) },
        )
        .unwrap()
        .register(
            "echo",
            &["value"],
            Schema::new().field("value", FieldKind::Text),
            |value: String| -> Result<Record, Failure> { Ok(Record::new().with("value", value)) },
        )
        .unwrap()
        .register("fail", &["reason"], Schema::new(), |reason: String| -> Result<(), Failure> {
            Err(anyhow!(reason))
        })
        .unwrap()
        .register(
            "slow",
            &["n"],
            Schema::new().field("n", FieldKind::Integer),
            move |n: i64| -> Result<Deferred<Record>, Failure> {
                let answer = Deferred::new();
                let fire = answer.clone();
                timers.call_later(Duration::from_millis(20), move || {
                    fire.callback(Record::new().with("n", n)).unwrap();
                });
                Ok(answer)
            },
        )
        .unwrap()
        .register("hang", &[], Schema::new(), || -> Result<Deferred<Record>, Failure> {
            Ok(Deferred::new())
        })
        .unwrap();
    registry
}

/// Serve [`test_registry`] on an ephemeral loopback port.
pub fn serve(reactor: &Reactor) -> ListeningPort {
    let registry = Rc::new(test_registry(reactor));
    reactor
        .listen_on("127.0.0.1:0", factory(registry))
        .unwrap()
}

/// Run `client` on its own thread; the returned flag is set when it returns.
pub fn spawn_client<T, F>(addr: SocketAddr, client: F) -> (JoinHandle<T>, Arc<AtomicBool>)
where
    T: Send + 'static,
    F: FnOnce(SocketAddr) -> T + Send + 'static,
{
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let handle = thread::spawn(move || {
        let result = client(addr);
        flag.store(true, Ordering::SeqCst);
        result
    });
    (handle, done)
}

/// Run `reactor` until `done` is set or [`RUN_LIMIT`] passes.
pub fn run_until_done(reactor: &Reactor, done: Arc<AtomicBool>) {
    watch(reactor, done, Instant::now());
    reactor.run().unwrap();
}

fn watch(reactor: &Reactor, done: Arc<AtomicBool>, started: Instant) {
    if done.load(Ordering::SeqCst) || started.elapsed() > RUN_LIMIT {
        reactor.stop();
        return;
    }
    let next = reactor.clone();
    reactor.call_later(Duration::from_millis(5), move || {
        watch(&next, done, started);
    });
}

/// Run `reactor` until something calls `stop`, or [`RUN_LIMIT`] passes.
pub fn run_with_limit(reactor: &Reactor) {
    let stopper = reactor.clone();
    let limit = reactor.call_later(RUN_LIMIT, move || stopper.stop());
    reactor.run().unwrap();
    limit.cancel();
}
