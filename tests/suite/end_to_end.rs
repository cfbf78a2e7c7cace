//! Servers and clients talking over real loopback TCP.

use std::cell::RefCell;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::slice;
use std::thread;
use std::time::Duration;

use weft_amp::{
    Amp, BoxReader, BoxWriter, CallError, CommandRegistry, FieldKind, Record, RemoteError,
    Schema, UNHANDLED_ERROR_CODE, UNKNOWN_ERROR_CODE, WireBox,
};
use weft_defer::{Outcome, gather};
use weft_reactor::{Protocol, Reactor};

use crate::common::{run_until_done, run_with_limit, serve, spawn_client, test_registry};

fn boxed(pairs: &[(&str, &str)]) -> WireBox {
    pairs.iter().copied().collect()
}

/// Connect a fresh client endpoint, make one call once connected, then stop
/// the reactor with whatever came back.
fn call_once(
    reactor: &Reactor,
    addr: SocketAddr,
    name: &'static str,
    args: Record,
    response: Schema,
) -> Option<Outcome<Record>> {
    let client = Amp::new(Rc::new(CommandRegistry::new()));
    reactor
        .connect_tcp(addr, Box::new(client.protocol()))
        .unwrap();

    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    let caller = client.clone();
    let stopper = reactor.clone();
    client
        .when_connected()
        .and_then(move |()| caller.call_remote(name, &args, response))
        .then(move |outcome| {
            *slot.borrow_mut() = Some(outcome);
            stopper.stop();
            Ok(())
        });

    run_with_limit(reactor);
    client.lose_connection();
    result.borrow_mut().take()
}

fn remote_error(outcome: Option<Outcome<Record>>) -> RemoteError {
    let failure = outcome.expect("call never finished").unwrap_err();
    failure
        .downcast::<RemoteError>()
        .expect("expected a RemoteError")
}

#[test]
fn blocking_client_gets_answers_and_errors() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let (client, done) = spawn_client(port.local_addr(), |addr| {
        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BoxReader::new(stream.try_clone().unwrap());
        let mut writer = BoxWriter::new(stream);

        writer
            .write_box(&boxed(&[("_command", "sum"), ("_ask", "1"), ("a", "13"), ("b", "81")]))
            .unwrap();
        let sum = reader.read_box().unwrap().unwrap();

        writer
            .write_box(&boxed(&[("_command", "nope"), ("_ask", "2")]))
            .unwrap();
        let unhandled = reader.read_box().unwrap().unwrap();

        writer
            .write_box(&boxed(&[("_command", "fail"), ("_ask", "3"), ("reason", "boom")]))
            .unwrap();
        let failed = reader.read_box().unwrap().unwrap();

        (sum, unhandled, failed)
    });

    run_until_done(&reactor, done);
    let (sum, unhandled, failed) = client.join().unwrap();

    assert_eq!(sum, boxed(&[("_answer", "1"), ("total", "94")]));
    assert_eq!(unhandled.get("_error"), Some(&b"2"[..]));
    assert_eq!(
        unhandled.get("_error_code"),
        Some(UNHANDLED_ERROR_CODE.as_bytes())
    );
    assert_eq!(failed.get("_error"), Some(&b"3"[..]));
    assert_eq!(failed.get("_error_code"), Some(UNKNOWN_ERROR_CODE.as_bytes()));
    assert_eq!(failed.get("_error_description"), Some(&b"boom"[..]));
}

#[test]
fn byte_at_a_time_delivery_still_answers() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let (client, done) = spawn_client(port.local_addr(), |addr| {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_nodelay(true).unwrap();
        let request = boxed(&[("_command", "echo"), ("_ask", "7"), ("value", "slow going")])
            .encode()
            .unwrap();
        for byte in &request {
            stream.write_all(slice::from_ref(byte)).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        BoxReader::new(stream).read_box().unwrap().unwrap()
    });

    run_until_done(&reactor, done);
    assert_eq!(
        client.join().unwrap(),
        boxed(&[("_answer", "7"), ("value", "slow going")])
    );
}

#[test]
fn free_standing_command_gets_no_reply() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let (client, done) = spawn_client(port.local_addr(), |addr| {
        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BoxReader::new(stream.try_clone().unwrap());
        let mut writer = BoxWriter::new(stream);
        writer
            .write_box(&boxed(&[("_command", "sum"), ("a", "1"), ("b", "2")]))
            .unwrap();
        writer
            .write_box(&boxed(&[("_command", "ping"), ("_ask", "1")]))
            .unwrap();
        // The first box back answers the ping; the sum was never answered.
        reader.read_box().unwrap().unwrap()
    });

    run_until_done(&reactor, done);
    assert_eq!(client.join().unwrap(), boxed(&[("_answer", "1")]));
}

#[test]
fn call_remote_between_two_endpoints() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let outcome = call_once(
        &reactor,
        port.local_addr(),
        "sum",
        Record::new().with("a", 13).with("b", 81),
        Schema::new().field("total", FieldKind::Integer),
    );
    let record = outcome.expect("call never finished").unwrap();
    assert_eq!(record.get_integer("total"), Some(94));
}

#[test]
fn deferred_answer_arrives_after_timer() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let outcome = call_once(
        &reactor,
        port.local_addr(),
        "slow",
        Record::new().with("n", 5),
        Schema::new().field("n", FieldKind::Integer),
    );
    let record = outcome.expect("call never finished").unwrap();
    assert_eq!(record.get_integer("n"), Some(5));
}

#[test]
fn handler_failure_reaches_caller_as_remote_error() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let outcome = call_once(
        &reactor,
        port.local_addr(),
        "fail",
        Record::new().with("reason", "no such widget"),
        Schema::new(),
    );
    let error = remote_error(outcome);
    assert_eq!(error.code, UNKNOWN_ERROR_CODE);
    assert_eq!(error.description, "no such widget");
}

#[test]
fn unknown_command_reaches_caller_as_unhandled() {
    let reactor = Reactor::new();
    let port = serve(&reactor);

    let outcome = call_once(
        &reactor,
        port.local_addr(),
        "launch",
        Record::new(),
        Schema::new(),
    );
    assert_eq!(remote_error(outcome).code, UNHANDLED_ERROR_CODE);
}

#[test]
fn server_closing_fails_pending_calls() {
    let reactor = Reactor::new();

    // Keep hold of every server endpoint so the test can hang up.
    let servers: Rc<RefCell<Vec<Amp>>> = Rc::new(RefCell::new(Vec::new()));
    let registry = Rc::new(test_registry(&reactor));
    let accepted = Rc::clone(&servers);
    let port = reactor
        .listen_on("127.0.0.1:0", move |_peer: SocketAddr| -> Box<dyn Protocol> {
            let amp = Amp::new(Rc::clone(&registry));
            accepted.borrow_mut().push(amp.clone());
            Box::new(amp.protocol())
        })
        .unwrap();

    let hang_up = Rc::clone(&servers);
    reactor.call_later(Duration::from_millis(50), move || {
        for server in hang_up.borrow().iter() {
            server.lose_connection();
        }
    });

    let outcome = call_once(&reactor, port.local_addr(), "hang", Record::new(), Schema::new());
    let failure = outcome.expect("call never finished").unwrap_err();
    assert_eq!(
        failure.downcast_ref::<CallError>(),
        Some(&CallError::ConnectionLost)
    );
    assert_eq!(servers.borrow().len(), 1);
}

#[test]
fn parallel_calls_gather_in_call_order() {
    let reactor = Reactor::new();
    let port = serve(&reactor);
    let client = Amp::new(Rc::new(CommandRegistry::new()));
    reactor
        .connect_tcp(port.local_addr(), Box::new(client.protocol()))
        .unwrap();

    let totals = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&totals);
    let caller = client.clone();
    let stopper = reactor.clone();
    client
        .when_connected()
        .and_then(move |()| {
            // The slow call is answered last but stays first in the result.
            let slow = caller.call_remote(
                "slow",
                &Record::new().with("n", 1),
                Schema::new().field("n", FieldKind::Integer),
            );
            let quick = caller.call_remote(
                "sum",
                &Record::new().with("a", 1).with("b", 1),
                Schema::new().field("total", FieldKind::Integer),
            );
            gather(vec![slow, quick])
        })
        .then(move |outcome| {
            *slot.borrow_mut() = Some(outcome.map(|records| {
                records
                    .iter()
                    .map(|record| record.get_integer("n").or_else(|| record.get_integer("total")))
                    .collect::<Vec<_>>()
            }));
            stopper.stop();
            Ok(())
        });

    run_with_limit(&reactor);
    client.lose_connection();
    let totals = totals.borrow_mut().take().expect("calls never finished");
    assert_eq!(totals.unwrap(), [Some(1), Some(2)]);
}

#[test]
fn refused_connect_fails_the_endpoint() {
    // Nothing listens on a port that was bound and released.
    let addr = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let reactor = Reactor::new();
    let client = Amp::new(Rc::new(CommandRegistry::new()));
    reactor
        .connect_tcp(addr, Box::new(client.protocol()))
        .unwrap();

    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    let stopper = reactor.clone();
    client.when_connected().then(move |outcome| {
        *slot.borrow_mut() = Some(outcome);
        stopper.stop();
        Ok(())
    });

    run_with_limit(&reactor);
    let failure = result
        .borrow_mut()
        .take()
        .expect("connect never resolved")
        .unwrap_err();
    assert_eq!(
        failure.downcast_ref::<CallError>(),
        Some(&CallError::ConnectionLost)
    );
    assert!(!client.is_connected());
}

