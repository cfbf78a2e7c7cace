//! weft - binary entry point.
//!
//! ```text
//! weft serve [port]       listen per config, answering ping, echo and sum
//! weft ping <host:port>   call `ping` on a server and report the round trip
//! weft dump <file>        print the boxes in a captured byte stream
//! ```
//!
//! Everything runs on one [`Reactor`] owned by `main`; the ping client goes
//! through the same reactor and AMP stack as the server.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::{env, fs, io};

use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use weft_amp::{Amp, CommandRegistry, FieldKind, Record, Schema, factory, parse_boxes};
use weft_config::{LogConfig, WeftConfig};
use weft_defer::{Failure, Outcome};
use weft_reactor::Reactor;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

const USAGE: &str = "usage: weft serve [port] | weft ping <host:port> | weft dump <file>";

fn init_tracing(log: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log.filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &log.file {
        match open_log_file(path) {
            Ok(file) => {
                tracing_subscriber::registry()
                    .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                    .with(env_filter)
                    .init();
                tracing::info!(path = %path.display(), "Logging initialized");
                return;
            }
            Err(err) => eprintln!("Failed to open log file {}: {err}", path.display()),
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

/// `ping`, plus two demo commands.
fn demo_registry() -> Result<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry
        .register(
            "echo",
            &["value"],
            Schema::new().field("value", FieldKind::Text),
            |value: String| -> Result<Record, Failure> { Ok(Record::new().with("value", value)) },
        )?
        .register(
            "sum",
            &["a", "b"],
            Schema::new().field("total", FieldKind::Integer),
            |a: i64, b: i64| -> Result<Record, Failure> {
                let total = a
                    .checked_add(b)
                    .with_context(|| format!("{a} + {b} overflows"))?;
                Ok(Record::new().with("total", total))
            },
        )?;
    Ok(registry)
}

fn serve(config: &WeftConfig, port: Option<u16>) -> Result<()> {
    let mut server = config.server();
    if let Some(port) = port {
        server.port = port;
    }

    let registry = Rc::new(demo_registry()?);
    tracing::info!(commands = ?registry.names().collect::<Vec<_>>(), "serving AMP");

    let reactor = Reactor::new();
    let listening = reactor
        .listen_on(server.bind_addr(), factory(registry))
        .with_context(|| format!("listening on {}", server.bind_addr()))?;
    println!("listening on {}", listening.local_addr());
    reactor.run()?;
    Ok(())
}

fn ping(addr: &str) -> Result<()> {
    let reactor = Reactor::new();
    let amp = Amp::new(Rc::new(CommandRegistry::new()));
    let peer = reactor
        .connect_tcp(addr, Box::new(amp.protocol()))
        .with_context(|| format!("connecting to {addr}"))?;

    let started = Instant::now();
    let result: Rc<RefCell<Option<Outcome<()>>>> = Rc::new(RefCell::new(None));
    let caller = amp.clone();
    let slot = Rc::clone(&result);
    let stopper = reactor.clone();
    amp.when_connected()
        .and_then(move |()| caller.call_remote("ping", &Record::new(), Schema::new()))
        .then(move |outcome| {
            *slot.borrow_mut() = Some(outcome.map(|_| ()));
            stopper.stop();
            Ok(())
        });

    let stopper = reactor.clone();
    let timeout = reactor.call_later(PING_TIMEOUT, move || stopper.stop());
    reactor.run()?;
    timeout.cancel();
    amp.lose_connection();

    let outcome = result.borrow_mut().take();
    match outcome {
        Some(Ok(())) => {
            println!("pong from {peer} in {:?}", started.elapsed());
            Ok(())
        }
        Some(Err(failure)) => Err(failure.context(format!("ping to {peer} failed"))),
        None => bail!("no answer from {peer} within {PING_TIMEOUT:?}"),
    }
}

fn dump(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed = parse_boxes(&bytes);
    for wire in &parsed.boxes {
        println!("{wire}");
    }
    if !parsed.trailing.is_empty() {
        eprintln!(
            "{} trailing bytes after the last complete box",
            parsed.trailing.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = match WeftConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => {
            eprintln!("Error: {err}");
            WeftConfig::default()
        }
    };
    init_tracing(&config.log());

    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["serve"] => serve(&config, None),
        ["serve", port] => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port {port:?}"))?;
            serve(&config, Some(port))
        }
        ["ping", addr] => ping(addr),
        ["dump", file] => dump(Path::new(file)),
        _ => bail!(USAGE),
    }
}
