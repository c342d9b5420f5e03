use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;

use ctstream::cli::{Cli, OutputFormat};
use ctstream::consumer::{Consumer, Event};
use ctstream::error::CtError;
use ctstream::privilege;

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

fn exit_code(err: &CtError) -> i32 {
    match err {
        CtError::InsufficientPermission(_) => 1,
        CtError::Socket(_) | CtError::SocketClosed => 2,
        CtError::Namespace(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> Result<(), CtError> {
    install_signal_handlers();
    privilege::check_netlink_access()?;

    let consumer = Consumer::new(cli.proc_root.clone(), cli.rate_limit, cli.all_namespaces);

    // Phase one: drain the existing table when a dump was requested.
    if let Some(family) = cli.dump {
        let rx = consumer.dump_table(family.family())?;
        for event in rx.iter() {
            print_event("dump", &event, cli.format);
            if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        print_stats(&consumer, cli.format);
        return Ok(());
    }

    // Phase two: stream new-connection events.
    let rx = consumer.events()?;
    let deadline = cli
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));

    stream_events(&rx, deadline, cli.format);

    consumer.stop();
    drain_remaining(&rx);

    print_stats(&consumer, cli.format);
    Ok(())
}

fn stream_events(rx: &Receiver<Event>, deadline: Option<Instant>, format: OutputFormat) {
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            return;
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return;
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => print_event("event", &event, format),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Give the receive worker a moment to observe the closed socket, then
/// let the channel drop.
fn drain_remaining(rx: &Receiver<Event>) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[derive(Serialize)]
struct EventSummary {
    phase: &'static str,
    messages: usize,
    netns: Option<i32>,
    types: Vec<u16>,
}

fn print_event(phase: &'static str, event: &Event, format: OutputFormat) {
    if event.is_empty() {
        return;
    }
    match format {
        OutputFormat::Summary => {
            let netns = event
                .netns()
                .map_or_else(String::new, |id| format!(" netns={id}"));
            println!("{phase}: {} message(s){netns}", event.len());
        }
        OutputFormat::Json => {
            let summary = EventSummary {
                phase,
                messages: event.len(),
                netns: event.netns(),
                types: event.messages().map(|m| m.header.ty).collect(),
            };
            if let Ok(line) = serde_json::to_string(&summary) {
                println!("{line}");
            }
        }
    }
}

fn print_stats(consumer: &Consumer, format: OutputFormat) {
    let stats = consumer.stats();
    match format {
        OutputFormat::Summary => {
            println!(
                "stats: enobufs={} throttles={} sampling_pct={} read_errors={} msg_errors={}",
                stats.enobufs,
                stats.throttles,
                stats.sampling_pct,
                stats.read_errors,
                stats.msg_errors
            );
        }
        OutputFormat::Json => {
            if let Ok(line) = serde_json::to_string(&stats) {
                println!("{line}");
            }
        }
    }
}
