//! Throughput benchmark over two in-process buses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use courier_core::config::load_bus_config;
use courier_core::{
    DestinationSession, LocalNetwork, LocalWire, Message, MessageBus, MessageBusParams, Reply, Routable,
    SimpleMessage, SimpleProtocol, SourceSessionParams,
};
use courier_types::config::BusConfig;
use courier_types::{ErrorCode, Route};

use super::BenchArgs;

const CLIENT: &str = "client";
const SERVER: &str = "server";
const INBOX: &str = "inbox";

/// Outcome of one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub messages: u64,
    pub replies: u64,
    pub errors: u64,
    /// Sends refused without a reply (closed session, bad route text).
    pub rejected: u64,
    pub elapsed: Duration,
    /// Error replies by error code name.
    pub error_codes: BTreeMap<String, u64>,
}

impl BenchReport {
    /// Replies per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.replies as f64 / secs } else { 0.0 }
    }
}

#[derive(Default)]
struct Tally {
    replies: AtomicU64,
    errors: AtomicU64,
    codes: Mutex<BTreeMap<String, u64>>,
}

impl Tally {
    fn record(&self, reply: &Reply) {
        self.replies.fetch_add(1, Ordering::Relaxed);
        if let Some(first) = reply.errors().first() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            if let Ok(mut codes) = self.codes.lock() {
                *codes.entry(first.code.name()).or_default() += 1;
            }
        }
    }
}

fn acknowledge(inbox: &OnceLock<Weak<DestinationSession>>, mut msg: Message) {
    match inbox.get().and_then(Weak::upgrade) {
        Some(session) => session.acknowledge(msg),
        None => msg.discard(),
    }
}

/// Send `args.messages` messages from a client bus to an acknowledging
/// destination on a server bus, blocking whenever the throttle policy says
/// the session is full.
pub async fn run_bench(args: &BenchArgs, config: &BusConfig, progress: &ProgressBar) -> Result<BenchReport> {
    let route = Route::parse(&args.route).with_context(|| format!("invalid route '{}'", args.route))?;

    let wire = LocalWire::new();
    let params = || MessageBusParams::from_config(config).with_protocol(Arc::new(SimpleProtocol::new()));
    let server = MessageBus::new(LocalNetwork::new(&wire, SERVER), params())?;
    let client = MessageBus::new(LocalNetwork::new(&wire, CLIENT), params())?;

    let inbox: Arc<OnceLock<Weak<DestinationSession>>> = Arc::new(OnceLock::new());
    let slot = inbox.clone();
    let destination =
        server.create_destination_session(INBOX, Arc::new(move |msg: Message| acknowledge(&slot, msg)))?;
    let _ = inbox.set(Arc::downgrade(&destination));

    let tally = Arc::new(Tally::default());
    let counter = tally.clone();
    let bar = progress.clone();
    let source = client.create_source_session(SourceSessionParams::from_config(
        &config.source,
        Arc::new(move |reply: Reply| {
            counter.record(&reply);
            bar.inc(1);
        }),
    ))?;

    let started = Instant::now();
    let mut rejected = 0;
    for i in 0..args.messages {
        let mut msg = Message::new(SimpleMessage::new(format!("message {i}"))).with_route(route.clone());
        if let Some(ids) = args.sequenced {
            msg = msg.with_sequence_id(i % ids);
        }
        if let Err(err) = source.send_blocking(msg).await {
            debug!(code = %err.code(), "send rejected: {err}");
            // a timed-out blocking send is also answered through the reply handler
            if err.code() != ErrorCode::TIMEOUT {
                rejected += 1;
                progress.inc(1);
            }
        }
    }

    source.close().await;
    client.sync().await;
    let elapsed = started.elapsed();

    client.destroy().await;
    server.destroy().await;
    progress.finish_and_clear();

    let error_codes = tally.codes.lock().map(|codes| codes.clone()).unwrap_or_default();
    Ok(BenchReport {
        messages: args.messages,
        replies: tally.replies.load(Ordering::Relaxed),
        errors: tally.errors.load(Ordering::Relaxed),
        rejected,
        elapsed,
        error_codes,
    })
}

/// Run the benchmark and print its report.
pub async fn bench(args: BenchArgs, json: bool, quiet: bool) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_bus_config(path).await,
        None => BusConfig::default(),
    };

    let progress = if json || quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(args.messages);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );
        bar.set_message("sending");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    };

    let report = run_bench(&args, &config, &progress).await?;

    if json {
        let out = serde_json::json!({
            "messages": report.messages,
            "replies": report.replies,
            "errors": report.errors,
            "rejected": report.rejected,
            "error_codes": report.error_codes,
            "elapsed_ms": report.elapsed.as_millis() as u64,
            "throughput_per_sec": report.throughput(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if quiet {
        return Ok(());
    }

    println!();
    println!(
        "  {} {} messages over {}",
        style("Bench").bold(),
        report.messages,
        style(&args.route).cyan(),
    );
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Metric").fg(Color::White),
        Cell::new("Value").fg(Color::White),
    ]);
    table.add_row(vec![Cell::new("Replies"), Cell::new(report.replies).fg(Color::Cyan)]);
    let error_color = if report.errors == 0 { Color::DarkGrey } else { Color::Red };
    table.add_row(vec![Cell::new("Errors"), Cell::new(report.errors).fg(error_color)]);
    for (code, count) in &report.error_codes {
        table.add_row(vec![Cell::new(format!("  {code}")), Cell::new(count).fg(Color::Red)]);
    }
    table.add_row(vec![Cell::new("Rejected"), Cell::new(report.rejected)]);
    table.add_row(vec![
        Cell::new("Elapsed"),
        Cell::new(format!("{:.3}s", report.elapsed.as_secs_f64())),
    ]);
    table.add_row(vec![
        Cell::new("Throughput"),
        Cell::new(format!("{:.0} msg/s", report.throughput())).fg(Color::Green),
    ]);
    println!("{table}");
    println!();
    Ok(())
}
