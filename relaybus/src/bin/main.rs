use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use relaybus::{
    BusOptions, EventBus, EventHandler, HandlerRegistry, InMemoryIdempotencyCache, PublishObserver,
};
use relaybus_broker::in_memory::InMemoryBroker;
use relaybus_config::BusConfig;
use relaybus_models::core::EventRecord;
use relaybus_models::errors::{RuntimeError, SendableError};
use relaybus_utilities::startup;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "relaybus.loopback";

/// Publish a burst of events through an in-process broker and consume them again.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[command(flatten)]
    bus: BusConfig,

    #[arg(long, default_value_t = 10)]
    events: usize,

    #[arg(long, default_value = "loopback.ping")]
    route_key: String,

    /// Route through a delay queue for this many seconds.
    #[arg(long, default_value_t = 0)]
    delay_seconds: u32,

    /// Publish without confirms.
    #[arg(long, default_value_t = false)]
    fire_and_forget: bool,

    #[arg(long, default_value_t = 30)]
    wait_seconds: u64,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[arg(long)]
    log_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    sequence: usize,
}

struct PingHandler {
    handled: AtomicUsize,
    expected: usize,
    done: Arc<Notify>,
}

#[async_trait]
impl EventHandler<Ping> for PingHandler {
    async fn handle(&self, event: Ping, _cancel: CancellationToken) -> Result<bool, SendableError> {
        let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Handled ping {} ({handled}/{})", event.sequence, self.expected);
        if handled >= self.expected {
            self.done.notify_one();
        }
        Ok(true)
    }
}

struct LoggingObserver;

#[async_trait]
impl PublishObserver for LoggingObserver {
    async fn on_acked(&self, events: Vec<EventRecord>) {
        info!("Broker acked {} ping(s)", events.len());
    }

    async fn on_nacked(&self, events: Vec<EventRecord>) {
        warn!("Broker nacked {} ping(s)", events.len());
    }

    async fn on_returned(&self, events: Vec<EventRecord>) {
        warn!("Broker returned {} unroutable ping(s)", events.len());
    }
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    startup::startup("Relaybus Loopback", args.log_level, args.log_file.as_deref())?;

    let broker = InMemoryBroker::new();
    let options = BusOptions::from(&args.bus);
    let bus = EventBus::new(
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Arc::new(InMemoryIdempotencyCache::new()),
        options.clone(),
    );

    let done = Arc::new(Notify::new());
    let handler = PingHandler {
        handled: AtomicUsize::new(0),
        expected: args.events,
        done: done.clone(),
    };
    bus.start(HandlerRegistry::new().single::<Ping, _>(QUEUE, &args.route_key, handler))
        .await?;

    let records = build_records(args.events, &args.route_key)?;
    if args.fire_and_forget {
        bus.publish_non_confirm(&records, args.delay_seconds).await;
    } else {
        let publish = relaybus::PublishOptions {
            delay_seconds: args.delay_seconds,
            ..options.publish.clone()
        };
        let report = bus.publish(&records, Arc::new(LoggingObserver), &publish).await;
        info!(
            "Confirm report: {} acked, {} nacked, {} returned, {} unresolved",
            report.acked,
            report.nacked,
            report.returned,
            report.unresolved.len()
        );
    }

    // the in-memory broker only expires delayed messages when poked
    let ticker = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                broker.tick();
            }
        })
    };

    let waited = tokio::time::timeout(Duration::from_secs(args.wait_seconds), done.notified()).await;
    ticker.abort();
    bus.shutdown().await;

    if waited.is_err() {
        error!("Not every ping came back within {}s", args.wait_seconds);
        return Err(RuntimeError::new("loopback.timeout", "pings were lost").boxed());
    }
    info!("All {} ping(s) made the round trip", args.events);
    Ok(())
}

fn build_records(count: usize, route_key: &str) -> Result<Vec<EventRecord>, SendableError> {
    (0..count)
        .map(|sequence| {
            EventRecord::from_payload(
                sequence as i64,
                format!("ping-{sequence}"),
                route_key,
                &Ping { sequence },
            )
            .map_err(|err| Box::new(err) as SendableError)
        })
        .collect()
}
