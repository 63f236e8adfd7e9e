//! caget command - read or monitor Channel Access PVs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::mpsc;

use calink::{AccessRights, ChannelNotify, Context, Dbr, DbrType, Status, dbe};

#[derive(Parser)]
#[command(name = "caget", version, about = "Read or monitor Channel Access PVs")]
struct Cli {
    /// PV names to read.
    #[arg(required = true)]
    pvs: Vec<String>,

    /// Keep the channels open and print every update.
    #[arg(short = 'm', long)]
    monitor: bool,

    /// Seconds to wait for a connection before giving up.
    #[arg(short = 'w', long, default_value_t = 5.0)]
    wait: f64,

    /// Element count to request (0 = native).
    #[arg(short = 'c', long, default_value_t = 1)]
    count: u32,

    /// Channel priority (0-99).
    #[arg(short = 'p', long, default_value_t = 0)]
    priority: u8,
}

/// Forwards channel state changes onto the main task.
struct StateToChannel {
    name: String,
    tx: mpsc::UnboundedSender<Event>,
}

enum Event {
    Connected(String),
    Disconnected(String),
    Sample(String, Result<Dbr, calink::CaException>),
}

impl ChannelNotify for StateToChannel {
    fn connect(&self) {
        let _ = self.tx.send(Event::Connected(self.name.clone()));
    }

    fn disconnect(&self) {
        let _ = self.tx.send(Event::Disconnected(self.name.clone()));
    }

    fn access_rights(&self, rights: AccessRights) {
        tracing::debug!(pv = %self.name, %rights, "access rights");
    }

    fn write_exception(&self, status: Status, context: &str) {
        tracing::warn!(pv = %self.name, %status, context, "write rejected");
    }
}

fn format_value(value: &Dbr) -> String {
    match value {
        Dbr::String(v) => v.join(" "),
        Dbr::Short(v) => join(v),
        Dbr::Float(v) => join(v),
        Dbr::Enum(v) => join(v),
        Dbr::Char(v) => join(v),
        Dbr::Long(v) => join(v),
        Dbr::Double(v) => join(v),
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context::new().context("creating the client context")?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut channels = Vec::new();
    for pv in &cli.pvs {
        let notify = Arc::new(StateToChannel {
            name: pv.clone(),
            tx: tx.clone(),
        });
        let chan = ctx
            .create_channel(pv, notify, cli.priority)
            .with_context(|| format!("creating channel \"{pv}\""))?;
        channels.push(chan);
    }

    // Phase one: wait for connections and issue the reads. Samples that
    // arrive while other channels are still connecting are kept aside.
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(cli.wait);
    let mut handled = std::collections::HashSet::new();
    let mut backlog = Vec::new();
    let mut failures = 0usize;

    while handled.len() < channels.len() {
        let event = tokio::select! {
            event = rx.recv() => event.expect("event channel closed"),
            _ = tokio::time::sleep_until(deadline) => {
                for chan in &channels {
                    if handled.insert(chan.name().to_string()) {
                        eprintln!("{}: never connected", chan.name());
                        failures += 1;
                    }
                }
                break;
            }
        };
        match event {
            Event::Connected(name) => {
                if !handled.insert(name.clone()) {
                    continue;
                }
                let chan = channels
                    .iter()
                    .find(|c| c.name() == name)
                    .expect("event for unknown channel");
                let sample_tx = tx.clone();
                let pv = name.clone();
                if cli.monitor {
                    chan.subscribe(DbrType::Double, cli.count, dbe::VALUE, move |sample| {
                        let _ = sample_tx.send(Event::Sample(pv.clone(), sample));
                    })
                    .await?;
                } else {
                    chan.read_notify(DbrType::Double, cli.count, move |sample| {
                        let _ = sample_tx.send(Event::Sample(pv.clone(), sample));
                    })
                    .await?;
                }
            }
            sample @ Event::Sample(..) => backlog.push(sample),
            Event::Disconnected(_) => {}
        }
    }

    // Phase two: print results (forever in monitor mode).
    let mut reads_left = handled.len() - failures;
    let mut pending_events = backlog.into_iter();
    while cli.monitor || reads_left > 0 {
        let event = match pending_events.next() {
            Some(event) => event,
            None => rx.recv().await.expect("event channel closed"),
        };
        match event {
            Event::Sample(name, Ok(value)) => {
                println!("{name} {}", format_value(&value));
                if !cli.monitor {
                    reads_left -= 1;
                }
            }
            Event::Sample(name, Err(e)) => {
                eprintln!("{name}: {e}");
                if !cli.monitor {
                    reads_left -= 1;
                    failures += 1;
                }
            }
            Event::Disconnected(name) => eprintln!("{name}: disconnected"),
            Event::Connected(_) => {}
        }
    }

    ctx.destroy().await;
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
