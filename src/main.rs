//! daq_scan command line
//!
//! - `compose`: print the step matrix a composition command produces.
//! - `run`: execute scan plans and manual settings in order against simulated
//!   channels and print a JSON summary with the final result tensors.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use daq_scan::channel::{ChannelRegistry, ScanIo};
use daq_scan::composition::{compose, DestinationTable};
use daq_scan::config::ScanConfig;
use daq_scan::controller::ScanController;
use daq_scan::level::NO_GETTER;
use daq_scan::logging;
use daq_scan::mock::MockChannels;
use daq_scan::plan::ScanPlan;
use daq_scan::queue::{QueueItem, QueueRecord, ScanQueue};
use daq_scan::scan::{DataSnapshot, ScanEvent};
use uuid::Uuid;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Multi-level parameter scans for laboratory instruments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = daq_scan::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the matrix produced by a composition command
    Compose {
        /// Destination as NAME=v1,v2,... (repeatable)
        #[arg(short, long = "set", value_parser = parse_destination, required = true)]
        sets: Vec<(String, Vec<f64>)>,

        /// Composition command, e.g. "A+B,C"
        #[arg(short = 'm', long, default_value = "")]
        command: String,

        /// Ignore the command and lay destinations out sequentially
        #[arg(long)]
        auto: bool,
    },

    /// Run scan plans and manual settings, in order, against simulated channels
    Run {
        /// Scan plan files (TOML) and manual settings ("channel->value, ...")
        #[arg(required = true)]
        items: Vec<String>,

        /// Extra control channel names (repeatable)
        #[arg(long = "control")]
        controls: Vec<String>,
    },
}

fn parse_destination(text: &str) -> Result<(String, Vec<f64>), String> {
    let (name, values) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=v1,v2,... but got '{text}'"))?;
    let values = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<f64>().map_err(|e| format!("'{v}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name.trim().to_string(), values))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ScanConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::init_from_config(&config.application)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting {}", config.application.name);

    match args.command {
        Command::Compose {
            sets,
            command,
            auto,
        } => {
            print_composition(&sets.into_iter().collect(), &command, auto);
            Ok(())
        }
        Command::Run { items, controls } => run_queue(&config, &items, controls).await,
    }
}

fn print_composition(table: &DestinationTable, command: &str, auto: bool) {
    let composition = compose(Some(command), table, auto);
    for (channel, row) in composition.channels.iter().zip(composition.matrix.rows()) {
        let cells: Vec<String> = row
            .iter()
            .map(|v| if v.is_nan() { "-".to_string() } else { v.to_string() })
            .collect();
        println!("{channel:>4} | {}", cells.join("\t"));
    }
    if !composition.unknown_tokens.is_empty() {
        println!("ignored: {}", composition.unknown_tokens.join(", "));
    }
}

#[derive(Serialize)]
struct TensorSummary {
    scan: String,
    level: usize,
    getters: Vec<String>,
    shape: Vec<usize>,
    /// Row-major; NaN is written as null.
    values: Vec<f64>,
}

#[derive(Serialize)]
struct RunSummary {
    records: Vec<QueueRecord>,
    tensors: Vec<TensorSummary>,
}

/// A `channel->value` argument is a manual setting, anything else a plan file.
fn parse_item(config: &ScanConfig, arg: &str) -> Result<QueueItem> {
    if arg.contains("->") {
        return Ok(QueueItem::manual_set(arg)?);
    }
    let plan = ScanPlan::load_from(arg).with_context(|| format!("loading plan {arg}"))?;
    let levels = plan.into_levels(&config.engine)?;
    Ok(QueueItem::scan(plan.name, levels))
}

/// Every channel name the queued items mention.
fn mentioned_channels(items: &[QueueItem]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for item in items {
        match item {
            QueueItem::Scan { levels, .. } => {
                for level in levels {
                    names.extend(level.setters.iter().cloned());
                    names.extend(level.getters.iter().filter(|g| *g != NO_GETTER).cloned());
                    names.extend(level.before.iter().chain(&level.after).map(|e| e.channel.clone()));
                }
            }
            QueueItem::ManualSet(effects) => {
                names.extend(effects.iter().map(|e| e.channel.clone()));
            }
        }
    }
    names
}

/// Simulated rack behind a registry using the configured naming rule.
///
/// Explicit controls plus every mentioned channel whose name contains
/// "control" go to the control executor; every other channel is registered
/// under the equipment label the naming rule assigns it.
fn wire_channels(config: &ScanConfig, channels: &BTreeSet<String>, extra: Vec<String>) -> ScanIo {
    let mock = Arc::new(MockChannels::new());
    let controls: BTreeSet<String> = extra
        .into_iter()
        .chain(channels.iter().filter(|n| n.contains("control")).cloned())
        .collect();

    let mut registry = ChannelRegistry::from_config(&config.engine);
    for channel in channels.iter().filter(|n| !controls.contains(*n)) {
        match registry.label_for(channel) {
            Some(label) => registry.register(label, mock.equipment(label)),
            None => warn!(%channel, "Channel matches no equipment label"),
        }
    }

    let mut io = ScanIo::from_shared(Arc::new(registry))
        .with_control_executor(mock.clone())
        .with_hooks(mock);
    for name in controls {
        io = io.with_control(name);
    }
    io
}

async fn run_queue(config: &ScanConfig, args: &[String], controls: Vec<String>) -> Result<()> {
    let items = args
        .iter()
        .map(|arg| parse_item(config, arg))
        .collect::<Result<Vec<_>>>()?;
    let io = wire_channels(config, &mentioned_channels(&items), controls);
    let mut getters: HashMap<String, Vec<Vec<String>>> = HashMap::new();
    let mut queue = ScanQueue::new();
    for item in items {
        if let QueueItem::Scan { name, levels } = &item {
            getters.insert(name.clone(), levels.iter().map(|l| l.getters.clone()).collect());
        }
        queue.push(item);
    }

    let (handle, task) = ScanController::spawn(io, &config.engine);
    let mut events = handle.subscribe();
    let collector = tokio::spawn(async move {
        let mut last: Option<DataSnapshot> = None;
        let mut finished: HashMap<Uuid, DataSnapshot> = HashMap::new();
        loop {
            match events.recv().await {
                Ok(ScanEvent::NewDataPoint(snapshot)) => last = Some(snapshot),
                Ok(ScanEvent::RemainingPoints(points)) => info!(progress = %points, "point done"),
                Ok(ScanEvent::RemainingTime(time)) => info!(remaining = %time, "estimate"),
                Ok(ScanEvent::ScanFinished { scan_id, .. }) => {
                    if let Some(snapshot) = last.take() {
                        finished.insert(scan_id, snapshot);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped progress events"),
                Err(RecvError::Closed) => break,
            }
        }
        finished
    });
    let interrupt = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping scan");
                let _ = handle.request_stop().await;
            }
        })
    };

    info!(items = queue.len(), "Queue running");
    let records = queue.run(&handle).await;
    if !queue.is_empty() {
        warn!(skipped = queue.len(), "Queue items left unrun");
    }

    interrupt.abort();
    let _ = interrupt.await;
    handle.shutdown().await?;
    task.await?;
    drop(handle);
    let snapshots = collector.await?;

    let mut tensors = Vec::new();
    for record in &records {
        let QueueRecord::Scan { name, status } = record else {
            continue;
        };
        let Some(snapshot) = status.scan_id.and_then(|id| snapshots.get(&id)) else {
            continue;
        };
        for (level, tensor) in snapshot.tensors.iter().enumerate() {
            tensors.push(TensorSummary {
                scan: name.clone(),
                level,
                getters: getters
                    .get(name)
                    .and_then(|g| g.get(level))
                    .cloned()
                    .unwrap_or_default(),
                shape: tensor.shape().to_vec(),
                values: tensor.iter().copied().collect(),
            });
        }
    }

    println!("{}", serde_json::to_string_pretty(&RunSummary { records, tensors })?);
    Ok(())
}
