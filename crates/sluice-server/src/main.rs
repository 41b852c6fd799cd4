//! Sluice standalone runner
//!
//! Runs the block-splitting demo pipeline: a source fills pooled blocks of
//! integers, a splitter breaks each block into items and hands the empty
//! block back to the pool, and a sink checksums the items.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sluice_core::config::keys;
use sluice_core::metrics::PerfReport;
use sluice_core::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sluice - multi-threaded dataflow engine demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads (defaults to the number of CPUs)
    #[arg(short, long, env = "SLUICE_NTHREADS")]
    nthreads: Option<usize>,

    /// Number of blocks the source produces
    #[arg(long, default_value_t = 10_000)]
    blocks: u64,

    /// Items per block
    #[arg(long, default_value_t = 256)]
    block_size: usize,

    /// Items per execute call
    #[arg(long)]
    chunksize: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Progress report interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    report_ms: u64,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Engine parameter, repeatable (e.g. -P sluice:fairness=round_robin)
    #[arg(short = 'P', value_name = "KEY=VALUE")]
    params: Vec<String>,
}

type Block = Vec<u64>;

/// Fills pooled blocks with consecutive integers.
struct BlockSource {
    pool: Arc<ItemPool<Block>>,
    block_size: usize,
    remaining: u64,
    next: u64,
}

impl ItemSource<Block> for BlockSource {
    fn poll(&mut self) -> SourcePoll<Block> {
        if self.remaining == 0 {
            return SourcePoll::Exhausted;
        }
        let Some(mut block) = self.pool.acquire() else {
            return SourcePoll::Empty;
        };
        let end = self.next + self.block_size as u64;
        block.extend(self.next..end);
        self.next = end;
        self.remaining -= 1;
        SourcePoll::Item(block)
    }
}

/// Moves items out of a block, a bounded number per call.
struct BlockSplitter {
    pool: Arc<ItemPool<Block>>,
    max_per_call: usize,
}

impl Splitter<Block, u64> for BlockSplitter {
    fn split(&mut self, block: &mut Block, out: &mut Vec<u64>) -> Result<SplitProgress, StageError> {
        let take = block.len().min(self.max_per_call);
        let at = block.len() - take;
        out.extend(block.drain(at..));
        Ok(if block.is_empty() {
            SplitProgress::Done
        } else {
            SplitProgress::Partial
        })
    }

    fn recycle(&mut self, block: Block) {
        self.pool.release(block);
    }
}

#[derive(Debug, Default)]
struct Checksum {
    sum: AtomicU64,
    count: AtomicU64,
}

struct ChecksumProcessor(Arc<Checksum>);

impl Processor<u64> for ChecksumProcessor {
    fn process(&self, item: &u64) -> Result<(), StageError> {
        self.0.sum.fetch_add(*item, Ordering::Relaxed);
        self.0.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finish(&self) -> Result<(), StageError> {
        info!(
            "Checksum processor done: {} items, sum {}",
            self.0.count.load(Ordering::Relaxed),
            self.0.sum.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

fn resolve_config(args: &Args) -> Result<EngineConfig> {
    let mut params = Parameters::new();
    for assignment in &args.params {
        params
            .set_assignment(assignment)
            .with_context(|| format!("bad parameter '{assignment}'"))?;
    }
    if let Some(n) = args.nthreads {
        params.set(keys::NTHREADS, n);
    }
    if let Some(n) = args.chunksize {
        params.set(keys::CHUNKSIZE, n);
    }
    let config = EngineConfig::from_parameters(&params).context("invalid engine parameters")?;
    for (key, value) in params.iter() {
        info!("Parameter {key} = {value}");
    }
    Ok(config)
}

fn build_topology(args: &Args, config: &EngineConfig, checksum: &Arc<Checksum>) -> Result<Topology> {
    let pool = Arc::new(
        ItemPool::from_config(config, {
            let block_size = args.block_size;
            move || Vec::with_capacity(block_size)
        })
        .with_reset(Vec::clear),
    );

    let mut topology = Topology::new();
    let blocks = topology.add_queue::<Block>("blocks", config.queue_threshold)?;
    let items = topology.add_queue::<u64>("items", config.queue_threshold * args.block_size.max(1))?;

    let source = topology.add_stage(
        "block_source",
        StageKind::Source,
        false,
        SourceStage::new(
            BlockSource {
                pool: Arc::clone(&pool),
                block_size: args.block_size,
                remaining: args.blocks,
                next: 0,
            },
            Arc::clone(&blocks),
        ),
    )?;
    let splitter = topology.add_stage(
        "block_splitter",
        StageKind::Interior,
        false,
        SplitStage::new(
            BlockSplitter {
                pool,
                max_per_call: config.chunksize.max(1),
            },
            blocks,
            Arc::clone(&items),
        ),
    )?;
    let sink = topology.add_stage(
        "checksum_sink",
        StageKind::Sink,
        true,
        SinkStage::new(items).with_processor(ChecksumProcessor(Arc::clone(checksum))),
    )?;

    topology.connect(source, splitter)?;
    topology.connect(splitter, sink)?;
    topology.mark_source(source)?;
    topology.mark_sink(sink)?;
    Ok(topology)
}

fn print_report(report: &PerfReport) {
    let t = &report.topology;
    println!(
        "{} events in {:.3}s ({:.0} Hz) on {} workers",
        t.events_completed,
        t.uptime.as_secs_f64(),
        t.avg_throughput_hz,
        t.nthreads
    );
    println!(
        "{:<16} {:>9} {:>10} {:>12} {:>12} {:>9}",
        "stage", "state", "calls", "items", "avg_latency", "backoffs"
    );
    for s in &report.stages {
        println!(
            "{:<16} {:>9} {:>10} {:>12} {:>12} {:>9}",
            s.name,
            s.state.to_string(),
            s.invocations,
            s.items_processed,
            format!("{:?}", s.avg_latency),
            s.backoff_exhaustions
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("sluice={0},sluice_core={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sluice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    let checksum = Arc::new(Checksum::default());
    let topology = build_topology(&args, &config, &checksum)?;

    let controller = Controller::new(topology, config)?;
    controller.start()?;

    let interval = Duration::from_millis(args.report_ms.max(1));
    while !controller.wait_until_finished_timeout(interval) {
        let summary = controller.measure_perf();
        info!(
            "{} events, {:.0} Hz latest, {} stages running",
            summary.events_completed, summary.latest_throughput_hz, summary.running_stages
        );
        let stalled = controller.stalled_workers();
        if !stalled.is_empty() {
            warn!("Stalled workers: {stalled:?}");
        }
    }
    controller.wait_until_stopped()?;

    if let Some(failure) = controller.failure() {
        bail!("pipeline failed: {failure}");
    }

    let report = controller.perf_report();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let total = args.blocks * args.block_size as u64;
    let expected_sum = total.saturating_sub(1).saturating_mul(total) / 2;
    let (count, sum) = (
        checksum.count.load(Ordering::Relaxed),
        checksum.sum.load(Ordering::Relaxed),
    );
    if count != total || sum != expected_sum {
        bail!("checksum mismatch: {count} items summing to {sum}, expected {total} / {expected_sum}");
    }
    info!("Checksum verified");
    Ok(())
}
