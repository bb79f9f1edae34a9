use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use predicates::prelude::*;
use schimmyrank::controller::preds::{L1Norm, MaxIter};
use schimmyrank::controller::RankController;
use schimmyrank::generation::GenerationStore;
use schimmyrank::parameters::{RankParameters, Variant};
use schimmyrank::partitioner::{ModPartitioner, Partitioner, RangePartitioner};
use std::path::PathBuf;

/// How messages reach the nodes they are addressed to.
#[derive(ValueEnum, Debug, Clone, Copy, Default)]
enum CliVariant {
    /// Ship graph structure through the shuffle with the messages.
    Basic,
    /// Merge-join messages against the resident structure.
    #[default]
    Schimmy,
}

impl From<CliVariant> for Variant {
    fn from(v: CliVariant) -> Self {
        match v {
            CliVariant::Basic => Variant::Basic,
            CliVariant::Schimmy => Variant::Schimmy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "schimmyrank",
    about = "Iterate PageRank over a generation store, resuming from its newest generation.",
    long_about = None
)]
struct CliArgs {
    /// The directory holding the generations.
    store: PathBuf,

    #[arg(short, long, default_value_t = RankParameters::DEFAULT_ALPHA)]
    /// The random-jump probability α (must be in the interval [0 . . 1)).
    alpha: f64,

    #[arg(short, long, default_value_t = 4)]
    /// Number of partitions; must match the store.
    partitions: usize,

    #[arg(short = 'j', long, default_value_t = 4)]
    /// Number of worker threads.
    workers: usize,

    #[arg(long)]
    /// The store was laid out in contiguous id ranges over this many nodes
    /// instead of round-robin.
    range: Option<usize>,

    #[arg(long, value_enum, default_value_t = CliVariant::Schimmy)]
    variant: CliVariant,

    #[arg(long)]
    /// Do not pre-sum messages inside map tasks.
    no_combiner: bool,

    #[arg(long, default_value_t = 30)]
    /// Stop once the store holds this generation.
    max_iter: usize,

    #[arg(short, long)]
    /// Also stop when the ℓ₁ change between generations drops below this.
    threshold: Option<f64>,

    #[arg(long, default_value_t = 3)]
    /// Attempts per task before an iteration fails.
    attempts: usize,

    #[arg(long)]
    /// Keep spill and received-mass files after each iteration.
    keep_temp: bool,

    #[arg(long, default_value_t = 0)]
    /// Print the nodes with the highest rank.
    top: usize,
}

fn run<P: Partitioner>(args: &CliArgs, partitioner: P) -> Result<()> {
    let params = RankParameters::new()
        .set_alpha(args.alpha)
        .set_concurrency(args.partitions, args.workers)
        .set_variant(args.variant.into())
        .set_combiner(!args.no_combiner)
        .set_max_task_attempts(args.attempts)
        .set_keep_temp_files(args.keep_temp);
    let store = GenerationStore::open(&args.store)
        .with_context(|| format!("Could not open store {}", args.store.display()))?;
    let controller = RankController::new(params, partitioner, store)?;

    let mut predicate = MaxIter::from(args.max_iter).boxed();
    if let Some(threshold) = args.threshold {
        predicate = predicate.or(L1Norm::try_from(threshold)?).boxed();
    }
    let summary = controller
        .run(predicate)
        .with_context(|| format!("PageRank failed on {}", args.store.display()))?;

    if args.top > 0 {
        let mut nodes = controller.store().read_generation(summary.generation)?;
        nodes.sort_by(|a, b| b.mass.total_cmp(&a.mass).then(a.id.cmp(&b.id)));
        for node in nodes.iter().take(args.top) {
            println!("{}\t{:.9}", node.id, (node.mass as f64).exp());
        }
    }
    Ok(())
}

pub fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    ensure!(
        (0.0..1.0).contains(&args.alpha),
        "The random-jump probability must be in [0 . . 1), got {}",
        args.alpha
    );
    match args.range {
        Some(nodes) => run(&args, RangePartitioner::new(nodes)),
        None => run(&args, ModPartitioner),
    }
}
