//! Trellis CLI - train and evaluate logical query answering over
//! knowledge graphs.
//!
//! # Usage
//!
//! ```bash
//! # Train the neural-symbolic family on path and intersection tasks
//! trellis --train --valid --ee --data-path data/FB15k-237 \
//!     --family ns --tasks 1p.2p.3p.2i.3i --max-steps 100000
//!
//! # Evaluate a finished run on the test splits
//! trellis --test --ee --se --data-path data/FB15k-237 \
//!     --family ns --checkpoint-path logs/FB15k-237/1p.2p.3p.2i.3i/ns/run
//! ```

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::ProgressBar;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trellis_kge::config::{ModelFamily, RunConfig};
use trellis_kge::data::{load_bin, partition_train, Dataset, GraphStats, TRIPLES_FILE};
use trellis_kge::models::build_model;
use trellis_kge::rules;
use trellis_kge::train::evaluate;
use trellis_kge::{
    Adam, BatchCycler, CheckpointManager, JsonlSink, NeighborIndex, Optimizer, PretrainedBundle,
    TrainLoop,
};
use trellis_reason::{parse_task_list, RelationMatrix, StructureRegistry, UnionMode};

const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Multi-hop logical query training over knowledge graphs", long_about = None)]
struct Args {
    /// Run training
    #[arg(long = "train")]
    do_train: bool,

    /// Evaluate on validation splits during and after training
    #[arg(long = "valid")]
    do_valid: bool,

    /// Evaluate on test splits
    #[arg(long = "test")]
    do_test: bool,

    /// Dataset directory holding the query/answer artifacts
    #[arg(long, value_name = "DIR")]
    data_path: PathBuf,

    /// Dot-separated task list
    #[arg(long, default_value = "1p.2p.3p.2i.3i.ip.pi.2in.3in.inp.pin.pni.2u.up")]
    tasks: String,

    /// Model family: vec, box, beta, or ns
    #[arg(long, default_value = "vec")]
    family: ModelFamily,

    /// Union evaluation mode: DNF or DM
    #[arg(long, default_value = "DNF")]
    union_mode: UnionMode,

    /// Embedding dimension
    #[arg(long, default_value = "500")]
    hidden_dim: usize,

    /// Margin separating answers from non-answers
    #[arg(long, default_value = "12.0")]
    gamma: f64,

    /// Negative samples per query
    #[arg(long, default_value = "128")]
    negative_sample_size: usize,

    /// Training batch size
    #[arg(short = 'b', long, default_value = "1024")]
    batch_size: usize,

    /// Evaluation batch size
    #[arg(long, default_value = "1")]
    test_batch_size: usize,

    /// Initial learning rate
    #[arg(long, default_value = "0.0001")]
    learning_rate: f64,

    /// Total training steps
    #[arg(long, default_value = "1000000")]
    max_steps: u64,

    /// Step after which the learning rate decays once; half of
    /// max-steps when omitted
    #[arg(long)]
    warm_up_steps: Option<u64>,

    /// Checkpoint every this many steps
    #[arg(long, default_value = "1000")]
    save_checkpoint_steps: u64,

    /// Evaluate every this many steps
    #[arg(long, default_value = "10000")]
    valid_steps: u64,

    /// Log averaged training losses every this many steps
    #[arg(long, default_value = "100")]
    log_steps: u64,

    /// Log evaluation progress every this many queries
    #[arg(long, default_value = "10000")]
    test_log_steps: u64,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Semicolon-separated per-task loss weights, one per task
    #[arg(long, value_name = "W;W;...")]
    loss_weights: Option<String>,

    /// Directory holding pretrained link-prediction embeddings
    #[arg(long, value_name = "DIR")]
    pretrain: Option<PathBuf>,

    /// Root directory for run outputs
    #[arg(long, default_value = "logs")]
    prefix: PathBuf,

    /// Existing run directory to resume from
    #[arg(long, value_name = "DIR")]
    checkpoint_path: Option<PathBuf>,

    /// Densify the graph with cached horn rules
    #[arg(long = "use-rule")]
    use_rule: bool,

    /// Longest rule body the cache was mined with
    #[arg(long, default_value = "3")]
    rule_len: usize,

    /// Minimum rule confidence to apply
    #[arg(long, default_value = "0.5")]
    rule_thr: f64,

    /// Outgoing edges kept per entity in the neighborhood index
    #[arg(long, default_value = "64")]
    max_neighbor: usize,

    /// Evaluate queries whose entities were all seen in training
    #[arg(long)]
    ee: bool,

    /// Evaluate queries with seen anchors and unseen answers
    #[arg(long)]
    es: bool,

    /// Evaluate queries with unseen anchors and seen answers
    #[arg(long)]
    se: bool,

    /// Mirror the log to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<RunConfig> {
    let tasks = parse_task_list(&args.tasks).context("parsing --tasks")?;
    let loss_weights = args
        .loss_weights
        .as_deref()
        .map(|raw| {
            raw.split(';')
                .map(|token| token.trim().parse::<f64>())
                .collect::<std::result::Result<Vec<f64>, _>>()
        })
        .transpose()
        .context("parsing --loss-weights")?;

    Ok(RunConfig {
        do_train: args.do_train,
        do_valid: args.do_valid,
        do_test: args.do_test,
        data_path: args.data_path.clone(),
        tasks,
        union_mode: args.union_mode,
        family: args.family,
        hidden_dim: args.hidden_dim,
        gamma: args.gamma,
        negative_sample_size: args.negative_sample_size,
        batch_size: args.batch_size,
        test_batch_size: args.test_batch_size,
        learning_rate: args.learning_rate,
        max_steps: args.max_steps,
        warm_up_steps: args.warm_up_steps,
        save_checkpoint_steps: args.save_checkpoint_steps,
        valid_steps: args.valid_steps,
        log_steps: args.log_steps,
        test_log_steps: args.test_log_steps,
        seed: args.seed,
        loss_weights,
        pretrain: args.pretrain.clone(),
        prefix: args.prefix.clone(),
        checkpoint_path: args.checkpoint_path.clone(),
        use_rule: args.use_rule,
        rule_len: args.rule_len,
        rule_thr: args.rule_thr,
        max_neighbor: args.max_neighbor,
        regime_ee: args.ee,
        regime_es: args.es,
        regime_se: args.se,
        num_entities: 0,
        num_relations: 0,
    })
}

fn init_logging(run_dir: &Path, config: &RunConfig, verbose: bool) -> Result<()> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    let name = if config.do_train {
        "train.log"
    } else if config.do_valid {
        "valid.log"
    } else {
        "test.log"
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join(name))
        .with_context(|| format!("opening log file in {}", run_dir.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(file));
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if verbose {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry.init();
    }
    Ok(())
}

/// Build the relation matrix for families that execute over the graph,
/// densified by cached rules when requested.
fn load_graph_matrix(config: &RunConfig, stats: GraphStats) -> Result<RelationMatrix> {
    let mut triples: Vec<(u64, u64, u64)> = load_bin(&config.data_path().join(TRIPLES_FILE))
        .context("loading training triples")?;
    info!(triples = triples.len(), "training graph loaded");
    let mut matrix =
        RelationMatrix::from_triples(stats.num_entities, stats.num_relations, &triples)?;

    if config.use_rule {
        let table = rules::require_cached(config.data_path()).context(
            "rule application needs a mined rule cache; run the miner over this dataset first",
        )?;
        info!(
            rules = table.len(),
            max_len = table.max_len,
            threshold = config.rule_thr,
            "applying cached rules"
        );
        let inferred = rules::infer_triples(&matrix, &table, config.rule_thr)?;
        info!(inferred = inferred.len(), "rule-implied triples added");
        triples.extend(inferred);
        matrix = RelationMatrix::from_triples(stats.num_entities, stats.num_relations, &triples)?;
    }

    Ok(matrix)
}

fn log_run_info(config: &RunConfig, dataset: &Dataset, registry: &StructureRegistry) {
    info!(
        family = %config.family,
        union_mode = %config.union_mode,
        max_steps = config.max_steps,
        batch_size = config.batch_size,
        seed = config.seed,
        "run configuration"
    );
    for (label, shape) in registry.entries_sorted() {
        if let Some(queries) = dataset.train_queries.get(shape) {
            info!("{label}: {} train queries", queries.len());
        }
    }
    info!(
        train = dataset.train_query_count(),
        valid_splits = dataset.valid.len(),
        test_splits = dataset.test.len(),
        "dataset ready"
    );
}

fn run(args: Args) -> Result<()> {
    let registry = StructureRegistry::catalogue();
    let mut config = build_config(&args)?;
    config.validate()?;
    if !(config.do_train || config.do_valid || config.do_test) {
        bail!("nothing to do; pass --train, --valid, or --test");
    }
    if (config.do_valid || config.do_test)
        && !(config.regime_ee || config.regime_es || config.regime_se)
    {
        bail!("evaluation needs at least one regime; pass --ee, --es, or --se");
    }

    let run_dir = config.run_dir();
    init_logging(&run_dir, &config, args.verbose)?;
    info!(run_dir = %run_dir.display(), "run directory");

    let stats = GraphStats::load(config.data_path()).context("reading dataset statistics")?;
    config.num_entities = stats.num_entities;
    config.num_relations = stats.num_relations;
    info!(
        entities = stats.num_entities,
        relations = stats.num_relations,
        "graph statistics"
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Loading {}...", config.data_path().display()));
    let dataset = Dataset::load(config.data_path(), &config, &registry)?;
    spinner.finish_with_message("Datasets loaded");
    log_run_info(&config, &dataset, &registry);

    let (matrix, neighbors) = if config.family == ModelFamily::NeuralSymbolic || config.use_rule {
        let matrix = load_graph_matrix(&config, stats)?;
        let index = NeighborIndex::build(&matrix, config.max_neighbor, config.seed)?;
        info!(
            avg_degree = index.avg_degree(),
            cap = index.max_neighbor(),
            "neighborhood index built"
        );
        (Some(matrix), Some(index))
    } else {
        (None, None)
    };

    let mut model = build_model(&config, matrix, neighbors, &registry)?;
    for param in model.parameters() {
        info!(name = %param.name, shape = ?param.shape, trainable = param.trainable, "parameter");
    }

    if let Some(dir) = &config.pretrain {
        let bundle = PretrainedBundle::load(dir).context("loading pretrained embeddings")?;
        let mut state = model.state_dict();
        bundle.splice_into(&mut state);
        model.load_state_dict(&state)?;
        info!(from = %dir.display(), "pretrained embeddings spliced in");
    }

    let mut optimizer = Adam::new(config.learning_rate);
    let checkpoints = CheckpointManager::new(&run_dir);
    let mut train_loop = if config.checkpoint_path.is_some() {
        let snapshot = checkpoints.load().context("resuming from checkpoint")?;
        model.load_state_dict(&snapshot.model)?;
        optimizer.load_state_dict(snapshot.optimizer.clone());
        info!(
            step = snapshot.step,
            learning_rate = snapshot.learning_rate,
            "resuming run"
        );
        TrainLoop::resume(&config, &snapshot)
    } else {
        TrainLoop::new(&config)
    };

    let mut sink = JsonlSink::open(&run_dir.join(METRICS_FILE))?;

    if config.do_train {
        let (path, other) = partition_train(&dataset.train_queries, &registry)?;
        if path.is_empty() {
            bail!("training needs at least one path task (1p, 2p, or 3p) with queries");
        }
        info!(path = path.len(), other = other.len(), "training partitions");
        let mut path_iter = BatchCycler::new(path, config.batch_size, config.seed)?;
        let mut other_iter = if other.is_empty() {
            None
        } else {
            Some(BatchCycler::new(other, config.batch_size, config.seed.wrapping_add(1))?)
        };

        train_loop.run(
            model.as_mut(),
            &mut optimizer,
            &dataset,
            &mut path_iter,
            other_iter.as_mut(),
            &registry,
            &checkpoints,
            &mut sink,
        )?;
    } else {
        let step = train_loop.step();
        if config.do_valid {
            evaluate(model.as_ref(), &dataset.valid, "valid", step, &config, &registry, &mut sink)?;
        }
        if config.do_test {
            evaluate(model.as_ref(), &dataset.test, "test", step, &config, &registry, &mut sink)?;
        }
    }

    info!("done");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    run(args)
}
