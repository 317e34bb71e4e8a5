use tracing::{info, warn};
use trellis_reason::StructureRegistry;

use crate::checkpoint::{CheckpointManager, RunSnapshot};
use crate::config::RunConfig;
use crate::data::{eval_batches, Dataset, EvalSplit};
use crate::iterate::BatchCycler;
use crate::metrics::{aggregate, average_logs, log_metrics, MetricsSink};
use crate::model::{MetricMap, ReasoningModel};
use crate::optim::Optimizer;
use crate::Result;

/// Path batches trained for every batch from the other partition.
pub const PATH_STEPS_PER_OTHER_STEP: u64 = 2;
/// The one-shot warm-up decay divides the learning rate by this.
pub const LR_DECAY_DIVISOR: f64 = 5.0;
/// Evaluation interval multiplier for the last third of training.
pub const LATE_EVAL_MULTIPLIER: u64 = 4;

/// Where the run stands relative to the warm-up decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WarmUp,
    Decayed,
    Done,
}

/// Step scheduler for alternating query training.
///
/// Drives the training cadences: path/other batch alternation, the
/// one-shot learning-rate decay at the warm-up boundary, periodic
/// evaluation with a slower late-run interval, checkpointing, and
/// windowed loss logging.
pub struct TrainLoop {
    config: RunConfig,
    step: u64,
    init_step: u64,
    learning_rate: f64,
    warm_up_steps: u64,
    phase: Phase,
}

impl TrainLoop {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            step: 0,
            init_step: 0,
            learning_rate: config.learning_rate,
            warm_up_steps: config.effective_warm_up(),
            phase: Phase::WarmUp,
            config: config.clone(),
        }
    }

    /// Continue from a snapshot: the saved step is the next one executed,
    /// and a warm-up boundary pushed to `max_steps` means the decay has
    /// already fired.
    pub fn resume(config: &RunConfig, snapshot: &RunSnapshot) -> Self {
        let phase = if snapshot.warm_up_steps >= config.max_steps {
            Phase::Decayed
        } else {
            Phase::WarmUp
        };
        Self {
            step: snapshot.step,
            init_step: snapshot.step,
            learning_rate: snapshot.learning_rate,
            warm_up_steps: snapshot.warm_up_steps,
            phase,
            config: config.clone(),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn init_step(&self) -> u64 {
        self.init_step
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Evaluation interval in effect at a given step.
    ///
    /// Depends only on the arguments, so a resumed run computes the same
    /// interval the uninterrupted run would have.
    pub fn effective_eval_interval(config: &RunConfig, step: u64) -> u64 {
        if step >= 2 * config.max_steps / 3 {
            config.valid_steps * LATE_EVAL_MULTIPLIER
        } else {
            config.valid_steps
        }
    }

    fn snapshot(&self, model: &dyn ReasoningModel, optimizer: &dyn Optimizer) -> RunSnapshot {
        RunSnapshot {
            step: self.step,
            learning_rate: self.learning_rate,
            warm_up_steps: self.warm_up_steps,
            optimizer: optimizer.state_dict(),
            model: model.state_dict(),
        }
    }

    /// Run training from the current step to `max_steps`.
    ///
    /// Each scheduler step trains one path batch, then, when a second
    /// partition exists, one batch from it followed by the remaining
    /// path batches of the ratio. The windowed log buffers the last
    /// path metrics of the step.
    pub fn run(
        &mut self,
        model: &mut dyn ReasoningModel,
        optimizer: &mut dyn Optimizer,
        data: &Dataset,
        path_iter: &mut BatchCycler,
        mut other_iter: Option<&mut BatchCycler>,
        registry: &StructureRegistry,
        checkpoints: &CheckpointManager,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        info!(
            start = self.step,
            max_steps = self.config.max_steps,
            learning_rate = self.learning_rate,
            warm_up_steps = self.warm_up_steps,
            "training starts"
        );
        let mut window: Vec<MetricMap> = Vec::new();

        while self.step < self.config.max_steps {
            let step = self.step;

            let batch = path_iter.next_batch();
            let mut last =
                model.train_step(optimizer, &batch, &data.train_answers, &self.config, step)?;
            record(sink, "path", &last, step)?;

            if let Some(other) = other_iter.as_deref_mut() {
                let batch = other.next_batch();
                let other_log =
                    model.train_step(optimizer, &batch, &data.train_answers, &self.config, step)?;
                record(sink, "other", &other_log, step)?;
                for _ in 1..PATH_STEPS_PER_OTHER_STEP {
                    let batch = path_iter.next_batch();
                    last = model.train_step(
                        optimizer,
                        &batch,
                        &data.train_answers,
                        &self.config,
                        step,
                    )?;
                }
            }
            window.push(last);

            if self.phase == Phase::WarmUp && step >= self.warm_up_steps {
                self.learning_rate /= LR_DECAY_DIVISOR;
                optimizer.reset(self.learning_rate);
                self.warm_up_steps = self.config.max_steps;
                self.phase = Phase::Decayed;
                info!(step, learning_rate = self.learning_rate, "warm-up over, learning rate decayed");
            }

            if self.config.save_checkpoint_steps > 0 && step % self.config.save_checkpoint_steps == 0
            {
                checkpoints.save(&self.config, &self.snapshot(&*model, &*optimizer))?;
            }

            let interval = Self::effective_eval_interval(&self.config, step);
            if interval > 0 && step % interval == 0 && step > self.init_step {
                if self.config.do_valid {
                    evaluate(&*model, &data.valid, "valid", step, &self.config, registry, sink)?;
                }
                if self.config.do_test {
                    evaluate(&*model, &data.test, "test", step, &self.config, registry, sink)?;
                }
            }

            if self.config.log_steps > 0 && step % self.config.log_steps == 0 && !window.is_empty()
            {
                log_metrics("training average", step, &average_logs(&window));
                window.clear();
            }

            self.step += 1;
        }

        self.phase = Phase::Done;
        checkpoints.save(&self.config, &self.snapshot(&*model, &*optimizer))?;
        info!(step = self.step, "training finished");

        if self.config.do_test {
            evaluate(&*model, &data.test, "test", self.step, &self.config, registry, sink)?;
        }
        Ok(())
    }
}

fn record(sink: &mut dyn MetricsSink, prefix: &str, metrics: &MetricMap, step: u64) -> Result<()> {
    for (key, value) in metrics {
        sink.scalar(&format!("{prefix}_{key}"), *value, step)?;
    }
    Ok(())
}

/// Evaluate one split family and route the flattened metrics to the log
/// and the sink under a `<split>_<regime>` scope.
pub fn evaluate(
    model: &dyn ReasoningModel,
    splits: &[EvalSplit],
    split_name: &str,
    step: u64,
    config: &RunConfig,
    registry: &StructureRegistry,
    sink: &mut dyn MetricsSink,
) -> Result<()> {
    for split in splits {
        let scope = format!("{split_name}_{}", split.regime);
        let batches = eval_batches(&split.queries, config.test_batch_size);
        if batches.is_empty() {
            warn!(%scope, "no queries to evaluate, skipping");
            continue;
        }
        let per_shape = model.test_step(&split.easy_answers, &split.answers, config, &batches)?;
        let flat = aggregate(&per_shape, registry)?;
        for (key, value) in &flat {
            sink.scalar(&format!("{scope}_{key}"), *value, step)?;
        }
        log_metrics(&scope, step, &flat);
    }
    Ok(())
}
