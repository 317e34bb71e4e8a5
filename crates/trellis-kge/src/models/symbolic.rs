use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use tracing::info;

use trellis_reason::{QueryShape, RelationMatrix, StructureRegistry};

use crate::config::RunConfig;
use crate::data::{answer_set, AnswerSets, EvalBatch, TrainExample};
use crate::graph::NeighborIndex;
use crate::iterate::TrainBatch;
use crate::metrics::NUM_QUERIES_KEY;
use crate::model::{MetricMap, ModelState, ParameterInfo, ReasoningModel, TensorData};
use crate::optim::Optimizer;
use crate::{Error, Result};

const BIAS_PARAM: &str = "entity_bias";

/// Weight of the pooled neighborhood prior against the entity's own bias.
const NEIGHBOR_PRIOR_WEIGHT: f64 = 0.5;

/// Neural-symbolic model: answers queries by exact execution over the
/// training graph and layers a learned per-entity prior on top.
///
/// The prior orders entities that symbolic execution cannot separate,
/// and is the only learnable state. Membership in the executed answer
/// set contributes a fixed margin to the score, so the prior can break
/// ties but not override the graph. When a neighborhood index is
/// attached, each prior also pools the biases of the entity's sampled
/// neighbors, so entities never touched by training inherit a prior
/// from their neighborhood.
#[derive(Debug)]
pub struct SymbolicModel {
    matrix: RelationMatrix,
    neighbors: Option<NeighborIndex>,
    entity_bias: Vec<f32>,
    loss_weights: HashMap<QueryShape, f64>,
    margin: f64,
    rng: XorShiftRng,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

impl SymbolicModel {
    pub fn new(
        matrix: RelationMatrix,
        neighbors: Option<NeighborIndex>,
        config: &RunConfig,
        registry: &StructureRegistry,
    ) -> Result<Self> {
        if let Some(index) = &neighbors {
            if index.num_entities() != matrix.num_entities() {
                return Err(Error::Invariant(format!(
                    "neighborhood index covers {} entities, graph has {}",
                    index.num_entities(),
                    matrix.num_entities()
                )));
            }
        }
        let mut loss_weights = HashMap::new();
        for (kind, weight) in config.task_loss_weights() {
            let shape = registry.shape_for(kind, config.union_mode)?;
            loss_weights.insert(shape.clone(), weight);
        }
        Ok(Self {
            entity_bias: vec![0.0; matrix.num_entities()],
            matrix,
            neighbors,
            loss_weights,
            margin: config.gamma,
            rng: XorShiftRng::seed_from_u64(config.seed.wrapping_add(2)),
        })
    }

    fn weight_of(&self, shape: &QueryShape) -> f64 {
        self.loss_weights.get(shape).copied().unwrap_or(1.0)
    }

    fn score(&self, member: bool, entity: usize) -> f64 {
        let base = if member { self.margin } else { 0.0 };
        base + self.prior(entity)
    }

    /// Learned prior for one entity, pooled over its sampled
    /// neighborhood when an index is attached.
    fn prior(&self, entity: usize) -> f64 {
        let own = self.entity_bias[entity] as f64;
        let Some(index) = &self.neighbors else {
            return own;
        };
        let adjacent = index.neighbors(entity as u64);
        if adjacent.is_empty() {
            return own;
        }
        let pooled: f64 = adjacent
            .iter()
            .map(|&(_, target)| self.entity_bias[target as usize] as f64)
            .sum::<f64>()
            / adjacent.len() as f64;
        own + NEIGHBOR_PRIOR_WEIGHT * pooled
    }

    /// Route a score gradient to the entity's own bias and, through the
    /// pooled prior, to its sampled neighbors.
    fn push_grad(&self, grad: &mut [f32], entity: usize, g: f64) {
        grad[entity] += g as f32;
        if let Some(index) = &self.neighbors {
            let adjacent = index.neighbors(entity as u64);
            if !adjacent.is_empty() {
                let share = g * NEIGHBOR_PRIOR_WEIGHT / adjacent.len() as f64;
                for &(_, target) in adjacent {
                    grad[target as usize] += share as f32;
                }
            }
        }
    }

    fn rank_example(
        &self,
        example: &TrainExample,
        easy_answers: &AnswerSets,
        hard_answers: &AnswerSets,
    ) -> Result<(QueryShape, [f64; 4])> {
        let n = self.matrix.num_entities();
        let membership = self.matrix.execute(&example.shape, example.query.ids())?;
        let scores: Vec<f64> = (0..n).map(|i| self.score(membership[i], i)).collect();

        let hard = answer_set(hard_answers, &example.shape, &example.query).ok_or_else(|| {
            Error::Invariant(format!("query {:?} has no held-out answers", example.query))
        })?;
        if hard.is_empty() {
            return Err(Error::Invariant(format!(
                "query {:?} has an empty held-out answer set",
                example.query
            )));
        }
        let empty = Default::default();
        let easy = answer_set(easy_answers, &example.shape, &example.query).unwrap_or(&empty);

        let mut mrr = 0.0;
        let mut hits = [0.0f64; 3];
        for &answer in hard {
            let target_idx = answer as usize;
            if target_idx >= n {
                return Err(Error::Invariant(format!("answer entity {answer} out of range")));
            }
            let target = scores[target_idx];
            let mut better = 0usize;
            let mut tied = 0usize;
            for (idx, &score) in scores.iter().enumerate() {
                let id = idx as u64;
                if id == answer || easy.contains(&id) || hard.contains(&id) {
                    continue;
                }
                if score > target {
                    better += 1;
                } else if score == target {
                    tied += 1;
                }
            }
            // tied entities share the run of ranks; the target takes the middle
            let rank = better as f64 + 1.0 + tied as f64 / 2.0;
            mrr += 1.0 / rank;
            for (slot, k) in [1.0, 3.0, 10.0].into_iter().enumerate() {
                if rank <= k {
                    hits[slot] += 1.0;
                }
            }
        }
        let count = hard.len() as f64;
        Ok((
            example.shape.clone(),
            [mrr / count, hits[0] / count, hits[1] / count, hits[2] / count],
        ))
    }
}

impl ReasoningModel for SymbolicModel {
    fn train_step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        batch: &TrainBatch,
        answers: &AnswerSets,
        config: &RunConfig,
        _step: u64,
    ) -> Result<MetricMap> {
        let n = self.matrix.num_entities();
        let mut grad = vec![0.0f32; n];
        let mut positive_loss = 0.0;
        let mut negative_loss = 0.0;
        let mut weight_total = 0.0;

        for example in &batch.examples {
            let membership = self.matrix.execute(&example.shape, example.query.ids())?;
            let weight = self.weight_of(&example.shape);
            let positives = answer_set(answers, &example.shape, &example.query).ok_or_else(|| {
                Error::Invariant(format!("query {:?} has no training answers", example.query))
            })?;
            if positives.is_empty() {
                return Err(Error::Invariant(format!(
                    "query {:?} has an empty training answer set",
                    example.query
                )));
            }

            let mut pos = 0.0;
            for &answer in positives {
                let idx = answer as usize;
                if idx >= n {
                    return Err(Error::Invariant(format!("answer entity {answer} out of range")));
                }
                let score = self.score(membership[idx], idx);
                pos += softplus(-score);
                self.push_grad(&mut grad, idx, weight * (sigmoid(score) - 1.0));
            }
            pos /= positives.len() as f64;

            let mut neg = 0.0;
            let mut drawn = 0;
            let mut attempts = 0;
            let budget = config.negative_sample_size.max(1);
            while drawn < budget {
                attempts += 1;
                if attempts > budget * 50 {
                    return Err(Error::Invariant(
                        "could not sample negatives; answers cover the whole graph".into(),
                    ));
                }
                let candidate = self.rng.gen_range(0..n as u64);
                if positives.contains(&candidate) {
                    continue;
                }
                let idx = candidate as usize;
                let score = self.score(membership[idx], idx);
                neg += softplus(score);
                self.push_grad(&mut grad, idx, weight * sigmoid(score));
                drawn += 1;
            }
            neg /= budget as f64;

            positive_loss += weight * pos;
            negative_loss += weight * neg;
            weight_total += weight;
        }

        if weight_total > 0.0 {
            positive_loss /= weight_total;
            negative_loss /= weight_total;
            let scale = (1.0 / weight_total) as f32;
            for g in &mut grad {
                *g *= scale;
            }
        }
        optimizer.apply(BIAS_PARAM, &mut self.entity_bias, &grad);

        let mut metrics = MetricMap::new();
        metrics.insert("positive_sample_loss".into(), positive_loss);
        metrics.insert("negative_sample_loss".into(), negative_loss);
        metrics.insert("loss".into(), (positive_loss + negative_loss) / 2.0);
        Ok(metrics)
    }

    fn test_step(
        &self,
        easy_answers: &AnswerSets,
        hard_answers: &AnswerSets,
        config: &RunConfig,
        batches: &[EvalBatch],
    ) -> Result<HashMap<QueryShape, MetricMap>> {
        let total: usize = batches.iter().map(Vec::len).sum();
        let done = AtomicUsize::new(0);
        let ranked: Vec<(QueryShape, [f64; 4])> = batches
            .par_iter()
            .flat_map(|batch| batch.par_iter())
            .map(|example| {
                let i = done.fetch_add(1, Ordering::Relaxed);
                if config.test_log_steps > 0 && i % config.test_log_steps as usize == 0 {
                    info!("evaluating ({i}/{total})");
                }
                self.rank_example(example, easy_answers, hard_answers)
            })
            .collect::<Result<_>>()?;

        let mut sums: HashMap<QueryShape, ([f64; 4], f64)> = HashMap::new();
        for (shape, values) in ranked {
            let entry = sums.entry(shape).or_insert(([0.0; 4], 0.0));
            for (total, value) in entry.0.iter_mut().zip(values) {
                *total += value;
            }
            entry.1 += 1.0;
        }

        let mut out = HashMap::new();
        for (shape, (totals, count)) in sums {
            let mut metrics = MetricMap::new();
            for (key, total) in ["mrr", "hits_at_1", "hits_at_3", "hits_at_10"].into_iter().zip(totals)
            {
                metrics.insert(key.into(), total / count);
            }
            metrics.insert(NUM_QUERIES_KEY.into(), count);
            out.insert(shape, metrics);
        }
        Ok(out)
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo {
            name: BIAS_PARAM.to_string(),
            shape: vec![self.entity_bias.len()],
            trainable: true,
        }]
    }

    fn state_dict(&self) -> ModelState {
        let mut state = ModelState::new();
        state.insert(BIAS_PARAM.to_string(), TensorData::vector(self.entity_bias.clone()));
        state
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        for key in state.keys() {
            if key != BIAS_PARAM {
                return Err(Error::Checkpoint(format!("unexpected parameter {key}")));
            }
        }
        let tensor = state
            .get(BIAS_PARAM)
            .ok_or_else(|| Error::Checkpoint(format!("missing parameter {BIAS_PARAM}")))?;
        if tensor.values.len() != self.entity_bias.len() {
            return Err(Error::Checkpoint(format!(
                "parameter {BIAS_PARAM} has {} entries, expected {}",
                tensor.values.len(),
                self.entity_bias.len()
            )));
        }
        self.entity_bias = tensor.values.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ModelFamily;
    use crate::data::QueryInstance;
    use crate::optim::Adam;
    use trellis_reason::TaskKind;

    fn toy_matrix() -> RelationMatrix {
        RelationMatrix::from_triples(5, 2, &[(0, 0, 1), (0, 0, 3), (1, 1, 2), (4, 1, 2)]).unwrap()
    }

    fn test_config() -> RunConfig {
        RunConfig {
            family: ModelFamily::NeuralSymbolic,
            negative_sample_size: 4,
            ..RunConfig::default()
        }
    }

    fn model() -> SymbolicModel {
        SymbolicModel::new(toy_matrix(), None, &test_config(), &StructureRegistry::catalogue())
            .unwrap()
    }

    fn indexed_model() -> SymbolicModel {
        let index = NeighborIndex::build(&toy_matrix(), 8, 0).unwrap();
        SymbolicModel::new(
            toy_matrix(),
            Some(index),
            &test_config(),
            &StructureRegistry::catalogue(),
        )
        .unwrap()
    }

    fn one_hop_example() -> TrainExample {
        let registry = StructureRegistry::catalogue();
        let shape = registry
            .shape_for(TaskKind::P1, trellis_reason::UnionMode::Dnf)
            .unwrap()
            .clone();
        TrainExample { shape, query: QueryInstance::new(vec![0, 0]) }
    }

    fn answer_fixture(example: &TrainExample, entities: &[u64]) -> AnswerSets {
        let mut sets = AnswerSets::new();
        sets.entry(example.shape.clone())
            .or_default()
            .insert(example.query.clone(), entities.iter().copied().collect());
        sets
    }

    #[test]
    fn members_of_the_answer_set_rank_first() {
        let model = model();
        let example = one_hop_example();
        let hard = answer_fixture(&example, &[1, 3]);
        let easy = AnswerSets::new();

        let metrics = model
            .test_step(&easy, &hard, &test_config(), &[vec![example.clone()]])
            .unwrap();
        let shape_metrics = &metrics[&example.shape];
        assert_eq!(shape_metrics["mrr"], 1.0);
        assert_eq!(shape_metrics["hits_at_1"], 1.0);
        assert_eq!(shape_metrics[NUM_QUERIES_KEY], 1.0);
    }

    #[test]
    fn easy_answers_are_filtered_from_the_ranking() {
        let model = model();
        let example = one_hop_example();

        // without filtering, 1 and 3 tie and the target averages rank 1.5
        let hard = answer_fixture(&example, &[3]);
        let unfiltered = model
            .test_step(&AnswerSets::new(), &hard, &test_config(), &[vec![example.clone()]])
            .unwrap();
        let mrr = unfiltered[&example.shape]["mrr"];
        assert!((mrr - 1.0 / 1.5).abs() < 1e-9, "got {mrr}");

        let easy = answer_fixture(&example, &[1]);
        let filtered = model
            .test_step(&easy, &hard, &test_config(), &[vec![example.clone()]])
            .unwrap();
        assert_eq!(filtered[&example.shape]["mrr"], 1.0);
    }

    #[test]
    fn empty_held_out_set_is_an_error() {
        let model = model();
        let example = one_hop_example();
        let hard = answer_fixture(&example, &[]);
        let err = model
            .test_step(&AnswerSets::new(), &hard, &test_config(), &[vec![example]])
            .unwrap_err();
        assert!(err.to_string().contains("empty held-out"));
    }

    #[test]
    fn training_pushes_answers_above_non_answers() {
        let mut model = model();
        let config = test_config();
        let example = one_hop_example();
        let answers = answer_fixture(&example, &[1, 3]);
        let batch = TrainBatch { examples: vec![example] };
        let mut adam = Adam::new(0.1);

        let metrics = model.train_step(&mut adam, &batch, &answers, &config, 0).unwrap();
        assert!(metrics.contains_key("loss"));
        assert!(metrics.contains_key("positive_sample_loss"));
        assert!(metrics.contains_key("negative_sample_loss"));
        for _ in 0..20 {
            model.train_step(&mut adam, &batch, &answers, &config, 0).unwrap();
        }
        assert!(model.entity_bias[1] > model.entity_bias[0]);
        assert!(model.entity_bias[3] > model.entity_bias[2]);
    }

    #[test]
    fn neighborhood_prior_separates_entities_sharing_a_membership() {
        let config = test_config();
        let mut pooled = indexed_model();
        let mut plain = model();
        // entity 2 is the sole out-neighbor of 1 and of 4, so its bias
        // reaches their priors only through the pooling
        let biases = vec![0.0, 0.0, 1.0, 0.0, 0.0];
        pooled.entity_bias = biases.clone();
        plain.entity_bias = biases;

        let example = one_hop_example();
        let hard = answer_fixture(&example, &[3]);

        // pooled: 1 scores margin + 0.5 and outranks the target, rank 2
        let with_index = pooled
            .test_step(&AnswerSets::new(), &hard, &config, &[vec![example.clone()]])
            .unwrap()[&example.shape]["mrr"];
        assert!((with_index - 0.5).abs() < 1e-9, "got {with_index}");

        // plain: 1 and 3 tie at the margin, rank 1.5
        let without = plain
            .test_step(&AnswerSets::new(), &hard, &config, &[vec![example.clone()]])
            .unwrap()[&example.shape]["mrr"];
        assert!((without - 1.0 / 1.5).abs() < 1e-9, "got {without}");
    }

    #[test]
    fn gradient_reaches_the_neighbors_of_sampled_entities() {
        let config = test_config();
        let example = one_hop_example();
        // 4 is the only negative candidate and 2 its sole neighbor, so
        // the shared negative gradient outweighs 2's own positive one
        let answers = answer_fixture(&example, &[0, 1, 2, 3]);
        let batch = TrainBatch { examples: vec![example] };

        let mut pooled = indexed_model();
        let mut adam = Adam::new(0.1);
        pooled.train_step(&mut adam, &batch, &answers, &config, 0).unwrap();
        assert!(pooled.entity_bias[2] < 0.0, "got {}", pooled.entity_bias[2]);

        let mut plain = model();
        let mut adam = Adam::new(0.1);
        plain.train_step(&mut adam, &batch, &answers, &config, 0).unwrap();
        assert!(plain.entity_bias[2] > 0.0, "got {}", plain.entity_bias[2]);
    }

    #[test]
    fn neighbor_index_must_cover_the_graph() {
        let small = RelationMatrix::from_triples(2, 1, &[(0, 0, 1)]).unwrap();
        let index = NeighborIndex::build(&small, 8, 0).unwrap();
        let err = SymbolicModel::new(
            toy_matrix(),
            Some(index),
            &test_config(),
            &StructureRegistry::catalogue(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("covers 2 entities"));
    }

    #[test]
    fn state_dict_round_trips() {
        let mut source = model();
        source.entity_bias = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        let mut target = model();
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.entity_bias, source.entity_bias);
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let mut target = model();
        let mut state = ModelState::new();
        state.insert("entity_embedding".into(), TensorData::vector(vec![0.0; 5]));
        let err = target.load_state_dict(&state).unwrap_err();
        assert!(err.to_string().contains("unexpected parameter"));
    }
}
