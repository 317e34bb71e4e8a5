use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use trellis_reason::QueryShape;

use crate::config::RunConfig;
use crate::data::{load_bin, AnswerSets, EvalBatch};
use crate::iterate::TrainBatch;
use crate::optim::Optimizer;
use crate::Result;

pub const PRETRAIN_FILE: &str = "pretrain-embeddings.bin";

/// Dense tensor payload, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn vector(values: Vec<f32>) -> Self {
        Self { shape: vec![values.len()], values }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Named tensors making up a model's learnable state.
pub type ModelState = BTreeMap<String, TensorData>;

/// Scalar training or evaluation metrics keyed by name.
pub type MetricMap = BTreeMap<String, f64>;

/// Name, shape, and trainability of one parameter, for logging at
/// startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub trainable: bool,
}

/// Embeddings trained on plain link prediction, spliced into a model
/// before query training starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainedBundle {
    pub embedding_range: TensorData,
    pub entity_embedding: TensorData,
    pub relation_embedding: TensorData,
}

impl PretrainedBundle {
    pub fn load(dir: &Path) -> Result<Self> {
        load_bin(&dir.join(PRETRAIN_FILE))
    }

    /// Overwrite the three embedding tensors in a model state, leaving
    /// every other entry untouched.
    pub fn splice_into(&self, state: &mut ModelState) {
        state.insert("embedding_range".to_string(), self.embedding_range.clone());
        state.insert("entity_embedding".to_string(), self.entity_embedding.clone());
        state.insert("relation_embedding".to_string(), self.relation_embedding.clone());
    }
}

/// A model that can be trained on grounded queries and ranked against
/// held-out answers.
///
/// The training loop calls `train_step` once per scheduled batch and
/// `test_step` at each evaluation cadence; it never looks inside the
/// model beyond these methods and the state dict.
pub trait ReasoningModel {
    /// Run one optimization step over a batch and report its losses.
    fn train_step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        batch: &TrainBatch,
        answers: &AnswerSets,
        config: &RunConfig,
        step: u64,
    ) -> Result<MetricMap>;

    /// Rank candidate answers for each query and return per-shape metrics.
    ///
    /// `easy_answers` are filtered out of each ranking; `hard_answers`
    /// are the ones scored.
    fn test_step(
        &self,
        easy_answers: &AnswerSets,
        hard_answers: &AnswerSets,
        config: &RunConfig,
        batches: &[EvalBatch],
    ) -> Result<HashMap<QueryShape, MetricMap>>;

    fn parameters(&self) -> Vec<ParameterInfo>;

    fn state_dict(&self) -> ModelState;

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()>;
}
