use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// First and second moment estimates for one named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentState {
    pub step: u64,
    pub first: Vec<f32>,
    pub second: Vec<f32>,
}

/// Serializable optimizer snapshot, keyed by parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f64,
    pub moments: BTreeMap<String, MomentState>,
}

/// Gradient-descent seam between the training loop and a model's
/// parameters.
pub trait Optimizer {
    fn learning_rate(&self) -> f64;

    /// Apply one update to a named parameter in place.
    fn apply(&mut self, name: &str, param: &mut [f32], grad: &[f32]);

    /// Restart with a new learning rate, discarding all accumulated
    /// moments. Equivalent to constructing a fresh optimizer.
    fn reset(&mut self, learning_rate: f64);

    fn state_dict(&self) -> OptimizerState;

    fn load_state_dict(&mut self, state: OptimizerState);
}

/// Adam with bias-corrected moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    moments: BTreeMap<String, MomentState>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            moments: BTreeMap::new(),
        }
    }

    fn slot(&mut self, name: &str, len: usize) -> &mut MomentState {
        let slot = self.moments.entry(name.to_string()).or_insert_with(|| MomentState {
            step: 0,
            first: vec![0.0; len],
            second: vec![0.0; len],
        });
        if slot.first.len() != len {
            *slot = MomentState { step: 0, first: vec![0.0; len], second: vec![0.0; len] };
        }
        slot
    }
}

impl Optimizer for Adam {
    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn apply(&mut self, name: &str, param: &mut [f32], grad: &[f32]) {
        debug_assert_eq!(param.len(), grad.len());
        let lr = self.learning_rate as f32;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let slot = self.slot(name, param.len());
        slot.step += 1;
        let t = slot.step as i32;
        let correction1 = 1.0 - beta1.powi(t);
        let correction2 = 1.0 - beta2.powi(t);
        for i in 0..param.len() {
            let g = grad[i];
            slot.first[i] = beta1 * slot.first[i] + (1.0 - beta1) * g;
            slot.second[i] = beta2 * slot.second[i] + (1.0 - beta2) * g * g;
            let m_hat = slot.first[i] / correction1;
            let v_hat = slot.second[i] / correction2;
            param[i] -= lr * m_hat / (v_hat.sqrt() + epsilon);
        }
    }

    fn reset(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
        self.moments.clear();
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.learning_rate,
            moments: self.moments.clone(),
        }
    }

    fn load_state_dict(&mut self, state: OptimizerState) {
        self.learning_rate = state.learning_rate;
        self.moments = state.moments;
    }
}
