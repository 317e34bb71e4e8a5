use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use crate::data::TrainExample;
use crate::{Error, Result};

/// One training batch.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    pub examples: Vec<TrainExample>,
}

/// Endless batch iterator over a fixed partition of training examples.
///
/// The examples are shuffled once up front and re-shuffled every time the
/// cursor wraps, so each pass over the data is a fresh permutation and no
/// batch is ever short.
#[derive(Debug)]
pub struct BatchCycler {
    examples: Vec<TrainExample>,
    batch_size: usize,
    cursor: usize,
    rng: XorShiftRng,
    batches_drawn: u64,
}

impl BatchCycler {
    pub fn new(mut examples: Vec<TrainExample>, batch_size: usize, seed: u64) -> Result<Self> {
        if examples.is_empty() {
            return Err(Error::Config("cannot iterate over an empty partition".into()));
        }
        if batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        let mut rng = XorShiftRng::seed_from_u64(seed);
        examples.shuffle(&mut rng);
        Ok(Self { examples, batch_size, cursor: 0, rng, batches_drawn: 0 })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn batches_drawn(&self) -> u64 {
        self.batches_drawn
    }

    /// Draw the next batch, re-shuffling mid-batch when a pass ends.
    pub fn next_batch(&mut self) -> TrainBatch {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            if self.cursor == self.examples.len() {
                self.examples.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            let take = (self.batch_size - batch.len()).min(self.examples.len() - self.cursor);
            batch.extend_from_slice(&self.examples[self.cursor..self.cursor + take]);
            self.cursor += take;
        }
        self.batches_drawn += 1;
        TrainBatch { examples: batch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::QueryInstance;
    use trellis_reason::{StepOp, QueryShape};

    fn examples(n: u64) -> Vec<TrainExample> {
        let shape = QueryShape::anchor(&[StepOp::Project]);
        (0..n)
            .map(|i| TrainExample {
                shape: shape.clone(),
                query: QueryInstance::new(vec![i, 0]),
            })
            .collect()
    }

    #[test]
    fn one_pass_is_a_permutation() {
        let source = examples(8);
        let mut cycler = BatchCycler::new(source.clone(), 4, 7).unwrap();
        let mut seen: Vec<TrainExample> = Vec::new();
        for _ in 0..2 {
            seen.extend(cycler.next_batch().examples);
        }
        seen.sort();
        let mut expected = source;
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn wrap_refills_batches_to_full_size() {
        let mut cycler = BatchCycler::new(examples(5), 2, 1).unwrap();
        let mut counts = std::collections::HashMap::new();
        for _ in 0..5 {
            let batch = cycler.next_batch();
            assert_eq!(batch.examples.len(), 2);
            for example in batch.examples {
                *counts.entry(example.query).or_insert(0u32) += 1;
            }
        }
        // two full passes: every example drawn exactly twice
        assert!(counts.values().all(|&c| c == 2));
        assert_eq!(cycler.batches_drawn(), 5);
    }

    #[test]
    fn same_seed_same_order() {
        let mut a = BatchCycler::new(examples(16), 4, 9).unwrap();
        let mut b = BatchCycler::new(examples(16), 4, 9).unwrap();
        for _ in 0..6 {
            assert_eq!(a.next_batch().examples, b.next_batch().examples);
        }
    }

    #[test]
    fn empty_partition_is_rejected() {
        let err = BatchCycler::new(Vec::new(), 4, 0).unwrap_err();
        assert!(err.to_string().contains("empty partition"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = BatchCycler::new(examples(3), 0, 0).unwrap_err();
        assert!(err.to_string().contains("batch size"));
    }
}
