use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use trellis_reason::RelationMatrix;

use crate::data::{EntityId, RelationId};
use crate::Result;

/// Capped per-entity adjacency, sampled once at startup.
///
/// Entities with more outgoing edges than the cap keep a seeded random
/// subset, so high-degree hubs cost the same as everything else.
#[derive(Debug, Clone)]
pub struct NeighborIndex {
    max_neighbor: usize,
    neighbors: Vec<Vec<(RelationId, EntityId)>>,
}

impl NeighborIndex {
    pub fn build(matrix: &RelationMatrix, max_neighbor: usize, seed: u64) -> Result<Self> {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut neighbors = Vec::with_capacity(matrix.num_entities());
        for entity in 0..matrix.num_entities() {
            let mut out: Vec<(RelationId, EntityId)> = Vec::new();
            for relation in 0..matrix.num_relations() {
                for &target in matrix.out_neighbors(relation as u64, entity as u64)? {
                    out.push((relation as u64, target as u64));
                }
            }
            if max_neighbor > 0 && out.len() > max_neighbor {
                out.shuffle(&mut rng);
                out.truncate(max_neighbor);
                out.sort_unstable();
            }
            neighbors.push(out);
        }
        Ok(Self { max_neighbor, neighbors })
    }

    pub fn max_neighbor(&self) -> usize {
        self.max_neighbor
    }

    pub fn num_entities(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self, entity: EntityId) -> &[(RelationId, EntityId)] {
        self.neighbors
            .get(entity as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn avg_degree(&self) -> f64 {
        if self.neighbors.is_empty() {
            return 0.0;
        }
        let total: usize = self.neighbors.iter().map(Vec::len).sum();
        total as f64 / self.neighbors.len() as f64
    }
}
