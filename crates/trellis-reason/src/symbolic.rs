use serde::{Deserialize, Serialize};

use crate::shape::{QueryShape, StepOp};
use crate::{Error, Result};

/// Directed sparse adjacency in CSR form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Csr {
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl Csr {
    fn from_edges(num_nodes: usize, edges: &[(usize, usize)]) -> Self {
        let mut sorted_edges = edges.to_vec();
        sorted_edges.sort_unstable();

        let mut row_ptr = vec![0; num_nodes + 1];
        let mut col_idx = Vec::with_capacity(sorted_edges.len());

        for &(u, v) in &sorted_edges {
            row_ptr[u + 1] += 1;
            col_idx.push(v);
        }
        for i in 0..num_nodes {
            row_ptr[i + 1] += row_ptr[i];
        }

        Self { row_ptr, col_idx }
    }

    /// Sparse matrix-vector product over an indicator vector: y = v * A.
    fn spmv(&self, v: &[bool]) -> Vec<bool> {
        let mut y = vec![false; v.len()];
        for (i, &active) in v.iter().enumerate() {
            if active {
                for &neighbor in &self.col_idx[self.row_ptr[i]..self.row_ptr[i + 1]] {
                    y[neighbor] = true;
                }
            }
        }
        y
    }

    fn neighbors(&self, node: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[node]..self.row_ptr[node + 1]]
    }
}

/// Per-relation adjacency matrices over dense entity ids.
///
/// Grounded queries execute against this structure exactly: projection is a
/// sparse matrix-vector product, intersection is AND, union is OR, negation
/// is complement over the entity set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationMatrix {
    num_entities: usize,
    triple_count: usize,
    relations: Vec<Csr>,
}

impl RelationMatrix {
    /// Build from (head, relation, tail) triples.
    ///
    /// Ids must fall inside the declared entity/relation counts.
    pub fn from_triples(
        num_entities: usize,
        num_relations: usize,
        triples: &[(u64, u64, u64)],
    ) -> Result<Self> {
        let mut edges_by_rel: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_relations];
        for &(head, relation, tail) in triples {
            if head as usize >= num_entities {
                return Err(Error::EntityOutOfRange(head));
            }
            if tail as usize >= num_entities {
                return Err(Error::EntityOutOfRange(tail));
            }
            let rel = relation as usize;
            if rel >= num_relations {
                return Err(Error::RelationOutOfRange(relation));
            }
            edges_by_rel[rel].push((head as usize, tail as usize));
        }

        let relations = edges_by_rel
            .iter()
            .map(|edges| Csr::from_edges(num_entities, edges))
            .collect();

        Ok(Self {
            num_entities,
            triple_count: triples.len(),
            relations,
        })
    }

    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    pub fn triple_count(&self) -> usize {
        self.triple_count
    }

    /// Out-neighbors of an entity under one relation.
    pub fn out_neighbors(&self, relation: u64, entity: u64) -> Result<&[usize]> {
        let rel = self
            .relations
            .get(relation as usize)
            .ok_or(Error::RelationOutOfRange(relation))?;
        if entity as usize >= self.num_entities {
            return Err(Error::EntityOutOfRange(entity));
        }
        Ok(rel.neighbors(entity as usize))
    }

    /// Execute a grounded query, returning the indicator vector of answers.
    ///
    /// `ids` holds anchor-entity and relation ids flattened in the canonical
    /// order of the shape; its length must equal `shape.arity()`.
    pub fn execute(&self, shape: &QueryShape, ids: &[u64]) -> Result<Vec<bool>> {
        let mut cursor = 0;
        let answers = self.eval(shape, ids, &mut cursor)?;
        if cursor != ids.len() {
            return Err(Error::MalformedQuery(format!(
                "shape consumes {cursor} ids but the query carries {}",
                ids.len()
            )));
        }
        Ok(answers)
    }

    fn eval(&self, shape: &QueryShape, ids: &[u64], cursor: &mut usize) -> Result<Vec<bool>> {
        match shape {
            QueryShape::Anchor(steps) => {
                let entity = self.take_id(ids, cursor)?;
                if entity as usize >= self.num_entities {
                    return Err(Error::EntityOutOfRange(entity));
                }
                let mut v = vec![false; self.num_entities];
                v[entity as usize] = true;
                self.apply_steps(v, steps, ids, cursor)
            }
            QueryShape::Apply(sub, steps) => {
                let v = self.eval(sub, ids, cursor)?;
                self.apply_steps(v, steps, ids, cursor)
            }
            QueryShape::Intersection(shapes) => {
                let mut result: Option<Vec<bool>> = None;
                for shape in shapes {
                    let v = self.eval(shape, ids, cursor)?;
                    result = Some(match result {
                        None => v,
                        Some(mut acc) => {
                            for (a, b) in acc.iter_mut().zip(&v) {
                                *a &= *b;
                            }
                            acc
                        }
                    });
                }
                result.ok_or_else(|| Error::MalformedQuery("empty intersection".to_string()))
            }
            QueryShape::Union(shapes) => {
                let mut acc = vec![false; self.num_entities];
                if shapes.is_empty() {
                    return Err(Error::MalformedQuery("empty union".to_string()));
                }
                for shape in shapes {
                    let v = self.eval(shape, ids, cursor)?;
                    for (a, b) in acc.iter_mut().zip(&v) {
                        *a |= *b;
                    }
                }
                Ok(acc)
            }
        }
    }

    fn apply_steps(
        &self,
        mut v: Vec<bool>,
        steps: &[StepOp],
        ids: &[u64],
        cursor: &mut usize,
    ) -> Result<Vec<bool>> {
        for step in steps {
            match step {
                StepOp::Project => {
                    let relation = self.take_id(ids, cursor)?;
                    let matrix = self
                        .relations
                        .get(relation as usize)
                        .ok_or(Error::RelationOutOfRange(relation))?;
                    v = matrix.spmv(&v);
                }
                StepOp::Negate => {
                    for value in v.iter_mut() {
                        *value = !*value;
                    }
                }
            }
        }
        Ok(v)
    }

    fn take_id(&self, ids: &[u64], cursor: &mut usize) -> Result<u64> {
        let id = ids.get(*cursor).copied().ok_or_else(|| {
            Error::MalformedQuery(format!("query ran out of ids at slot {}", *cursor))
        })?;
        *cursor += 1;
        Ok(id)
    }
}
