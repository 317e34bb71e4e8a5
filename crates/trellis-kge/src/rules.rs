use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use trellis_reason::RelationMatrix;

use crate::data::{load_bin, save_bin, RelationId};
use crate::{Error, Result};

pub const RULE_MATRIX_FILE: &str = "rule-matrix.bin";

/// A horn rule over relations: following `body` in order implies `head`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub body: Vec<RelationId>,
    pub head: RelationId,
    pub confidence: f64,
}

/// Mined rules with the parameters they were mined under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    pub rules: Vec<Rule>,
    pub max_len: usize,
    pub threshold: f64,
}

impl RuleTable {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules at or above a confidence bound.
    pub fn confident(&self, threshold: f64) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |rule| rule.confidence >= threshold)
    }
}

/// Mining happens offline; this seam lets a run regenerate the cache
/// when a miner is wired in.
pub trait RuleMiner {
    fn mine(&self, matrix: &RelationMatrix, max_len: usize, threshold: f64) -> Result<RuleTable>;
}

/// Read the cached rule table if one exists.
pub fn load_cached(dir: &Path) -> Result<Option<RuleTable>> {
    let path = dir.join(RULE_MATRIX_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(load_bin(&path)?))
}

/// Read the cached rule table, failing when the cache was never built.
pub fn require_cached(dir: &Path) -> Result<RuleTable> {
    load_cached(dir)?.ok_or_else(|| Error::MissingArtifact(dir.join(RULE_MATRIX_FILE)))
}

/// Mine a fresh table and persist it for later runs.
pub fn mine_and_cache(
    miner: &dyn RuleMiner,
    matrix: &RelationMatrix,
    max_len: usize,
    threshold: f64,
    dir: &Path,
) -> Result<RuleTable> {
    let table = miner.mine(matrix, max_len, threshold)?;
    save_bin(&dir.join(RULE_MATRIX_FILE), &table)?;
    Ok(table)
}

/// Materialize the triples the confident rules imply over a graph.
///
/// For each rule, every entity reachable from a start entity through the
/// body chain yields one `(start, head, reached)` triple. Triples the
/// graph already holds are not filtered here; rebuilding the matrix
/// tolerates duplicates.
pub fn infer_triples(
    matrix: &RelationMatrix,
    table: &RuleTable,
    threshold: f64,
) -> Result<Vec<(u64, u64, u64)>> {
    let mut inferred = BTreeSet::new();
    for rule in table.confident(threshold) {
        if rule.head as usize >= matrix.num_relations() {
            return Err(Error::Invariant(format!(
                "rule head relation {} out of range",
                rule.head
            )));
        }
        for start in 0..matrix.num_entities() {
            let mut frontier = vec![start];
            for &relation in &rule.body {
                let mut next = BTreeSet::new();
                for &entity in &frontier {
                    next.extend(matrix.out_neighbors(relation, entity as u64)?);
                }
                frontier = next.into_iter().collect();
                if frontier.is_empty() {
                    break;
                }
            }
            for &reached in &frontier {
                inferred.insert((start as u64, rule.head, reached as u64));
            }
        }
    }
    Ok(inferred.into_iter().collect())
}
