use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_reason::{QueryShape, StructureRegistry, TaskKind, UnionMode};

use crate::config::RunConfig;
use crate::{Error, Result};

pub type EntityId = u64;
pub type RelationId = u64;

pub const STATS_FILE: &str = "stats.txt";
pub const TRIPLES_FILE: &str = "train-triples.bin";

/// Anchor-entity and relation ids of one grounded query, flattened in the
/// canonical order of its shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryInstance(pub Vec<u64>);

impl QueryInstance {
    pub fn new(ids: impl Into<Vec<u64>>) -> Self {
        Self(ids.into())
    }

    pub fn ids(&self) -> &[u64] {
        &self.0
    }
}

/// Queries grouped by shape.
pub type QuerySets = HashMap<QueryShape, HashSet<QueryInstance>>;
/// Correct answer entities per grounded query, grouped by shape.
///
/// Keyed by shape first because grounded id lists are only unique within
/// one shape: a `2i` and a `2u` query can flatten to the same four ids.
pub type AnswerSets = HashMap<QueryShape, HashMap<QueryInstance, BTreeSet<EntityId>>>;

/// Answer set recorded for one grounded query, if any.
pub fn answer_set<'a>(
    sets: &'a AnswerSets,
    shape: &QueryShape,
    query: &QueryInstance,
) -> Option<&'a BTreeSet<EntityId>> {
    sets.get(shape).and_then(|per_shape| per_shape.get(query))
}

/// One training example: a grounded query together with its shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrainExample {
    pub shape: QueryShape,
    pub query: QueryInstance,
}

/// Entity and relation counts read from `stats.txt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub num_entities: usize,
    pub num_relations: usize,
}

impl GraphStats {
    /// Parse `stats.txt`: two lines, each ending in a count
    /// (`numentity 14505` / `numrelations 474`).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATS_FILE);
        if !path.exists() {
            return Err(Error::MissingArtifact(path));
        }
        let text = fs::read_to_string(&path)?;
        let mut counts = text.lines().filter(|line| !line.trim().is_empty()).map(|line| {
            line.split_whitespace()
                .last()
                .and_then(|token| token.parse::<usize>().ok())
                .ok_or_else(|| Error::Config(format!("unparsable line in {}: {line:?}", path.display())))
        });
        let num_entities = counts
            .next()
            .unwrap_or_else(|| Err(Error::Config(format!("{} is empty", path.display()))))?;
        let num_relations = counts
            .next()
            .unwrap_or_else(|| Err(Error::Config(format!("{} has no relation count", path.display()))))?;
        Ok(Self { num_entities, num_relations })
    }
}

/// Evaluation regimes for inductive splits, by whether the entities of a
/// query were seen during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    /// Both anchor and answer entities seen in training.
    #[serde(rename = "ee")]
    Ee,
    /// Anchors seen, answers unseen.
    #[serde(rename = "es")]
    Es,
    /// Anchors unseen, answers seen.
    #[serde(rename = "se")]
    Se,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Ee, Regime::Es, Regime::Se];

    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Ee => "ee",
            Regime::Es => "es",
            Regime::Se => "se",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluation split for one regime.
#[derive(Debug, Clone)]
pub struct EvalSplit {
    pub regime: Regime,
    pub queries: QuerySets,
    /// Hard answers: require at least one held-out edge.
    pub answers: AnswerSets,
    /// Easy answers: reachable through training edges alone; filtered out
    /// of the ranking during evaluation.
    pub easy_answers: AnswerSets,
}

/// Everything loaded from a dataset directory.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub train_queries: QuerySets,
    pub train_answers: AnswerSets,
    pub valid: Vec<EvalSplit>,
    pub test: Vec<EvalSplit>,
}

/// Read one bincode artifact, failing loudly when it is absent.
pub fn load_bin<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(Error::MissingArtifact(path.to_path_buf()));
    }
    let file = File::open(path)?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

/// Write one bincode artifact.
pub fn save_bin<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), value)?;
    Ok(())
}

fn split_file(split: &str, regime: Regime, kind: &str) -> String {
    format!("{split}-{regime}-{kind}.bin")
}

fn load_eval_split(dir: &Path, split: &str, regime: Regime) -> Result<EvalSplit> {
    Ok(EvalSplit {
        regime,
        queries: load_bin(&dir.join(split_file(split, regime, "queries")))?,
        answers: load_bin(&dir.join(split_file(split, regime, "answers")))?,
        easy_answers: load_bin(&dir.join(split_file(split, regime, "easy-answers")))?,
    })
}

impl Dataset {
    /// Load every artifact the configured modes and regimes need, then
    /// prune each collection to the configured task mix.
    ///
    /// Any missing file is fatal, and every shape appearing in a loaded
    /// collection must be present in the registry.
    pub fn load(dir: &Path, config: &RunConfig, registry: &StructureRegistry) -> Result<Self> {
        let mut dataset = Dataset::default();

        if config.do_train {
            dataset.train_queries = load_bin(&dir.join("train-queries.bin"))?;
            dataset.train_answers = load_bin(&dir.join("train-answers.bin"))?;
        }

        let regimes: Vec<Regime> = Regime::ALL
            .into_iter()
            .filter(|regime| match regime {
                Regime::Ee => config.regime_ee,
                Regime::Es => config.regime_es,
                Regime::Se => config.regime_se,
            })
            .collect();

        if config.do_valid {
            for &regime in &regimes {
                dataset.valid.push(load_eval_split(dir, "valid", regime)?);
            }
        }
        if config.do_test {
            for &regime in &regimes {
                dataset.test.push(load_eval_split(dir, "test", regime)?);
            }
        }

        dataset.check_registered(registry)?;
        dataset.retain_tasks(&config.tasks, config.union_mode, registry)?;
        Ok(dataset)
    }

    fn check_registered(&self, registry: &StructureRegistry) -> Result<()> {
        check_registered(&self.train_queries, registry)?;
        for split in self.valid.iter().chain(&self.test) {
            check_registered(&split.queries, registry)?;
        }
        Ok(())
    }

    /// Prune every collection to the requested tasks under the active
    /// union mode.
    pub fn retain_tasks(
        &mut self,
        tasks: &[TaskKind],
        mode: UnionMode,
        registry: &StructureRegistry,
    ) -> Result<()> {
        retain_tasks(
            &mut self.train_queries,
            &mut [&mut self.train_answers],
            tasks,
            mode,
            registry,
        )?;
        for split in self.valid.iter_mut().chain(self.test.iter_mut()) {
            let EvalSplit { queries, answers, easy_answers, .. } = split;
            retain_tasks(queries, &mut [answers, easy_answers], tasks, mode, registry)?;
        }
        Ok(())
    }

    pub fn train_query_count(&self) -> usize {
        query_count(&self.train_queries)
    }
}

/// Total number of queries across all shapes.
pub fn query_count(sets: &QuerySets) -> usize {
    sets.values().map(HashSet::len).sum()
}

fn check_registered(queries: &QuerySets, registry: &StructureRegistry) -> Result<()> {
    for shape in queries.keys() {
        registry.label_of(shape)?;
    }
    Ok(())
}

/// Remove every structure-keyed entry whose task is not requested or whose
/// union mode differs from the active one. Answers for dropped shapes are
/// dropped with them. Idempotent.
pub fn retain_tasks(
    queries: &mut QuerySets,
    answers: &mut [&mut AnswerSets],
    tasks: &[TaskKind],
    mode: UnionMode,
    registry: &StructureRegistry,
) -> Result<()> {
    let mut dropped: Vec<QueryShape> = Vec::new();
    for shape in queries.keys() {
        let label = registry.label_of(shape)?;
        let requested = tasks.contains(&label.kind);
        let mode_matches = label.mode.map_or(true, |m| m == mode);
        if !(requested && mode_matches) {
            dropped.push(shape.clone());
        }
    }
    for shape in dropped {
        queries.remove(&shape);
        for map in answers.iter_mut() {
            map.remove(&shape);
        }
    }
    Ok(())
}

/// Split training queries into the path partition (`1p`/`2p`/`3p`) and the
/// rest, each sorted for a reproducible first shuffle.
pub fn partition_train(
    queries: &QuerySets,
    registry: &StructureRegistry,
) -> Result<(Vec<TrainExample>, Vec<TrainExample>)> {
    let mut path = Vec::new();
    let mut other = Vec::new();
    for (shape, instances) in queries {
        let label = registry.label_of(shape)?;
        let bucket = if label.kind.is_path() { &mut path } else { &mut other };
        for query in instances {
            bucket.push(TrainExample { shape: shape.clone(), query: query.clone() });
        }
    }
    path.sort();
    other.sort();
    Ok((path, other))
}

/// One evaluation batch.
pub type EvalBatch = Vec<TrainExample>;

/// Flatten evaluation queries into fixed-size batches, in sorted order.
pub fn eval_batches(queries: &QuerySets, batch_size: usize) -> Vec<EvalBatch> {
    let mut examples: Vec<TrainExample> = queries
        .iter()
        .flat_map(|(shape, instances)| {
            instances.iter().map(|query| TrainExample {
                shape: shape.clone(),
                query: query.clone(),
            })
        })
        .collect();
    examples.sort();
    let batch_size = batch_size.max(1);
    examples
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_reason::StepOp;

    fn registry() -> StructureRegistry {
        StructureRegistry::catalogue()
    }

    fn shape_of(kind: TaskKind, mode: UnionMode) -> QueryShape {
        registry().shape_for(kind, mode).unwrap().clone()
    }

    fn sample_sets() -> (QuerySets, AnswerSets) {
        let mut queries = QuerySets::new();
        let mut answers = AnswerSets::new();
        let mut add = |shape: QueryShape, ids: Vec<u64>, entities: &[u64]| {
            let query = QueryInstance::new(ids);
            queries.entry(shape.clone()).or_default().insert(query.clone());
            answers
                .entry(shape)
                .or_default()
                .insert(query, entities.iter().copied().collect());
        };

        add(shape_of(TaskKind::P1, UnionMode::Dnf), vec![0, 0], &[1, 3]);
        // the two union encodings ground to the same flat ids
        add(shape_of(TaskKind::U2, UnionMode::Dnf), vec![0, 0, 1, 1], &[1, 2, 3]);
        add(shape_of(TaskKind::U2, UnionMode::DeMorgan), vec![0, 0, 1, 1], &[1, 2, 3]);
        add(shape_of(TaskKind::I2, UnionMode::Dnf), vec![1, 1, 4, 1], &[2]);

        (queries, answers)
    }

    #[test]
    fn filter_keeps_requested_tasks_under_the_active_mode() {
        let registry = registry();
        let (mut queries, mut answers) = sample_sets();

        retain_tasks(
            &mut queries,
            &mut [&mut answers],
            &[TaskKind::P1, TaskKind::U2],
            UnionMode::Dnf,
            &registry,
        )
        .unwrap();

        assert_eq!(queries.len(), 2);
        assert!(queries.contains_key(&shape_of(TaskKind::P1, UnionMode::Dnf)));
        assert!(queries.contains_key(&shape_of(TaskKind::U2, UnionMode::Dnf)));
        assert!(!queries.contains_key(&shape_of(TaskKind::U2, UnionMode::DeMorgan)));
        assert!(!queries.contains_key(&shape_of(TaskKind::I2, UnionMode::Dnf)));
        // answers of the dropped shapes went with them, and dropping the
        // De Morgan entry left the DNF answers for the same ids alone
        assert_eq!(answers.len(), 2);
        assert!(answers[&shape_of(TaskKind::U2, UnionMode::Dnf)]
            .contains_key(&QueryInstance::new(vec![0, 0, 1, 1])));
    }

    #[test]
    fn filter_is_idempotent() {
        let registry = registry();
        let (mut queries, mut answers) = sample_sets();
        let tasks = [TaskKind::P1, TaskKind::U2];

        retain_tasks(&mut queries, &mut [&mut answers], &tasks, UnionMode::Dnf, &registry).unwrap();
        let once = (queries.clone(), answers.clone());
        retain_tasks(&mut queries, &mut [&mut answers], &tasks, UnionMode::Dnf, &registry).unwrap();
        assert_eq!((queries, answers), once);
    }

    #[test]
    fn unregistered_shape_fails_the_filter() {
        let registry = registry();
        let mut queries = QuerySets::new();
        let stray = QueryShape::anchor(&[StepOp::Project; 5]);
        queries.entry(stray).or_default().insert(QueryInstance::new(vec![0, 0, 0, 0, 0, 0]));
        let mut answers = AnswerSets::new();
        let err = retain_tasks(
            &mut queries,
            &mut [&mut answers],
            &[TaskKind::P1],
            UnionMode::Dnf,
            &registry,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }

    #[test]
    fn partition_split_follows_path_classification() {
        let registry = registry();
        let (queries, _) = sample_sets();
        let (path, other) = partition_train(&queries, &registry).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(other.len(), 3);
        assert!(registry.label_of(&path[0].shape).unwrap().kind.is_path());
    }

    #[test]
    fn stats_parsing_reads_trailing_counts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATS_FILE), "numentity 14505\nnumrelations 474\n").unwrap();
        let stats = GraphStats::load(dir.path()).unwrap();
        assert_eq!(stats.num_entities, 14505);
        assert_eq!(stats.num_relations, 474);
    }

    #[test]
    fn missing_stats_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = GraphStats::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::MissingArtifact(_)));
    }

    #[test]
    fn loader_reads_and_filters_train_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (queries, answers) = sample_sets();
        save_bin(&dir.path().join("train-queries.bin"), &queries).unwrap();
        save_bin(&dir.path().join("train-answers.bin"), &answers).unwrap();

        let config = RunConfig {
            do_train: true,
            ..RunConfig::default()
        };
        let dataset = Dataset::load(dir.path(), &config, &registry()).unwrap();
        // every task under DNF: only the De Morgan union entry is pruned
        assert_eq!(dataset.train_queries.len(), queries.len() - 1);
        assert!(!dataset.train_queries.contains_key(&shape_of(TaskKind::U2, UnionMode::DeMorgan)));
        assert_eq!(
            dataset.train_queries[&shape_of(TaskKind::P1, UnionMode::Dnf)],
            queries[&shape_of(TaskKind::P1, UnionMode::Dnf)]
        );
        assert_eq!(dataset.train_answers.len(), answers.len() - 1);
        assert_eq!(
            dataset.train_answers[&shape_of(TaskKind::U2, UnionMode::Dnf)],
            answers[&shape_of(TaskKind::U2, UnionMode::Dnf)]
        );
        assert!(dataset.valid.is_empty());
    }

    #[test]
    fn loader_names_the_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            do_train: true,
            ..RunConfig::default()
        };
        let err = Dataset::load(dir.path(), &config, &registry()).unwrap_err();
        match err {
            Error::MissingArtifact(path) => {
                assert!(path.ends_with("train-queries.bin"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn eval_batches_chunk_in_sorted_order() {
        let (queries, _) = sample_sets();
        let batches = eval_batches(&queries, 3);
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 4);
        assert_eq!(batches.len(), 2);
        assert!(batches[0].len() == 3 && batches[1].len() == 1);
        let flattened: Vec<_> = batches.concat();
        let mut sorted = flattened.clone();
        sorted.sort();
        assert_eq!(flattened, sorted);
    }
}
