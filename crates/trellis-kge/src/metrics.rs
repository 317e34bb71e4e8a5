use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use trellis_reason::{QueryShape, StructureRegistry};

use crate::model::MetricMap;
use crate::{Error, Result};

/// Per-shape query count reported by `test_step`; summed rather than
/// averaged when shapes are combined.
pub const NUM_QUERIES_KEY: &str = "num_queries";

/// Destination for scalar training and evaluation telemetry.
pub trait MetricsSink {
    fn scalar(&mut self, key: &str, value: f64, step: u64) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ScalarRecord<'a> {
    step: u64,
    key: &'a str,
    value: f64,
}

/// Appends one JSON object per scalar to a `.jsonl` file.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open in append mode so a resumed run extends the same history.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: BufWriter::new(file) })
    }
}

impl MetricsSink for JsonlSink {
    fn scalar(&mut self, key: &str, value: f64, step: u64) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &ScalarRecord { step, key, value })?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Discards everything; for runs without a telemetry directory and for
/// tests.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn scalar(&mut self, _key: &str, _value: f64, _step: u64) -> Result<()> {
        Ok(())
    }
}

/// Collapse per-shape evaluation metrics into one flat map.
///
/// Every ranking metric gets a per-label entry plus an `average_` entry
/// weighting each structure equally, regardless of how many queries it
/// contributed. Query counts are summed instead. A shape that reports
/// zero queries would silently poison the average, so it is an error.
pub fn aggregate(
    per_shape: &HashMap<QueryShape, MetricMap>,
    registry: &StructureRegistry,
) -> Result<MetricMap> {
    if per_shape.is_empty() {
        return Err(Error::Invariant("no structures to aggregate".into()));
    }

    let mut out = MetricMap::new();
    let mut names: BTreeSet<&str> = BTreeSet::new();
    let mut total_queries = 0.0;

    for (shape, metrics) in per_shape {
        let label = registry.label_of(shape)?;
        let queries = metrics.get(NUM_QUERIES_KEY).copied().ok_or_else(|| {
            Error::Invariant(format!("structure {label} reported no {NUM_QUERIES_KEY}"))
        })?;
        if queries <= 0.0 {
            return Err(Error::Invariant(format!("structure {label} evaluated zero queries")));
        }
        total_queries += queries;
        for (name, value) in metrics {
            out.insert(format!("{label}_{name}"), *value);
            if name != NUM_QUERIES_KEY {
                names.insert(name);
            }
        }
    }

    let structures = per_shape.len() as f64;
    for name in names {
        let sum: f64 = per_shape.values().filter_map(|metrics| metrics.get(name)).sum();
        out.insert(format!("average_{name}"), sum / structures);
    }
    out.insert(format!("average_{NUM_QUERIES_KEY}"), total_queries);
    Ok(out)
}

/// Mean of each key over a window of per-step training metrics.
pub fn average_logs(window: &[MetricMap]) -> MetricMap {
    let mut sums = MetricMap::new();
    let mut counts: HashMap<String, f64> = HashMap::new();
    for metrics in window {
        for (key, value) in metrics {
            *sums.entry(key.clone()).or_insert(0.0) += value;
            *counts.entry(key.clone()).or_insert(0.0) += 1.0;
        }
    }
    for (key, value) in sums.iter_mut() {
        *value /= counts[key];
    }
    sums
}

/// Mirror a metric map to the log, one line per scalar.
pub fn log_metrics(scope: &str, step: u64, metrics: &MetricMap) {
    for (key, value) in metrics {
        info!("{scope} {key} at step {step}: {value:.6}");
    }
}
