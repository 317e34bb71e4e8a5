//! Training and evaluation harness for logical query answering over
//! knowledge graphs.
//!
//! `trellis-kge` drives a [`ReasoningModel`] through alternating-batch
//! training with periodic evaluation, checkpointing, and scalar
//! telemetry:
//!
//! - Load query/answer splits produced by the dataset pipeline
//! - Filter them down to the requested task mix
//! - Alternate path and non-path batches at a fixed ratio
//! - Decay the learning rate once at the warm-up boundary
//! - Aggregate ranking metrics with equal weight per query structure
//! - Snapshot everything needed for an exact resume
//!
//! # Crate Structure
//!
//! - [`config`] - Run configuration, model families, validation
//! - [`data`] - Dataset artifacts, task filtering, batching inputs
//! - [`iterate`] - Endless shuffled batch cycling
//! - [`model`] - The model seam and serializable tensor state
//! - [`models`] - Concrete families (neural-symbolic execution)
//! - [`optim`] - Adam and the optimizer seam
//! - [`train`] - The step scheduler and evaluation driver
//! - [`metrics`] - Structure-equal aggregation and telemetry sinks
//! - [`checkpoint`] - Atomic run snapshots
//! - [`rules`] - Cached horn rules and graph densification
//! - [`graph`] - Capped neighborhood sampling

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod graph;
pub mod iterate;
pub mod metrics;
pub mod model;
pub mod models;
pub mod optim;
pub mod rules;
pub mod train;

mod error;

pub use checkpoint::{CheckpointManager, RunSnapshot};
pub use config::{ModelFamily, RunConfig};
pub use data::{Dataset, EvalSplit, GraphStats, QueryInstance, Regime, TrainExample};
pub use error::{Error, Result};
pub use graph::NeighborIndex;
pub use iterate::{BatchCycler, TrainBatch};
pub use metrics::{JsonlSink, MetricsSink, NullSink};
pub use model::{ModelState, PretrainedBundle, ReasoningModel, TensorData};
pub use models::{build_model, SymbolicModel};
pub use optim::{Adam, Optimizer, OptimizerState};
pub use train::{evaluate, Phase, TrainLoop};
