//! Concrete model families behind the [`ReasoningModel`] seam.
//!
//! Only the neural-symbolic family runs on the CPU path today; the
//! embedding families are selectable in configuration but need a tensor
//! backend to construct.

mod symbolic;

pub use symbolic::SymbolicModel;

use trellis_reason::{RelationMatrix, StructureRegistry};

use crate::config::{ModelFamily, RunConfig};
use crate::graph::NeighborIndex;
use crate::model::ReasoningModel;
use crate::{Error, Result};

/// Construct the configured model family.
///
/// The neural-symbolic family executes queries over the training graph
/// and needs its relation matrix; the neighborhood index, when given,
/// becomes the model's pooling context. Every other family is rejected
/// here rather than half-built.
pub fn build_model(
    config: &RunConfig,
    matrix: Option<RelationMatrix>,
    neighbors: Option<NeighborIndex>,
    registry: &StructureRegistry,
) -> Result<Box<dyn ReasoningModel>> {
    match config.family {
        ModelFamily::NeuralSymbolic => {
            let matrix = matrix.ok_or_else(|| {
                Error::Config("neural-symbolic family needs the training graph matrix".into())
            })?;
            Ok(Box::new(SymbolicModel::new(matrix, neighbors, config, registry)?))
        }
        other => Err(Error::UnsupportedFamily(other.as_str().to_string())),
    }
}
