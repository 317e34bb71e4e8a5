//! Logical query shapes and symbolic execution over knowledge graphs.
//!
//! A multi-hop first-order query is described by a *shape*: a template
//! saying where the anchor entities, relation projections, intersections,
//! unions, and negations sit, without naming concrete ids. The supported
//! shapes form a fixed catalogue with short task names:
//!
//! | Name | Shape (canonical tuple form) |
//! |------|------------------------------|
//! | `1p` | `("e", ("r",))` |
//! | `2i` | `(("e", ("r",)), ("e", ("r",)))` |
//! | `2in` | `(("e", ("r",)), ("e", ("r", "n")))` |
//! | `2u-DNF` | `(("e", ("r",)), ("e", ("r",)), ("u",))` |
//! | `up-DM` | `((("e", ("r", "n")), ("e", ("r", "n"))), ("n", "r"))` |
//!
//! (and so on for the remaining tasks; see [`StructureRegistry`]).
//!
//! Grounded queries pair a shape with a flat list of entity/relation ids and
//! can be executed exactly against a [`RelationMatrix`], which answers them
//! with indicator vectors over the entity set.

pub mod registry;
pub mod shape;
pub mod symbolic;

pub use registry::StructureRegistry;
pub use shape::{parse_task_list, QueryShape, StepOp, TaskKind, TaskLabel, UnionMode};
pub use symbolic::RelationMatrix;

use thiserror::Error;

/// Errors from shape parsing, catalogue lookups, and symbolic execution.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown task name: {0}")]
    UnknownTask(String),

    #[error("unknown union mode: {0}")]
    UnknownUnionMode(String),

    #[error("unregistered query structure: {0}")]
    UnregisteredStructure(String),

    #[error("malformed grounded query: {0}")]
    MalformedQuery(String),

    #[error("entity id {0} out of range")]
    EntityOutOfRange(u64),

    #[error("relation id {0} out of range")]
    RelationOutOfRange(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
