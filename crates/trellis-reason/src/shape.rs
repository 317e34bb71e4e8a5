use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// One step in a projection chain: follow a relation or complement the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepOp {
    /// Relation projection, `"r"` in the canonical tuple form.
    Project,
    /// Set complement, `"n"` in the canonical tuple form.
    Negate,
}

/// Template shape of a multi-hop first-order logical query.
///
/// A shape fixes the logical skeleton of a query without naming entities or
/// relations. Grounding a shape means pairing it with a flat id list: one id
/// per anchor and one per [`StepOp::Project`], in left-to-right order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryShape {
    /// An anchor entity with a chain of steps: `("e", (ops...))`.
    Anchor(Vec<StepOp>),
    /// A chain of steps applied to the result of a sub-shape.
    Apply(Box<QueryShape>, Vec<StepOp>),
    /// Intersection of sub-shapes (AND).
    Intersection(Vec<QueryShape>),
    /// Union of sub-shapes (OR), the disjunctive encoding.
    Union(Vec<QueryShape>),
}

impl QueryShape {
    pub fn anchor(steps: &[StepOp]) -> Self {
        Self::Anchor(steps.to_vec())
    }

    pub fn apply(self, steps: &[StepOp]) -> Self {
        Self::Apply(Box::new(self), steps.to_vec())
    }

    pub fn and(shapes: Vec<QueryShape>) -> Self {
        Self::Intersection(shapes)
    }

    pub fn or(shapes: Vec<QueryShape>) -> Self {
        Self::Union(shapes)
    }

    /// Number of id slots a grounded query of this shape occupies.
    ///
    /// Anchors and projections each take one id; negation is a structural
    /// marker and takes none.
    pub fn arity(&self) -> usize {
        match self {
            Self::Anchor(steps) => 1 + projection_count(steps),
            Self::Apply(sub, steps) => sub.arity() + projection_count(steps),
            Self::Intersection(shapes) | Self::Union(shapes) => {
                shapes.iter().map(QueryShape::arity).sum()
            }
        }
    }

    /// True when the shape contains a negation step anywhere.
    pub fn has_negation(&self) -> bool {
        match self {
            Self::Anchor(steps) => steps.contains(&StepOp::Negate),
            Self::Apply(sub, steps) => steps.contains(&StepOp::Negate) || sub.has_negation(),
            Self::Intersection(shapes) | Self::Union(shapes) => {
                shapes.iter().any(QueryShape::has_negation)
            }
        }
    }
}

fn projection_count(steps: &[StepOp]) -> usize {
    steps.iter().filter(|s| **s == StepOp::Project).count()
}

fn render_steps(f: &mut fmt::Formatter<'_>, steps: &[StepOp]) -> fmt::Result {
    write!(f, "(")?;
    for (i, step) in steps.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match step {
            StepOp::Project => write!(f, "\"r\"")?,
            StepOp::Negate => write!(f, "\"n\"")?,
        }
    }
    // single-element tuples keep the trailing comma of the canonical form
    if steps.len() == 1 {
        write!(f, ",")?;
    }
    write!(f, ")")
}

impl fmt::Display for QueryShape {
    /// Renders the canonical nested-tuple text form, e.g. `("e", ("r", "n"))`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anchor(steps) => {
                write!(f, "(\"e\", ")?;
                render_steps(f, steps)?;
                write!(f, ")")
            }
            Self::Apply(sub, steps) => {
                write!(f, "({sub}, ")?;
                render_steps(f, steps)?;
                write!(f, ")")
            }
            Self::Intersection(shapes) => {
                write!(f, "(")?;
                for (i, shape) in shapes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{shape}")?;
                }
                write!(f, ")")
            }
            Self::Union(shapes) => {
                write!(f, "(")?;
                for shape in shapes {
                    write!(f, "{shape}, ")?;
                }
                write!(f, "(\"u\",))")
            }
        }
    }
}

/// Short names of the supported query tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "1p")]
    P1,
    #[serde(rename = "2p")]
    P2,
    #[serde(rename = "3p")]
    P3,
    #[serde(rename = "2i")]
    I2,
    #[serde(rename = "3i")]
    I3,
    #[serde(rename = "ip")]
    Ip,
    #[serde(rename = "pi")]
    Pi,
    #[serde(rename = "2in")]
    In2,
    #[serde(rename = "3in")]
    In3,
    #[serde(rename = "inp")]
    Inp,
    #[serde(rename = "pin")]
    Pin,
    #[serde(rename = "pni")]
    Pni,
    #[serde(rename = "2u")]
    U2,
    #[serde(rename = "up")]
    Up,
}

impl TaskKind {
    /// Every task, in catalogue order.
    pub const ALL: [TaskKind; 14] = [
        TaskKind::P1,
        TaskKind::P2,
        TaskKind::P3,
        TaskKind::I2,
        TaskKind::I3,
        TaskKind::Ip,
        TaskKind::Pi,
        TaskKind::In2,
        TaskKind::In3,
        TaskKind::Inp,
        TaskKind::Pin,
        TaskKind::Pni,
        TaskKind::U2,
        TaskKind::Up,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::P1 => "1p",
            TaskKind::P2 => "2p",
            TaskKind::P3 => "3p",
            TaskKind::I2 => "2i",
            TaskKind::I3 => "3i",
            TaskKind::Ip => "ip",
            TaskKind::Pi => "pi",
            TaskKind::In2 => "2in",
            TaskKind::In3 => "3in",
            TaskKind::Inp => "inp",
            TaskKind::Pin => "pin",
            TaskKind::Pni => "pni",
            TaskKind::U2 => "2u",
            TaskKind::Up => "up",
        }
    }

    /// Path tasks are plain projection chains; the training scheduler feeds
    /// them through their own iterator.
    pub fn is_path(self) -> bool {
        matches!(self, TaskKind::P1 | TaskKind::P2 | TaskKind::P3)
    }

    /// Union tasks are ambiguous without a union-evaluation mode.
    pub fn has_union(self) -> bool {
        matches!(self, TaskKind::U2 | TaskKind::Up)
    }

    /// Tasks whose shape contains a negation step.
    pub fn has_negation(self) -> bool {
        matches!(
            self,
            TaskKind::In2 | TaskKind::In3 | TaskKind::Inp | TaskKind::Pin | TaskKind::Pni
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownTask(s.to_string()))
    }
}

/// Parse a dot-separated task list, e.g. `"1p.2p.2i"`.
pub fn parse_task_list(list: &str) -> Result<Vec<TaskKind>> {
    let mut tasks = Vec::new();
    for part in list.split('.') {
        let part = part.trim();
        if part.is_empty() {
            return Err(Error::UnknownTask(list.to_string()));
        }
        tasks.push(part.parse()?);
    }
    Ok(tasks)
}

/// How union queries are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnionMode {
    /// Disjunctive normal form: unions stay explicit at the top level.
    #[serde(rename = "DNF")]
    Dnf,
    /// De Morgan rewriting: a union becomes a negated intersection of
    /// negations.
    #[serde(rename = "DM")]
    DeMorgan,
}

impl UnionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UnionMode::Dnf => "DNF",
            UnionMode::DeMorgan => "DM",
        }
    }
}

impl fmt::Display for UnionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DNF" => Ok(UnionMode::Dnf),
            "DM" => Ok(UnionMode::DeMorgan),
            other => Err(Error::UnknownUnionMode(other.to_string())),
        }
    }
}

/// Full label of a catalogue entry: the task name plus, for union tasks,
/// the union-mode suffix (`"2u-DNF"`, `"up-DM"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskLabel {
    pub kind: TaskKind,
    pub mode: Option<UnionMode>,
}

impl TaskLabel {
    pub fn plain(kind: TaskKind) -> Self {
        Self { kind, mode: None }
    }

    pub fn with_mode(kind: TaskKind, mode: UnionMode) -> Self {
        Self { kind, mode: Some(mode) }
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Some(mode) => write!(f, "{}-{}", self.kind, mode),
            None => write!(f, "{}", self.kind),
        }
    }
}
