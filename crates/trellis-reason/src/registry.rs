use std::collections::HashMap;

use crate::shape::{QueryShape, StepOp, TaskKind, TaskLabel, UnionMode};
use crate::{Error, Result};

/// Immutable bidirectional catalogue of the supported query structures.
///
/// Sixteen entries: fourteen task kinds, with each union kind present once
/// per union mode. Lookups are O(1) in both directions. The catalogue is
/// built once at startup and passed by reference; there is no global copy.
#[derive(Debug, Clone)]
pub struct StructureRegistry {
    by_key: HashMap<(TaskKind, Option<UnionMode>), QueryShape>,
    by_shape: HashMap<QueryShape, TaskLabel>,
}

impl StructureRegistry {
    /// The full catalogue.
    pub fn catalogue() -> Self {
        let mut registry = Self {
            by_key: HashMap::new(),
            by_shape: HashMap::new(),
        };

        let one_hop = || QueryShape::anchor(&[StepOp::Project]);
        let two_hop = || QueryShape::anchor(&[StepOp::Project, StepOp::Project]);
        let negated_hop = || QueryShape::anchor(&[StepOp::Project, StepOp::Negate]);

        registry.insert(TaskLabel::plain(TaskKind::P1), one_hop());
        registry.insert(TaskLabel::plain(TaskKind::P2), two_hop());
        registry.insert(
            TaskLabel::plain(TaskKind::P3),
            QueryShape::anchor(&[StepOp::Project, StepOp::Project, StepOp::Project]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::I2),
            QueryShape::and(vec![one_hop(), one_hop()]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::I3),
            QueryShape::and(vec![one_hop(), one_hop(), one_hop()]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::Ip),
            QueryShape::and(vec![one_hop(), one_hop()]).apply(&[StepOp::Project]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::Pi),
            QueryShape::and(vec![two_hop(), one_hop()]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::In2),
            QueryShape::and(vec![one_hop(), negated_hop()]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::In3),
            QueryShape::and(vec![one_hop(), one_hop(), negated_hop()]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::Inp),
            QueryShape::and(vec![one_hop(), negated_hop()]).apply(&[StepOp::Project]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::Pin),
            QueryShape::and(vec![two_hop(), negated_hop()]),
        );
        registry.insert(
            TaskLabel::plain(TaskKind::Pni),
            QueryShape::and(vec![
                QueryShape::anchor(&[StepOp::Project, StepOp::Project, StepOp::Negate]),
                one_hop(),
            ]),
        );

        registry.insert(
            TaskLabel::with_mode(TaskKind::U2, UnionMode::Dnf),
            QueryShape::or(vec![one_hop(), one_hop()]),
        );
        registry.insert(
            TaskLabel::with_mode(TaskKind::Up, UnionMode::Dnf),
            QueryShape::or(vec![one_hop(), one_hop()]).apply(&[StepOp::Project]),
        );
        registry.insert(
            TaskLabel::with_mode(TaskKind::U2, UnionMode::DeMorgan),
            QueryShape::and(vec![negated_hop(), negated_hop()]).apply(&[StepOp::Negate]),
        );
        registry.insert(
            TaskLabel::with_mode(TaskKind::Up, UnionMode::DeMorgan),
            QueryShape::and(vec![negated_hop(), negated_hop()])
                .apply(&[StepOp::Negate, StepOp::Project]),
        );

        registry
    }

    fn insert(&mut self, label: TaskLabel, shape: QueryShape) {
        self.by_key.insert((label.kind, label.mode), shape.clone());
        self.by_shape.insert(shape, label);
    }

    /// Resolve a task to its shape under the given union mode.
    ///
    /// Non-union tasks have a single shape; union tasks have one per mode.
    pub fn shape_for(&self, kind: TaskKind, mode: UnionMode) -> Result<&QueryShape> {
        let key = (kind, kind.has_union().then_some(mode));
        self.by_key
            .get(&key)
            .ok_or_else(|| Error::UnknownTask(kind.as_str().to_string()))
    }

    /// Reverse lookup: the label of a catalogue shape.
    ///
    /// Total over every shape the loaders can produce; anything else is a
    /// configuration error.
    pub fn label_of(&self, shape: &QueryShape) -> Result<TaskLabel> {
        self.by_shape
            .get(shape)
            .copied()
            .ok_or_else(|| Error::UnregisteredStructure(shape.to_string()))
    }

    pub fn contains(&self, shape: &QueryShape) -> bool {
        self.by_shape.contains_key(shape)
    }

    pub fn len(&self) -> usize {
        self.by_shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_shape.is_empty()
    }

    /// All entries sorted by label, for stable logging.
    pub fn entries_sorted(&self) -> Vec<(TaskLabel, &QueryShape)> {
        let mut entries: Vec<_> = self
            .by_shape
            .iter()
            .map(|(shape, label)| (*label, shape))
            .collect();
        entries.sort_by_key(|(label, _)| *label);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_has_sixteen_entries() {
        let registry = StructureRegistry::catalogue();
        assert_eq!(registry.len(), 16);
    }

    #[test]
    fn every_entry_round_trips() {
        let registry = StructureRegistry::catalogue();
        for mode in [UnionMode::Dnf, UnionMode::DeMorgan] {
            for kind in TaskKind::ALL {
                let shape = registry.shape_for(kind, mode).unwrap();
                let label = registry.label_of(shape).unwrap();
                assert_eq!(label.kind, kind);
                if kind.has_union() {
                    assert_eq!(label.mode, Some(mode));
                } else {
                    assert_eq!(label.mode, None);
                }
            }
        }
    }

    #[test]
    fn union_modes_resolve_distinct_shapes() {
        let registry = StructureRegistry::catalogue();
        let dnf = registry.shape_for(TaskKind::U2, UnionMode::Dnf).unwrap();
        let dm = registry.shape_for(TaskKind::U2, UnionMode::DeMorgan).unwrap();
        assert_ne!(dnf, dm);
        assert!(matches!(dnf, QueryShape::Union(_)));
        assert!(dm.has_negation());
    }

    #[test]
    fn unregistered_shape_is_an_error() {
        let registry = StructureRegistry::catalogue();
        let four_hop = QueryShape::anchor(&[
            StepOp::Project,
            StepOp::Project,
            StepOp::Project,
            StepOp::Project,
        ]);
        let err = registry.label_of(&four_hop).unwrap_err();
        assert!(matches!(err, Error::UnregisteredStructure(_)));
    }

    #[test]
    fn shapes_match_the_canonical_tuple_forms() {
        let registry = StructureRegistry::catalogue();
        let cases = [
            (TaskKind::P1, "(\"e\", (\"r\",))"),
            (TaskKind::P3, "(\"e\", (\"r\", \"r\", \"r\"))"),
            (TaskKind::I2, "((\"e\", (\"r\",)), (\"e\", (\"r\",)))"),
            (TaskKind::Ip, "(((\"e\", (\"r\",)), (\"e\", (\"r\",))), (\"r\",))"),
            (TaskKind::Pi, "((\"e\", (\"r\", \"r\")), (\"e\", (\"r\",)))"),
            (TaskKind::In2, "((\"e\", (\"r\",)), (\"e\", (\"r\", \"n\")))"),
            (
                TaskKind::Pni,
                "((\"e\", (\"r\", \"r\", \"n\")), (\"e\", (\"r\",)))",
            ),
        ];
        for (kind, expected) in cases {
            let shape = registry.shape_for(kind, UnionMode::Dnf).unwrap();
            assert_eq!(shape.to_string(), expected, "{kind}");
        }

        let up_dm = registry.shape_for(TaskKind::Up, UnionMode::DeMorgan).unwrap();
        assert_eq!(
            up_dm.to_string(),
            "(((\"e\", (\"r\", \"n\")), (\"e\", (\"r\", \"n\"))), (\"n\", \"r\"))"
        );
        let up_dnf = registry.shape_for(TaskKind::Up, UnionMode::Dnf).unwrap();
        assert_eq!(
            up_dnf.to_string(),
            "(((\"e\", (\"r\",)), (\"e\", (\"r\",)), (\"u\",)), (\"r\",))"
        );
    }

    #[test]
    fn sorted_entries_are_stable() {
        let registry = StructureRegistry::catalogue();
        let entries = registry.entries_sorted();
        assert_eq!(entries.len(), 16);
        let labels: Vec<String> = entries.iter().map(|(l, _)| l.to_string()).collect();
        let mut sorted = labels.clone();
        sorted.sort();
        // sorted by TaskLabel, which orders by kind first
        assert_eq!(labels[0], "1p");
        assert_ne!(labels, sorted); // label ordering is catalogue order, not lexicographic
    }
}
