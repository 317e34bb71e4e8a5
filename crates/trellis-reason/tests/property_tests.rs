use proptest::prelude::*;
use trellis_reason::{QueryShape, StepOp, StructureRegistry, TaskKind, UnionMode};

fn arb_steps() -> impl Strategy<Value = Vec<StepOp>> {
    prop::collection::vec(
        prop_oneof![Just(StepOp::Project), Just(StepOp::Negate)],
        1..4,
    )
}

fn arb_shape() -> impl Strategy<Value = QueryShape> {
    let leaf = arb_steps().prop_map(QueryShape::Anchor);
    leaf.prop_recursive(
        3,  // levels deep
        24, // nodes total
        3,  // max branch width
        |inner| {
            prop_oneof![
                (inner.clone(), arb_steps()).prop_map(|(s, ops)| s.apply(&ops)),
                prop::collection::vec(inner.clone(), 2..4).prop_map(QueryShape::and),
                prop::collection::vec(inner, 2..4).prop_map(QueryShape::or),
            ]
        },
    )
}

proptest! {
    #[test]
    fn prop_shapes_round_trip_through_bincode(shape in arb_shape()) {
        let bytes = bincode::serialize(&shape).unwrap();
        let back: QueryShape = bincode::deserialize(&bytes).unwrap();
        prop_assert_eq!(back, shape);
    }

    #[test]
    fn prop_rendering_is_balanced(shape in arb_shape()) {
        let text = shape.to_string();
        prop_assert!(text.starts_with('('));
        let mut depth: i64 = 0;
        for c in text.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            prop_assert!(depth >= 0);
        }
        prop_assert_eq!(depth, 0);
    }

    #[test]
    fn prop_arity_is_positive(shape in arb_shape()) {
        prop_assert!(shape.arity() >= 1);
    }

    #[test]
    fn prop_registry_lookups_agree(shape in arb_shape()) {
        // Either the shape is catalogued and both directions agree, or the
        // reverse lookup reports it as unregistered.
        let registry = StructureRegistry::catalogue();
        match registry.label_of(&shape) {
            Ok(label) => {
                let mode = label.mode.unwrap_or(UnionMode::Dnf);
                let registered = registry.shape_for(label.kind, mode).unwrap();
                prop_assert_eq!(registered, &shape);
            }
            Err(err) => {
                prop_assert!(err.to_string().contains("unregistered"));
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_union_tasks_need_a_mode_suffix(kind in prop::sample::select(&TaskKind::ALL[..])) {
        let registry = StructureRegistry::catalogue();
        let dnf = registry.shape_for(kind, UnionMode::Dnf).unwrap().clone();
        let dm = registry.shape_for(kind, UnionMode::DeMorgan).unwrap().clone();
        if kind.has_union() {
            prop_assert_ne!(dnf, dm);
        } else {
            prop_assert_eq!(dnf, dm);
        }
    }
}
