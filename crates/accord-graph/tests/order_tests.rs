use accord_graph::{DependencyGraph, GraphError, NodeDefinition};
use proptest::prelude::*;

/// Random DAG: node `i` may only depend on nodes with a smaller index, so the
/// input is acyclic by construction. Names are shuffled relative to indices.
fn dag_strategy() -> impl Strategy<Value = Vec<NodeDefinition>> {
    (1..24usize).prop_flat_map(|count| {
        let deps = proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), count);
        let names = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
        (deps, names).prop_map(move |(deps, names)| {
            deps.into_iter()
                .enumerate()
                .map(|(i, picks)| {
                    let mut def = NodeDefinition::regular(format!("n{:02}", names[i]));
                    if i > 0 {
                        for pick in picks {
                            def = def.depends_on(format!("n{:02}", names[pick.index(i)]));
                        }
                    }
                    def
                })
                .collect()
        })
    })
}

proptest! {
    #[test]
    fn prop_order_respects_dependencies(defs in dag_strategy()) {
        let graph = DependencyGraph::build(defs.clone(), Vec::new()).unwrap();
        let order = graph.activation_order();
        prop_assert_eq!(order.len(), defs.len());

        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        for def in &defs {
            for dep in &def.dependencies {
                prop_assert!(position(dep) < position(&def.name));
            }
        }
    }

    #[test]
    fn prop_order_is_reproducible(defs in dag_strategy()) {
        let first = DependencyGraph::build(defs.clone(), Vec::new()).unwrap();
        let mut reversed = defs;
        reversed.reverse();
        let second = DependencyGraph::build(reversed, Vec::new()).unwrap();
        prop_assert_eq!(first.activation_order(), second.activation_order());
    }

    #[test]
    fn prop_back_edge_creates_cycle(defs in dag_strategy()) {
        // Close a cycle by making some dependency depend on its dependent.
        let victim = defs.iter().find(|d| !d.dependencies.is_empty()).cloned();
        prop_assume!(victim.is_some());
        let victim = victim.unwrap();
        let dep = victim.dependencies.iter().next().unwrap().clone();
        let defs: Vec<_> = defs
            .into_iter()
            .map(|d| if d.name == dep { d.depends_on(victim.name.clone()) } else { d })
            .collect();

        match DependencyGraph::build(defs, Vec::new()) {
            Err(GraphError::Cycle(cycle)) => {
                prop_assert!(cycle.cycle.contains(&cycle.member));
                prop_assert!(cycle.cycle.contains(&victim.name));
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other.map(|g| g.len())),
        }
    }
}

#[test]
fn scenario_chain_activation_order() {
    let graph = DependencyGraph::build(
        vec![
            NodeDefinition::regular("Z").depends_on("Y"),
            NodeDefinition::regular("Y").depends_on("X"),
            NodeDefinition::regular("X"),
        ],
        Vec::new(),
    )
    .unwrap();

    assert_eq!(graph.activation_order(), ["X", "Y", "Z"]);
}

#[test]
fn two_node_cycle_is_rejected() {
    let result = DependencyGraph::build(
        vec![
            NodeDefinition::regular("a").depends_on("b"),
            NodeDefinition::regular("b").depends_on("a"),
        ],
        Vec::new(),
    );

    let err = result.unwrap_err();
    let cycle = err.as_cycle().expect("cycle error");
    assert_eq!(cycle.cycle, ["a", "b"]);
}
